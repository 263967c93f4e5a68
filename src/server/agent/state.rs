//! Shared per-call state
//!
//! The signaling state and the last WebSocket close code, read and written by
//! every worker of one call. State changes are the only way workers report
//! call-ending failures to the orchestrator.

use serde::Serialize;
use tokio::sync::{watch, RwLock};

/// SIP signaling state of one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalingState {
    /// Initial state, no REGISTER answered yet
    Unregistered,
    /// Registrar accepted our REGISTER
    Registered,
    /// INVITE received and being answered
    Connecting,
    /// Call answered, remote media address known
    Connected,
    /// Call over
    Disconnected,
    /// Registrar rejected us
    RegistrationFailed,
}

impl SignalingState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: SignalingState) -> bool {
        use SignalingState::*;

        match (self, next) {
            (Unregistered, Registered | RegistrationFailed | Disconnected) => true,
            (Registered, Registered | Connecting | RegistrationFailed | Disconnected) => true,
            (Connecting, Connected | Disconnected) => true,
            (Connected, Disconnected) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SignalingState::Disconnected | SignalingState::RegistrationFailed
        )
    }

    /// A call is in progress (answered or being answered)
    pub fn in_call(self) -> bool {
        matches!(self, SignalingState::Connecting | SignalingState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingState::Unregistered => "UNREGISTERED",
            SignalingState::Registered => "REGISTERED",
            SignalingState::Connecting => "CONNECTING",
            SignalingState::Connected => "CONNECTED",
            SignalingState::Disconnected => "DISCONNECTED",
            SignalingState::RegistrationFailed => "REGISTRATION_FAILED",
        }
    }
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state shared by all workers of one call
#[derive(Debug)]
pub struct CallState {
    agent_name: String,
    signaling: watch::Sender<SignalingState>,
    ws_close_code: RwLock<Option<u16>>,
}

impl CallState {
    pub fn new(agent_name: impl Into<String>) -> Self {
        let (signaling, _) = watch::channel(SignalingState::Unregistered);
        Self {
            agent_name: agent_name.into(),
            signaling,
            ws_close_code: RwLock::new(None),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Current signaling state
    pub fn signaling_state(&self) -> SignalingState {
        *self.signaling.borrow()
    }

    /// Move to `next` if the edge is legal. Returns whether the state is now `next`.
    pub fn transition(&self, next: SignalingState) -> bool {
        let mut accepted = false;
        let mut previous = next;

        self.signaling.send_if_modified(|current| {
            previous = *current;
            if current.can_transition_to(next) {
                accepted = true;
                let changed = *current != next;
                *current = next;
                changed
            } else {
                false
            }
        });

        if accepted {
            if previous != next {
                tracing::info!("{} signaling state {} -> {}", self.agent_name, previous, next);
            }
        } else {
            tracing::warn!(
                "{} refused signaling transition {} -> {}",
                self.agent_name,
                previous,
                next
            );
        }

        accepted
    }

    /// Watch signaling state changes
    pub fn subscribe(&self) -> watch::Receiver<SignalingState> {
        self.signaling.subscribe()
    }

    /// Wait until the call reaches a terminal state
    pub async fn terminated(&self) -> SignalingState {
        let mut rx = self.subscribe();
        let terminal = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // Sender lives in self, so it cannot be dropped while we borrow it
            Err(_) => self.signaling_state(),
        };
        terminal
    }

    /// Close code of the last WebSocket close, if any
    pub async fn ws_close_code(&self) -> Option<u16> {
        *self.ws_close_code.read().await
    }

    pub async fn set_ws_close_code(&self, code: u16) {
        *self.ws_close_code.write().await = Some(code);
    }

    /// Forget the previous connection's close code
    pub async fn clear_ws_close_code(&self) {
        *self.ws_close_code.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use SignalingState::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = CallState::new("agent");
        assert_eq!(state.signaling_state(), Unregistered);

        assert!(state.transition(Registered));
        assert!(state.transition(Connecting));
        assert!(state.transition(Connected));
        assert!(state.transition(Disconnected));
        assert_eq!(state.signaling_state(), Disconnected);
    }

    #[test]
    fn test_connected_requires_registered_and_connecting() {
        let state = CallState::new("agent");
        assert!(!state.transition(Connected));
        assert!(!state.transition(Connecting));
        assert_eq!(state.signaling_state(), Unregistered);

        assert!(state.transition(Registered));
        assert!(!state.transition(Connected));
        assert_eq!(state.signaling_state(), Registered);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Disconnected, RegistrationFailed] {
            for next in [Unregistered, Registered, Connecting, Connected, Disconnected, RegistrationFailed] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_registration_failure_only_before_call() {
        assert!(Unregistered.can_transition_to(RegistrationFailed));
        assert!(Registered.can_transition_to(RegistrationFailed));
        assert!(!Connecting.can_transition_to(RegistrationFailed));
        assert!(!Connected.can_transition_to(RegistrationFailed));
    }

    #[test]
    fn test_display_matches_wire_names() {
        assert_eq!(RegistrationFailed.to_string(), "REGISTRATION_FAILED");
        assert_eq!(
            serde_json::to_string(&RegistrationFailed).unwrap(),
            "\"REGISTRATION_FAILED\""
        );
    }

    #[tokio::test]
    async fn test_ws_close_code() {
        let state = CallState::new("agent");
        assert_eq!(state.ws_close_code().await, None);
        state.set_ws_close_code(1006).await;
        assert_eq!(state.ws_close_code().await, Some(1006));
        state.clear_ws_close_code().await;
        assert_eq!(state.ws_close_code().await, None);
    }

    #[tokio::test]
    async fn test_terminated_wakes_waiter() {
        let state = Arc::new(CallState::new("agent"));
        state.transition(Registered);

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.terminated().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        state.transition(Disconnected);

        let final_state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state, Disconnected);
    }
}
