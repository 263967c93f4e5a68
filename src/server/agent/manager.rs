//! Registry of running agents behind the control API

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Agent, AgentConfig, AgentError, CallState, SignalingState};
use crate::models::{AgentStatusView, StartAgentRequest};

/// How long a replaced agent gets to release its sockets
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

struct ManagedAgent {
    config: Arc<AgentConfig>,
    state: Arc<CallState>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

impl ManagedAgent {
    fn spawn(config: Arc<AgentConfig>) -> Self {
        let agent = Agent::new(config.clone());
        let state = agent.state().clone();
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            // Failures are logged by the agent and reflected in its state
            let _ = agent.run(token).await;
        });

        Self {
            config,
            state,
            cancel,
            handle,
            started_at: Utc::now(),
        }
    }

    fn is_running(&self) -> bool {
        !self.handle.is_finished() && !self.state.signaling_state().is_terminal()
    }

    /// Cancel the agent and wait for its task, so its ports are free again
    async fn stop(self) {
        let name = self.config.agent_name().to_string();
        self.cancel.cancel();

        let mut handle = self.handle;
        match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::error!("Agent {} task panicked: {}", name, e),
            Err(_) => {
                tracing::warn!("Agent {} did not stop in time, aborting it", name);
                handle.abort();
            }
        }
    }
}

/// Agents keyed by name. Each name runs at most one agent at a time.
pub struct AgentManager {
    agents: RwLock<HashMap<String, ManagedAgent>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Start an agent. A finished agent with the same name is replaced.
    pub async fn start(&self, config: AgentConfig) -> Result<String, AgentError> {
        let name = config.agent_name().to_string();
        let mut agents = self.agents.write().await;

        if agents.get(&name).is_some_and(ManagedAgent::is_running) {
            return Err(AgentError::AlreadyRunning(name));
        }
        if let Some(existing) = agents.remove(&name) {
            existing.stop().await;
        }

        agents.insert(name.clone(), ManagedAgent::spawn(Arc::new(config)));
        tracing::info!("Agent {} started", name);
        Ok(name)
    }

    /// Start the agent described by `agent{id}.yaml` in `dir`
    pub async fn start_from_file(&self, dir: &Path, id: &str) -> Result<String, AgentError> {
        let path = dir.join(format!("agent{}.yaml", id));
        let load_error = |reason: String| AgentError::Load {
            path: path.display().to_string(),
            reason,
        };

        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(load_error(format!("invalid agent id {:?}", id)));
        }

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| load_error(e.to_string()))?;
        let request: StartAgentRequest =
            serde_yaml::from_str(&contents).map_err(|e| load_error(e.to_string()))?;

        self.start(request.into_config()?).await
    }

    /// Every managed agent with its current signaling state, sorted by name
    pub async fn status(&self) -> Vec<AgentStatusView> {
        let agents = self.agents.read().await;
        let mut statuses: Vec<AgentStatusView> = agents
            .iter()
            .map(|(name, managed)| AgentStatusView {
                name: name.clone(),
                state: managed.state.signaling_state(),
                started_at: managed.started_at,
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Replace every DISCONNECTED agent with a fresh one on the same configuration
    pub async fn reconnect(&self) -> Vec<String> {
        let mut agents = self.agents.write().await;
        let disconnected: Vec<String> = agents
            .iter()
            .filter(|(_, managed)| managed.state.signaling_state() == SignalingState::Disconnected)
            .map(|(name, _)| name.clone())
            .collect();

        let mut reconnected = Vec::new();
        for name in disconnected {
            let Some(old) = agents.remove(&name) else {
                continue;
            };
            let config = old.config.clone();
            old.stop().await;
            agents.insert(name.clone(), ManagedAgent::spawn(config));

            tracing::info!("Reconnecting agent {}", name);
            reconnected.push(format!("Reconnected {}", name));
        }

        reconnected.sort();
        reconnected
    }

    /// Stop every agent. Agents stay listed so their final state can be queried.
    pub async fn shutdown(&self) {
        let agents = self.agents.read().await;
        for managed in agents.values() {
            managed.cancel.cancel();
        }
        tracing::info!("Stopping {} agents", agents.len());
    }
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}
