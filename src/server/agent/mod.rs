//! Agent: one registered SIP identity answering one call and bridging its
//! media to the bot backend.
//!
//! Lifecycle of a call, in order:
//! 1. the signaling engine registers and waits for an INVITE
//! 2. the negotiated media address is checked against the expected types
//! 3. the RTP receiver binds and starts filling the inbound queue
//! 4. the bot bridge connects
//! 5. the RTP sender starts draining the outbound queue
//! 6. inbound chunks are relayed to the bot until the call is over
//!
//! Teardown stops the receiver, then the sender, closes the bridge and only
//! then releases the call's worker pool.

pub mod config;
mod manager;
mod state;

pub use config::{
    AgentConfig, AgentConfigBuilder, ConfigError, MediaFraming, SipCodec, SipTransport,
};
pub use manager::AgentManager;
pub use state::{CallState, SignalingState};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::rtp::{MediaQueue, RtpError, RtpReceiver, RtpSender};
use super::sip::{SipError, SipSignalingEngine, SipStack};
use super::websocket::{BridgeError, WebSocketBridge};

/// How long teardown waits for workers to notice their stop flag
const POOL_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type WorkerPool = JoinSet<Result<(), AgentError>>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid agent configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("SIP error: {0}")]
    Sip(#[from] SipError),

    #[error("RTP error: {0}")]
    Rtp(#[from] RtpError),

    #[error("Bot bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Negotiated media {negotiated} does not match expected {expected}")]
    MediaMismatch { expected: String, negotiated: String },

    #[error("Agent {0} is already running")]
    AlreadyRunning(String),

    #[error("Failed to load agent config {path}: {reason}")]
    Load { path: String, reason: String },
}

/// One agent and the state of its call
pub struct Agent {
    config: Arc<AgentConfig>,
    state: Arc<CallState>,
}

impl Agent {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let state = Arc::new(CallState::new(config.agent_name()));
        Self { config, state }
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    pub fn state(&self) -> &Arc<CallState> {
        &self.state
    }

    /// Run one call to completion.
    ///
    /// Returns `Ok` when the call ends normally (BYE, CANCEL) or `cancel`
    /// fires. The call state is always terminal once this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), AgentError> {
        let name = self.config.agent_name().to_string();
        let call = cancel.child_token();
        let mut pool = WorkerPool::new();

        tracing::info!("Starting agent {}", name);
        let result = self.run_call(&call, &mut pool).await;

        call.cancel();
        release(&name, pool).await;

        if !self.state.signaling_state().is_terminal() {
            self.state.transition(SignalingState::Disconnected);
        }

        match &result {
            Ok(()) => tracing::info!("Agent {} finished ({})", name, self.state.signaling_state()),
            Err(e) => tracing::error!("Agent {} failed: {}", name, e),
        }
        result
    }

    async fn run_call(&self, call: &CancellationToken, pool: &mut WorkerPool) -> Result<(), AgentError> {
        let name = self.config.agent_name();

        let stack = match SipStack::bind(&self.config).await {
            Ok(stack) => stack,
            Err(e) => {
                self.state.transition(SignalingState::RegistrationFailed);
                return Err(e.into());
            }
        };

        let (engine, remote_media) =
            SipSignalingEngine::new(self.config.clone(), stack, self.state.clone());
        let engine_token = call.child_token();
        pool.spawn(async move { engine.run(engine_token).await.map_err(AgentError::from) });

        let remote = tokio::select! {
            _ = call.cancelled() => {
                tracing::info!("{} stopped before a call was answered", name);
                return Ok(());
            }
            remote = remote_media.wait() => remote?,
        };

        let expected_address_type = self.config.rtp_address_type();
        let expected_network_type = self.config.rtp_network_type();
        if !remote.matches(expected_address_type, expected_network_type) {
            return Err(AgentError::MediaMismatch {
                expected: format!("{} {}", expected_network_type, expected_address_type),
                negotiated: format!("{} {}", remote.network_type(), remote.address_type()),
            });
        }
        let remote_addr = remote.socket_addr().await?;
        tracing::info!("{} negotiated remote media {}", name, remote);

        let capacity = self.config.queue_capacity();
        let inbound = Arc::new(MediaQueue::new("inbound", capacity));
        let outbound = Arc::new(MediaQueue::new("outbound", capacity));

        let receiver = RtpReceiver::bind(self.config.clone()).await?;
        let receiver_token = call.child_token();
        {
            let inbound = inbound.clone();
            let state = self.state.clone();
            let token = receiver_token.clone();
            pool.spawn(async move { receiver.run(inbound, state, token).await.map_err(AgentError::from) });
        }

        let bridge = WebSocketBridge::new(
            name,
            self.config.ws_server_uri(),
            self.state.clone(),
            outbound.clone(),
        );
        let sender_token = call.child_token();

        let mut result = self
            .start_sender(&bridge, pool, remote_addr, outbound, sender_token.clone())
            .await;
        if result.is_ok() {
            result = self.relay(&bridge, &inbound, call).await;
        }

        receiver_token.cancel();
        sender_token.cancel();
        bridge.close().await;

        result
    }

    /// Connect the bot bridge, then start sending its audio to the caller
    async fn start_sender(
        &self,
        bridge: &WebSocketBridge,
        pool: &mut WorkerPool,
        remote_addr: SocketAddr,
        outbound: Arc<MediaQueue>,
        token: CancellationToken,
    ) -> Result<(), AgentError> {
        bridge.connect().await?;

        let sender = RtpSender::bind(self.config.clone(), remote_addr).await?;
        let state = self.state.clone();
        pool.spawn(async move { sender.run(outbound, state, token).await.map_err(AgentError::from) });
        Ok(())
    }

    /// Forward caller audio to the bot until the call reaches a terminal state
    async fn relay(
        &self,
        bridge: &WebSocketBridge,
        inbound: &MediaQueue,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let name = self.config.agent_name();
        let mut signaling = self.state.subscribe();
        let mut relayed: u64 = 0;

        loop {
            if signaling.borrow_and_update().is_terminal() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = signaling.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                chunk = inbound.pop() => {
                    if let Err(e) = bridge.forward(chunk).await {
                        tracing::error!("{} lost the bot connection: {}", name, e);
                        self.state.transition(SignalingState::Disconnected);
                        return Err(e.into());
                    }
                    relayed += 1;
                }
            }
        }

        tracing::info!(
            "{} relay stopped after {} chunks ({} dropped inbound)",
            name,
            relayed,
            inbound.dropped()
        );
        Ok(())
    }
}

/// Wait for the call's workers to stop, then release the pool
async fn release(name: &str, mut pool: WorkerPool) {
    let drained = tokio::time::timeout(POOL_DRAIN_TIMEOUT, async {
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("{} worker ended with error: {}", name, e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!("{} worker panicked: {}", name, e),
            }
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!("{} workers did not stop in time, aborting them", name);
    }
    pool.shutdown().await;
}
