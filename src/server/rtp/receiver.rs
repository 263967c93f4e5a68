use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{is_transient, MediaQueue, RtpError, RtpPacket};
use crate::server::agent::{AgentConfig, CallState, MediaFraming, SignalingState};

/// Inbound media worker: caller's UDP stream -> inbound queue
pub struct RtpReceiver {
    config: Arc<AgentConfig>,
    socket: UdpSocket,
}

impl RtpReceiver {
    /// Bind the configured local RTP address
    pub async fn bind(config: Arc<AgentConfig>) -> Result<Self, RtpError> {
        let addr = format!("{}:{}", config.rtp_local_ip(), config.rtp_local_port());
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| RtpError::Bind { addr, source })?;

        tracing::info!(
            "{} RTP receiver listening on {}",
            config.agent_name(),
            socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );

        Ok(Self { config, socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RtpError> {
        self.socket.local_addr().map_err(RtpError::Receive)
    }

    /// Receive until cancelled or a fatal socket error. The socket is released on return.
    pub async fn run(
        self,
        inbound: Arc<MediaQueue>,
        state: Arc<CallState>,
        cancel: CancellationToken,
    ) -> Result<(), RtpError> {
        let name = self.config.agent_name();
        let framing = self.config.media_framing();
        let receive_timeout = self.config.rtp_receive_timeout();
        let packet_size = self.config.rtp_packet_size();
        // One spare byte tells a datagram that fills the packet size from a larger one
        let mut buf = vec![0u8; packet_size + 1];
        let mut received: u64 = 0;
        let mut invalid: u64 = 0;
        let mut truncated: u64 = 0;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(receive_timeout, self.socket.recv_from(&mut buf)) => result,
            };

            let (mut len, from) = match result {
                // Timeout: just re-check the stop flag
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_transient(&e) => {
                    tracing::warn!("{} RTP receive error (continuing): {}", name, e);
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::error!("{} RTP receive failed: {}", name, e);
                    state.transition(SignalingState::Disconnected);
                    return Err(RtpError::Receive(e));
                }
            };

            if len > packet_size {
                truncated += 1;
                if truncated == 1 {
                    tracing::warn!(
                        "{} datagram from {} exceeds the {}-byte RTP packet size, truncating",
                        name,
                        from,
                        packet_size
                    );
                } else {
                    tracing::debug!("{} truncated oversized datagram ({} so far)", name, truncated);
                }
                len = packet_size;
            }

            let Some(packet) = RtpPacket::decode(&buf[..len]) else {
                invalid += 1;
                tracing::debug!(
                    "{} dropped {}-byte datagram from {} ({} invalid so far)",
                    name,
                    len,
                    from,
                    invalid
                );
                continue;
            };

            let chunk = match framing {
                MediaFraming::Packet => Bytes::copy_from_slice(&buf[..len]),
                MediaFraming::Payload => packet.payload,
            };
            inbound.push(chunk);

            received += 1;
            if received == 1 {
                tracing::info!("{} first RTP packet from {}", name, from);
            }
        }

        tracing::info!(
            "{} RTP receiver stopped ({} packets, {} invalid, {} truncated)",
            name,
            received,
            invalid,
            truncated
        );
        Ok(())
    }
}
