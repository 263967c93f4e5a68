use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{is_transient, MediaQueue, RtpError, RtpPacketizer};
use crate::server::agent::{AgentConfig, CallState, MediaFraming, SignalingState};

/// Outbound media worker: outbound queue -> caller's UDP endpoint
pub struct RtpSender {
    config: Arc<AgentConfig>,
    socket: UdpSocket,
    remote: SocketAddr,
}

impl RtpSender {
    /// Bind an ephemeral port on the local RTP interface, targeting `remote`
    pub async fn bind(config: Arc<AgentConfig>, remote: SocketAddr) -> Result<Self, RtpError> {
        let addr = format!("{}:0", config.rtp_local_ip());
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| RtpError::Bind { addr, source })?;

        tracing::info!("{} RTP sender targeting {}", config.agent_name(), remote);

        Ok(Self {
            config,
            socket,
            remote,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RtpError> {
        self.socket.local_addr().map_err(RtpError::Send)
    }

    /// Drain the outbound queue until cancelled or a fatal socket error
    pub async fn run(
        self,
        outbound: Arc<MediaQueue>,
        state: Arc<CallState>,
        cancel: CancellationToken,
    ) -> Result<(), RtpError> {
        let name = self.config.agent_name();
        let mut packetizer = match self.config.media_framing() {
            MediaFraming::Packet => None,
            MediaFraming::Payload => Some(RtpPacketizer::new(self.config.codec().payload_type())),
        };
        let mut sent: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = outbound.pop() => chunk,
            };

            let datagram = match packetizer.as_mut() {
                Some(packetizer) => packetizer.packetize(chunk).encode(),
                None => chunk,
            };

            match self.socket.send_to(&datagram, self.remote).await {
                Ok(_) => sent += 1,
                Err(e) if is_transient(&e) => {
                    tracing::warn!("{} RTP send error (continuing): {}", name, e);
                }
                Err(e) => {
                    tracing::error!("{} RTP send failed: {}", name, e);
                    state.transition(SignalingState::Disconnected);
                    return Err(RtpError::Send(e));
                }
            }
        }

        tracing::info!("{} RTP sender stopped ({} packets)", name, sent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::agent::config::tests::sample_builder;
    use crate::server::rtp::RtpPacket;
    use bytes::Bytes;
    use std::time::Duration;

    async fn run_sender(
        framing: MediaFraming,
    ) -> (UdpSocket, Arc<MediaQueue>, CancellationToken, tokio::task::JoinHandle<Result<(), RtpError>>) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = Arc::new(sample_builder().media_framing(framing).build().unwrap());
        let sender = RtpSender::bind(config, peer.local_addr().unwrap()).await.unwrap();

        let outbound = Arc::new(MediaQueue::new("outbound", 16));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(sender.run(
            outbound.clone(),
            Arc::new(CallState::new("agent1")),
            cancel.clone(),
        ));
        (peer, outbound, cancel, worker)
    }

    #[tokio::test]
    async fn test_sends_chunks_verbatim_in_order() {
        let (peer, outbound, cancel, worker) = run_sender(MediaFraming::Packet).await;

        outbound.push(Bytes::from_static(b"first"));
        outbound.push(Bytes::from_static(b"second"));

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"first");
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"second");

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_payload_framing_packetizes() {
        let (peer, outbound, cancel, worker) = run_sender(MediaFraming::Payload).await;

        outbound.push(Bytes::from(vec![0xFFu8; 160]));

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let packet = RtpPacket::decode(&buf[..len]).unwrap();
        assert_eq!(packet.header.payload_type, 0);
        assert!(packet.header.marker);
        assert_eq!(packet.payload_len(), 160);

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }
}
