//! RTP media plumbing
//!
//! Wire format, the negotiated remote endpoint, and the UDP workers that move
//! raw media bytes between the network and the in-process queues.

mod address;
mod packet;
mod queue;
mod receiver;
mod sender;

pub use address::RtpAddress;
pub use packet::{RtpHeader, RtpPacket, RtpPacketizer, RTP_HEADER_SIZE};
pub use queue::MediaQueue;
pub use receiver::RtpReceiver;
pub use sender::RtpSender;

use thiserror::Error;

/// RTP transport errors
#[derive(Error, Debug)]
pub enum RtpError {
    #[error("Failed to bind RTP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("RTP receive failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("RTP send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("Cannot resolve remote RTP address: {0}")]
    Resolve(String),
}

/// Errors a UDP worker logs and survives. Everything else ends the worker.
pub(crate) fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
