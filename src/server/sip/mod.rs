//! SIP signaling for voice-bot agents
//!
//! A minimal user agent on top of the rsipstack transaction layer (UDP only):
//! - REGISTER with digest authentication and periodic refresh
//! - Inbound INVITE/ACK/BYE/CANCEL for exactly one call
//! - SDP offer parsing and answer generation

mod digest;
mod engine;
mod message;
mod request;
mod sdp;

pub use digest::{DigestChallenge, DigestError};
pub use engine::{RemoteMedia, SipSignalingEngine, SipStack};
pub use request::SipRequestCreator;

use thiserror::Error;

/// SIP-related errors
#[derive(Error, Debug)]
pub enum SipError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Call failed: {0}")]
    CallFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid SIP message: {0}")]
    Message(String),

    #[error("Invalid SDP: {0}")]
    Sdp(String),

    #[error("SIP stack error: {0}")]
    Stack(String),

    #[error("Authentication failed: {0}")]
    Auth(#[from] DigestError),

    #[error("Signaling stopped before the call was answered")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
