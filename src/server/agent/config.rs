//! Agent Configuration
//!
//! One immutable configuration per call attempt: SIP identity and registrar,
//! RTP addressing, and the bot backend's WebSocket endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::rtp::RTP_HEADER_SIZE;

/// SIP transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SipTransport {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl SipTransport {
    pub fn default_port(&self) -> u16 {
        match self {
            SipTransport::Udp | SipTransport::Tcp => 5060,
            SipTransport::Tls => 5061,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "UDP" => Some(SipTransport::Udp),
            "TCP" => Some(SipTransport::Tcp),
            "TLS" => Some(SipTransport::Tls),
            _ => None,
        }
    }
}

impl std::fmt::Display for SipTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipTransport::Udp => write!(f, "UDP"),
            SipTransport::Tcp => write!(f, "TCP"),
            SipTransport::Tls => write!(f, "TLS"),
        }
    }
}

/// Audio codec advertised in the SDP answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SipCodec {
    /// G.711 μ-law (US standard) - Payload type 0
    #[default]
    Pcmu,
    /// G.711 A-law (EU standard) - Payload type 8
    Pcma,
}

impl SipCodec {
    /// RTP payload type number
    pub fn payload_type(&self) -> u8 {
        match self {
            SipCodec::Pcmu => 0,
            SipCodec::Pcma => 8,
        }
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        8000 // G.711 always uses 8kHz
    }

    /// Codec name for SDP
    pub fn sdp_name(&self) -> &'static str {
        match self {
            SipCodec::Pcmu => "PCMU",
            SipCodec::Pcma => "PCMA",
        }
    }
}

/// What one WebSocket frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFraming {
    /// Whole RTP datagrams, forwarded verbatim in both directions
    #[default]
    Packet,
    /// Bare payloads; the gateway strips and adds RTP headers itself
    Payload,
}

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Immutable per-call agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    agent_name: String,
    transport: SipTransport,
    password: String,

    sip_local_ip: String,
    sip_local_port: u16,
    sip_local_username: String,
    sip_local_realm: String,
    sip_local_display_name: String,
    sip_registrar_ip: String,
    sip_registrar_port: u16,
    sip_register_expiry_secs: u32,
    sip_allowed_methods: Vec<String>,
    sip_local_tag: String,
    user_agent: String,

    rtp_local_ip: String,
    rtp_local_port: u16,
    rtp_address_type: String,
    rtp_network_type: String,
    rtp_payload_size: usize,
    rtp_receive_timeout: Duration,
    codec: SipCodec,
    media_framing: MediaFraming,
    queue_capacity: usize,

    ws_server_uri: String,
}

impl AgentConfig {
    pub fn builder(
        agent_name: impl Into<String>,
        transport: SipTransport,
        password: impl Into<String>,
    ) -> AgentConfigBuilder {
        AgentConfigBuilder::new(agent_name, transport, password)
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn transport(&self) -> SipTransport {
        self.transport
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn sip_local_ip(&self) -> &str {
        &self.sip_local_ip
    }

    /// Configured SIP port; 0 means "any free port"
    pub fn sip_local_port(&self) -> u16 {
        self.sip_local_port
    }

    pub fn sip_local_username(&self) -> &str {
        &self.sip_local_username
    }

    pub fn sip_local_realm(&self) -> &str {
        &self.sip_local_realm
    }

    pub fn sip_local_display_name(&self) -> &str {
        &self.sip_local_display_name
    }

    pub fn sip_registrar_ip(&self) -> &str {
        &self.sip_registrar_ip
    }

    pub fn sip_registrar_port(&self) -> u16 {
        self.sip_registrar_port
    }

    pub fn register_expiry_secs(&self) -> u32 {
        self.sip_register_expiry_secs
    }

    /// Interval between REGISTER refreshes: half the expiry
    pub fn register_refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sip_register_expiry_secs / 2).max(1))
    }

    pub fn allowed_methods(&self) -> &[String] {
        &self.sip_allowed_methods
    }

    /// Tag placed on the From header of our REGISTER requests
    pub fn local_tag(&self) -> &str {
        &self.sip_local_tag
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn rtp_local_ip(&self) -> &str {
        &self.rtp_local_ip
    }

    pub fn rtp_local_port(&self) -> u16 {
        self.rtp_local_port
    }

    /// Address type the caller's SDP must carry, e.g. "IP4"
    pub fn rtp_address_type(&self) -> &str {
        &self.rtp_address_type
    }

    /// Network type the caller's SDP must carry, e.g. "IN"
    pub fn rtp_network_type(&self) -> &str {
        &self.rtp_network_type
    }

    pub fn rtp_payload_size(&self) -> usize {
        self.rtp_payload_size
    }

    /// Header + payload
    pub fn rtp_packet_size(&self) -> usize {
        RTP_HEADER_SIZE + self.rtp_payload_size
    }

    pub fn rtp_receive_timeout(&self) -> Duration {
        self.rtp_receive_timeout
    }

    pub fn codec(&self) -> SipCodec {
        self.codec
    }

    pub fn media_framing(&self) -> MediaFraming {
        self.media_framing
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn ws_server_uri(&self) -> &str {
        &self.ws_server_uri
    }
}

/// Builder for [`AgentConfig`]
#[derive(Debug, Clone)]
pub struct AgentConfigBuilder {
    agent_name: String,
    transport: SipTransport,
    password: String,

    sip_local_ip: String,
    sip_local_port: u16,
    sip_local_username: String,
    sip_local_realm: String,
    sip_local_display_name: String,
    sip_registrar_ip: String,
    sip_registrar_port: u16,
    sip_register_expiry_secs: u32,
    sip_allowed_methods: Vec<String>,
    user_agent: String,

    rtp_local_ip: String,
    rtp_local_port: u16,
    rtp_address_type: String,
    rtp_network_type: String,
    rtp_payload_size: usize,
    rtp_receive_timeout: Duration,
    codec: SipCodec,
    media_framing: MediaFraming,
    queue_capacity: usize,

    ws_server_uri: String,
}

impl AgentConfigBuilder {
    pub fn new(
        agent_name: impl Into<String>,
        transport: SipTransport,
        password: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            transport,
            password: password.into(),
            sip_local_ip: "127.0.0.1".to_string(),
            sip_local_port: transport.default_port(),
            sip_local_username: String::new(),
            sip_local_realm: String::new(),
            sip_local_display_name: String::new(),
            sip_registrar_ip: String::new(),
            sip_registrar_port: transport.default_port(),
            sip_register_expiry_secs: 3600,
            sip_allowed_methods: ["INVITE", "BYE", "CANCEL", "ACK"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            user_agent: format!("voice-bot-gateway/{}", env!("CARGO_PKG_VERSION")),
            rtp_local_ip: "127.0.0.1".to_string(),
            rtp_local_port: 0,
            rtp_address_type: "IP4".to_string(),
            rtp_network_type: "IN".to_string(),
            rtp_payload_size: 160,
            rtp_receive_timeout: Duration::from_millis(500),
            codec: SipCodec::Pcmu,
            media_framing: MediaFraming::Packet,
            queue_capacity: 256,
            ws_server_uri: String::new(),
        }
    }

    /// Local SIP listening point
    pub fn sip_local(mut self, ip: &str, port: u16) -> Self {
        self.sip_local_ip = ip.to_string();
        self.sip_local_port = port;
        self
    }

    /// SIP identity used in From/To/Contact and digest credentials
    pub fn sip_identity(mut self, username: &str, realm: &str, display_name: &str) -> Self {
        self.sip_local_username = username.to_string();
        self.sip_local_realm = realm.to_string();
        self.sip_local_display_name = display_name.to_string();
        self
    }

    pub fn registrar(mut self, ip: &str, port: u16) -> Self {
        self.sip_registrar_ip = ip.to_string();
        self.sip_registrar_port = port;
        self
    }

    pub fn register_expiry_secs(mut self, secs: u32) -> Self {
        self.sip_register_expiry_secs = secs;
        self
    }

    pub fn allowed_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.sip_allowed_methods = methods
            .into_iter()
            .map(|m| m.as_ref().trim().to_ascii_uppercase())
            .collect();
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    /// Local RTP listening point
    pub fn rtp_local(mut self, ip: &str, port: u16) -> Self {
        self.rtp_local_ip = ip.to_string();
        self.rtp_local_port = port;
        self
    }

    /// Address and network types the caller's SDP is expected to carry
    pub fn rtp_expected(mut self, address_type: &str, network_type: &str) -> Self {
        self.rtp_address_type = address_type.to_string();
        self.rtp_network_type = network_type.to_string();
        self
    }

    pub fn rtp_payload_size(mut self, size: usize) -> Self {
        self.rtp_payload_size = size;
        self
    }

    pub fn rtp_receive_timeout(mut self, timeout: Duration) -> Self {
        self.rtp_receive_timeout = timeout;
        self
    }

    pub fn codec(mut self, codec: SipCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn media_framing(mut self, framing: MediaFraming) -> Self {
        self.media_framing = framing;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn ws_server_uri(mut self, uri: &str) -> Self {
        self.ws_server_uri = uri.to_string();
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        if self.agent_name.trim().is_empty() {
            return Err(ConfigError::Missing("agent name"));
        }
        if self.sip_local_username.is_empty() {
            return Err(ConfigError::Missing("SIP username"));
        }
        if self.sip_registrar_ip.is_empty() {
            return Err(ConfigError::Missing("SIP registrar address"));
        }
        if self.sip_registrar_port == 0 {
            return Err(ConfigError::Invalid {
                field: "SIP registrar port",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.sip_register_expiry_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "registration expiry",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.rtp_local_port == 0 {
            return Err(ConfigError::Invalid {
                field: "RTP local port",
                reason: "must be non-zero, it is advertised in the SDP answer".to_string(),
            });
        }
        if self.rtp_payload_size == 0 {
            return Err(ConfigError::Invalid {
                field: "RTP payload size",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.ws_server_uri.is_empty() {
            return Err(ConfigError::Missing("WebSocket server URI"));
        }
        if !(self.ws_server_uri.starts_with("ws://") || self.ws_server_uri.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                field: "WebSocket server URI",
                reason: format!("expected ws:// or wss://, got {}", self.ws_server_uri),
            });
        }

        let sip_local_realm = if self.sip_local_realm.is_empty() {
            self.sip_registrar_ip.clone()
        } else {
            self.sip_local_realm
        };

        Ok(AgentConfig {
            agent_name: self.agent_name,
            transport: self.transport,
            password: self.password,
            sip_local_ip: self.sip_local_ip,
            sip_local_port: self.sip_local_port,
            sip_local_username: self.sip_local_username,
            sip_local_realm,
            sip_local_display_name: self.sip_local_display_name,
            sip_registrar_ip: self.sip_registrar_ip,
            sip_registrar_port: self.sip_registrar_port,
            sip_register_expiry_secs: self.sip_register_expiry_secs,
            sip_allowed_methods: self.sip_allowed_methods,
            sip_local_tag: uuid::Uuid::new_v4().to_string(),
            user_agent: self.user_agent,
            rtp_local_ip: self.rtp_local_ip,
            rtp_local_port: self.rtp_local_port,
            rtp_address_type: self.rtp_address_type,
            rtp_network_type: self.rtp_network_type,
            rtp_payload_size: self.rtp_payload_size,
            rtp_receive_timeout: self.rtp_receive_timeout,
            codec: self.codec,
            media_framing: self.media_framing,
            queue_capacity: self.queue_capacity,
            ws_server_uri: self.ws_server_uri,
        })
    }
}
