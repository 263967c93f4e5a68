use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::server::agent::{
    AgentConfig, ConfigError, MediaFraming, SignalingState, SipCodec, SipTransport,
};

/// Agent definition accepted by the control API and the YAML agent files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAgentRequest {
    #[serde(rename = "agentName")]
    pub agent_name: String,
    #[serde(rename = "transportMode", default = "default_transport")]
    pub transport_mode: String,
    pub password: String,

    #[serde(rename = "sipLocalIp")]
    pub sip_local_ip: Option<String>,
    #[serde(rename = "sipLocalPort")]
    pub sip_local_port: Option<u16>,
    #[serde(rename = "sipLocalUsername")]
    pub sip_local_username: String,
    #[serde(rename = "sipLocalRealm", default)]
    pub sip_local_realm: String,
    #[serde(rename = "sipLocalDisplayName", default)]
    pub sip_local_display_name: String,

    #[serde(rename = "sipRegistrarIp")]
    pub sip_registrar_ip: String,
    #[serde(rename = "sipRegistrarPort")]
    pub sip_registrar_port: Option<u16>,
    #[serde(rename = "sipRegisterExpiryTimeSec")]
    pub sip_register_expiry_secs: Option<u32>,
    #[serde(rename = "sipAllowedMethods")]
    pub sip_allowed_methods: Option<Vec<String>>,

    #[serde(rename = "rtpLocalIp")]
    pub rtp_local_ip: Option<String>,
    #[serde(rename = "rtpLocalPort")]
    pub rtp_local_port: u16,
    #[serde(rename = "rtpAddressType")]
    pub rtp_address_type: Option<String>,
    #[serde(rename = "rtpNetworkType")]
    pub rtp_network_type: Option<String>,
    #[serde(rename = "rtpPayloadSize")]
    pub rtp_payload_size: Option<usize>,

    pub codec: Option<SipCodec>,
    #[serde(rename = "mediaFraming")]
    pub media_framing: Option<MediaFraming>,
    #[serde(rename = "queueCapacity")]
    pub queue_capacity: Option<usize>,

    #[serde(rename = "wsServerUri")]
    pub ws_server_uri: String,
}

fn default_transport() -> String {
    "UDP".to_string()
}

impl StartAgentRequest {
    /// Validate into an [`AgentConfig`]; absent fields take the builder defaults
    pub fn into_config(self) -> Result<AgentConfig, ConfigError> {
        let transport =
            SipTransport::parse(&self.transport_mode).ok_or_else(|| ConfigError::Invalid {
                field: "transportMode",
                reason: format!("unknown transport {}", self.transport_mode),
            })?;

        let mut builder = AgentConfig::builder(self.agent_name, transport, self.password)
            .sip_local(
                self.sip_local_ip.as_deref().unwrap_or("127.0.0.1"),
                self.sip_local_port.unwrap_or(transport.default_port()),
            )
            .sip_identity(
                &self.sip_local_username,
                &self.sip_local_realm,
                &self.sip_local_display_name,
            )
            .registrar(
                &self.sip_registrar_ip,
                self.sip_registrar_port.unwrap_or(transport.default_port()),
            )
            .rtp_local(
                self.rtp_local_ip.as_deref().unwrap_or("127.0.0.1"),
                self.rtp_local_port,
            )
            .rtp_expected(
                self.rtp_address_type.as_deref().unwrap_or("IP4"),
                self.rtp_network_type.as_deref().unwrap_or("IN"),
            )
            .ws_server_uri(&self.ws_server_uri);

        if let Some(secs) = self.sip_register_expiry_secs {
            builder = builder.register_expiry_secs(secs);
        }
        if let Some(methods) = self.sip_allowed_methods {
            builder = builder.allowed_methods(methods);
        }
        if let Some(size) = self.rtp_payload_size {
            builder = builder.rtp_payload_size(size);
        }
        if let Some(codec) = self.codec {
            builder = builder.codec(codec);
        }
        if let Some(framing) = self.media_framing {
            builder = builder.media_framing(framing);
        }
        if let Some(capacity) = self.queue_capacity {
            builder = builder.queue_capacity(capacity);
        }

        builder.build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAgentResponse {
    #[serde(rename = "agentName")]
    pub agent_name: String,
    pub status: String,
}

/// One managed agent as reported by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusView {
    pub name: String,
    pub state: SignalingState,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
}
