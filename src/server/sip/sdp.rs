//! SDP offer parsing and answer generation (RFC 4566 subset)

use super::SipError;
use crate::server::agent::AgentConfig;
use crate::server::rtp::RtpAddress;

/// `c=<nettype> <addrtype> <address>`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Connection {
    network_type: String,
    address_type: String,
    address: String,
}

impl Connection {
    fn parse(value: &str) -> Result<Self, SipError> {
        let mut parts = value.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(network_type), Some(address_type), Some(address)) => Ok(Self {
                network_type: network_type.to_string(),
                address_type: address_type.to_string(),
                // Multicast TTL / address count suffixes
                address: address.split('/').next().unwrap_or(address).to_string(),
            }),
            _ => Err(SipError::Sdp(format!("malformed connection line: c={}", value))),
        }
    }
}

/// Extract the caller's media endpoint from an SDP offer.
///
/// Uses the first media description; its own `c=` line wins over the
/// session-level one.
pub(crate) fn parse_remote_media(sdp: &str) -> Result<RtpAddress, SipError> {
    if sdp.trim().is_empty() {
        return Err(SipError::Sdp("empty body".to_string()));
    }

    let mut session_connection = None;
    let mut media_connection = None;
    let mut media_port = None;

    for line in sdp.lines() {
        let line = line.trim();
        let Some((kind, value)) = line.split_once('=') else {
            continue;
        };

        match kind {
            "m" => {
                if media_port.is_some() {
                    // Only the first stream is used
                    break;
                }
                let port = value
                    .split_whitespace()
                    .nth(1)
                    .and_then(|p| p.split('/').next())
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(|| SipError::Sdp(format!("malformed media line: m={}", value)))?;
                media_port = Some(port);
            }
            "c" if media_port.is_none() => session_connection = Some(Connection::parse(value)?),
            "c" => media_connection = Some(Connection::parse(value)?),
            _ => {}
        }
    }

    let port = media_port.ok_or_else(|| SipError::Sdp("no media description".to_string()))?;
    if port == 0 {
        return Err(SipError::Sdp("media stream rejected (port 0)".to_string()));
    }
    let connection = media_connection
        .or(session_connection)
        .ok_or_else(|| SipError::Sdp("no connection line".to_string()))?;

    Ok(RtpAddress::new(
        port,
        connection.address,
        connection.address_type,
        connection.network_type,
    ))
}

/// SDP answer advertising the agent's RTP listening point and codec
pub(crate) fn build_answer(config: &AgentConfig, session_id: u32) -> String {
    let codec = config.codec();
    let network_type = config.rtp_network_type();
    let address_type = config.rtp_address_type();
    let local_ip = config.rtp_local_ip();

    format!(
        "v=0\r\n\
         o=- {} 1 {} {} {}\r\n\
         s={}\r\n\
         c={} {} {}\r\n\
         t=0 0\r\n\
         m=audio {} RTP/AVP {}\r\n\
         a=rtpmap:{} {}/{}\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n",
        session_id,
        network_type,
        address_type,
        local_ip,
        config.agent_name(),
        network_type,
        address_type,
        local_ip,
        config.rtp_local_port(),
        codec.payload_type(),
        codec.payload_type(),
        codec.sdp_name(),
        codec.sample_rate()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::agent::config::tests::sample_builder;
    use crate::server::agent::SipCodec;

    const OFFER: &str = "v=0\r\n\
        o=carrier 123 456 IN IP4 10.0.0.5\r\n\
        s=call\r\n\
        c=IN IP4 10.0.0.5\r\n\
        t=0 0\r\n\
        m=audio 40000 RTP/AVP 0 8 101\r\n\
        a=rtpmap:0 PCMU/8000\r\n";

    #[test]
    fn test_session_level_connection() {
        let addr = parse_remote_media(OFFER).unwrap();
        assert_eq!(addr, RtpAddress::new(40000, "10.0.0.5", "IP4", "IN"));
    }

    #[test]
    fn test_media_level_connection_wins() {
        let sdp = format!("{}c=IN IP4 192.168.1.9\r\n", OFFER);
        let addr = parse_remote_media(&sdp).unwrap();
        assert_eq!(addr.address(), "192.168.1.9");
        assert_eq!(addr.port(), 40000);
    }

    #[test]
    fn test_ipv6_connection_keeps_types() {
        let sdp = "v=0\r\nc=IN IP6 ::1\r\nm=audio 5004 RTP/AVP 0\r\n";
        let addr = parse_remote_media(sdp).unwrap();
        assert_eq!(addr.address_type(), "IP6");
        assert!(!addr.matches("IP4", "IN"));
    }

    #[test]
    fn test_malformed_offers() {
        assert!(matches!(parse_remote_media(""), Err(SipError::Sdp(_))));
        assert!(matches!(
            parse_remote_media("v=0\r\nc=IN IP4 10.0.0.5\r\n"),
            Err(SipError::Sdp(_))
        ));
        assert!(matches!(
            parse_remote_media("v=0\r\nm=audio 40000 RTP/AVP 0\r\n"),
            Err(SipError::Sdp(_))
        ));
        assert!(matches!(
            parse_remote_media("v=0\r\nc=IN IP4 10.0.0.5\r\nm=audio 0 RTP/AVP 0\r\n"),
            Err(SipError::Sdp(_))
        ));
        assert!(matches!(
            parse_remote_media("v=0\r\nc=IN\r\nm=audio 40000 RTP/AVP 0\r\n"),
            Err(SipError::Sdp(_))
        ));
    }

    #[test]
    fn test_answer_advertises_local_media() {
        let config = sample_builder().codec(SipCodec::Pcma).build().unwrap();
        let answer = build_answer(&config, 7);

        assert!(answer.contains("c=IN IP4 127.0.0.1\r\n"));
        assert!(answer.contains("m=audio 40010 RTP/AVP 8\r\n"));
        assert!(answer.contains("a=rtpmap:8 PCMA/8000\r\n"));
        assert!(answer.contains("a=sendrecv"));

        // The answer is itself a parseable offer
        let addr = parse_remote_media(&answer).unwrap();
        assert_eq!(addr.port(), 40010);
    }
}
