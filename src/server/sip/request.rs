//! Outgoing request construction

use std::net::SocketAddr;
use std::sync::Arc;

use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Version};
use uuid::Uuid;

use super::digest::{authorization_value, DigestChallenge};
use super::message::{name_addr, set_body};
use super::SipError;
use crate::server::agent::AgentConfig;

/// Builds the REGISTER requests of one engine instance.
///
/// Every request shares one Call-ID; CSeq increases with every request built.
pub struct SipRequestCreator {
    config: Arc<AgentConfig>,
    local_addr: SocketAddr,
    call_id: String,
    cseq: u32,
}

impl SipRequestCreator {
    /// `local_addr` is the bound SIP listening point (the configured port may be 0)
    pub fn new(config: Arc<AgentConfig>, local_addr: SocketAddr) -> Self {
        let call_id = format!("{}@{}", Uuid::new_v4().simple(), config.sip_local_ip());
        Self {
            config,
            local_addr,
            call_id,
            cseq: 0,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// CSeq of the most recently built request
    pub fn last_cseq(&self) -> u32 {
        self.cseq
    }

    /// Request-URI of REGISTER: registrar host and port, no user part
    pub fn register_uri(&self) -> String {
        format!(
            "sip:{}:{}",
            self.config.sip_registrar_ip(),
            self.config.sip_registrar_port()
        )
    }

    /// Contact URI advertised in REGISTER and in the 200 OK to an INVITE
    pub fn contact(&self) -> String {
        name_addr(
            self.config.sip_local_display_name(),
            &format!(
                "sip:{}@{}:{}",
                self.config.sip_local_username(),
                self.config.sip_local_ip(),
                self.local_addr.port()
            ),
        )
    }

    /// Plain REGISTER
    pub fn create_register_request(&mut self) -> Result<Request, SipError> {
        self.build_register(None)
    }

    /// REGISTER answering the `WWW-Authenticate` challenge of a 401
    pub fn create_register_request_with_credentials(
        &mut self,
        www_authenticate: &str,
    ) -> Result<Request, SipError> {
        let challenge = DigestChallenge::parse(www_authenticate)?;
        let authorization = authorization_value(
            &challenge,
            self.config.sip_local_username(),
            self.config.password(),
            "REGISTER",
            &self.register_uri(),
        );
        self.build_register(Some(authorization))
    }

    fn build_register(&mut self, authorization: Option<String>) -> Result<Request, SipError> {
        let uri = rsip::Uri::try_from(self.register_uri())
            .map_err(|e| SipError::Message(format!("Invalid registrar URI: {}", e)))?;

        self.cseq += 1;

        let config = &self.config;
        let aor = format!(
            "sip:{}@{}",
            config.sip_local_username(),
            config.sip_local_realm()
        );
        let identity = name_addr(config.sip_local_display_name(), &aor);

        let mut headers = Headers::default();
        headers.push(Header::Via(rsip::headers::Via::new(format!(
            "SIP/2.0/{} {}:{};branch=z9hG4bK{};rport",
            config.transport(),
            config.sip_local_ip(),
            self.local_addr.port(),
            Uuid::new_v4().simple()
        ))));
        headers.push(Header::MaxForwards(rsip::headers::MaxForwards::new("70")));
        headers.push(Header::From(rsip::headers::From::new(format!(
            "{};tag={}",
            identity,
            config.local_tag()
        ))));
        headers.push(Header::To(rsip::headers::To::new(identity)));
        headers.push(Header::CallId(rsip::headers::CallId::new(self.call_id.clone())));
        headers.push(Header::CSeq(rsip::headers::CSeq::new(format!("{} REGISTER", self.cseq))));
        headers.push(Header::Contact(rsip::headers::Contact::new(self.contact())));
        headers.push(Header::Allow(rsip::headers::Allow::new(
            config.allowed_methods().join(", "),
        )));
        headers.push(Header::Expires(rsip::headers::Expires::new(
            config.register_expiry_secs().to_string(),
        )));
        headers.push(Header::UserAgent(rsip::headers::UserAgent::new(config.user_agent())));
        if let Some(authorization) = authorization {
            headers.push(Header::Authorization(rsip::headers::Authorization::new(authorization)));
        }

        let mut body = Vec::new();
        set_body(&mut headers, &mut body, None);

        Ok(Request {
            method: Method::Register,
            uri,
            version: Version::V2,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::agent::config::tests::sample_builder;
    use crate::server::sip::digest::digest_response;
    use crate::server::sip::message;

    fn creator() -> SipRequestCreator {
        let config = Arc::new(sample_builder().build().unwrap());
        SipRequestCreator::new(config, "127.0.0.1:5070".parse().unwrap())
    }

    #[test]
    fn test_register_headers() {
        let mut creator = creator();
        let request = creator.create_register_request().unwrap();
        let wire = rsip::SipMessage::Request(request).to_string();

        assert!(wire.starts_with("REGISTER sip:127.0.0.1:5060 SIP/2.0\r\n"));
        assert!(wire.contains("Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bK"));
        assert!(wire.contains(";rport"));
        assert!(wire.contains("Max-Forwards: 70"));
        assert!(wire.contains("\"Alice\" <sip:alice@example.com>;tag="));
        assert!(wire.contains("Contact: \"Alice\" <sip:alice@127.0.0.1:5070>"));
        assert!(wire.contains("Allow: INVITE, BYE, CANCEL, ACK"));
        assert!(wire.contains("Expires: 3600"));
        assert!(wire.contains("CSeq: 1 REGISTER"));
        assert!(wire.contains("Content-Length: 0"));
        assert!(!wire.contains("Authorization"));
    }

    #[test]
    fn test_call_id_fixed_and_cseq_increases() {
        let mut creator = creator();

        let first = creator.create_register_request().unwrap();
        let second = creator
            .create_register_request_with_credentials(r#"Digest realm="example.com", nonce="abc123""#)
            .unwrap();
        let third = creator.create_register_request().unwrap();

        for request in [&first, &second, &third] {
            assert_eq!(message::call_id(&request.headers), Some(creator.call_id()));
        }
        assert_eq!(message::cseq(&first.headers).unwrap().0, 1);
        assert_eq!(message::cseq(&second.headers).unwrap().0, 2);
        assert_eq!(message::cseq(&third.headers).unwrap().0, 3);
        assert_eq!(creator.last_cseq(), 3);
    }

    #[test]
    fn test_credentials_carry_digest_response() {
        let mut creator = creator();
        let request = creator
            .create_register_request_with_credentials(r#"Digest realm="example.com", nonce="abc123""#)
            .unwrap();

        assert!(message::has_authorization(&request.headers));
        let expected = digest_response("alice", "example.com", "secret", "REGISTER", "sip:127.0.0.1:5060", "abc123");
        let wire = rsip::SipMessage::Request(request).to_string();
        assert!(wire.contains(&format!("response=\"{}\"", expected)));
    }

    #[test]
    fn test_unsupported_scheme_is_an_error() {
        let mut creator = creator();
        let result = creator.create_register_request_with_credentials(r#"Basic realm="x""#);
        assert!(matches!(result, Err(SipError::Auth(_))));
        assert_eq!(creator.last_cseq(), 0);
    }
}
