use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

use super::RtpError;

/// Remote media endpoint learned from the caller's SDP
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpAddress {
    port: u16,
    address: String,
    address_type: String,
    network_type: String,
}

impl RtpAddress {
    pub fn new(
        port: u16,
        address: impl Into<String>,
        address_type: impl Into<String>,
        network_type: impl Into<String>,
    ) -> Self {
        Self {
            port,
            address: address.into(),
            address_type: address_type.into(),
            network_type: network_type.into(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// SDP address type, e.g. "IP4"
    pub fn address_type(&self) -> &str {
        &self.address_type
    }

    /// SDP network type, e.g. "IN"
    pub fn network_type(&self) -> &str {
        &self.network_type
    }

    /// Whether the negotiated address/network types are the ones this agent expects
    pub fn matches(&self, address_type: &str, network_type: &str) -> bool {
        self.address_type == address_type && self.network_type == network_type
    }

    /// Resolve to a socket address (the SDP may carry a hostname)
    pub async fn socket_addr(&self) -> Result<SocketAddr, RtpError> {
        tokio::net::lookup_host((self.address.as_str(), self.port))
            .await
            .map_err(|e| RtpError::Resolve(format!("{}: {}", self, e)))?
            .next()
            .ok_or_else(|| RtpError::Resolve(self.to_string()))
    }
}

impl fmt::Display for RtpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}:{}",
            self.network_type, self.address_type, self.address, self.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_expected_types() {
        let addr = RtpAddress::new(40000, "10.0.0.5", "IP4", "IN");
        assert!(addr.matches("IP4", "IN"));
        assert!(!addr.matches("IP6", "IN"));
        assert!(!addr.matches("IP4", "ATM"));
    }

    #[tokio::test]
    async fn test_socket_addr_from_literal() {
        let addr = RtpAddress::new(40000, "127.0.0.1", "IP4", "IN");
        let resolved = addr.socket_addr().await.unwrap();
        assert_eq!(resolved, "127.0.0.1:40000".parse().unwrap());
    }
}
