//! Address type for network connections

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Parse an authority (`host:port`, `[v6]:port`, `1.2.3.4:port`).
    ///
    /// A missing port is an error: CONNECT targets always carry one.
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Protocol(format!("Missing port in authority: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Protocol(format!("Invalid port: {}", port)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Protocol(format!("Empty host in authority: {}", s)));
        }

        match host.parse() {
            Ok(ip) => Ok(Address::Socket(SocketAddr::new(ip, port))),
            Err(_) => Ok(Address::Domain(host.to_string(), port)),
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Socket address, if this is not a domain name
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(..) => None,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain() {
        let addr = Address::parse("example.com:443").unwrap();
        assert_eq!(addr, Address::domain("example.com", 443));
        assert_eq!(addr.to_string(), "example.com:443");
    }

    #[test]
    fn test_parse_ipv6_brackets() {
        let addr = Address::parse("[::1]:8443").unwrap();
        assert_eq!(addr, Address::Socket("[::1]:8443".parse().unwrap()));
        assert_eq!(addr.host(), "::1");
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!(Address::parse("example.com").is_err());
        assert!(Address::parse("example.com:http").is_err());
        assert!(Address::parse(":80").is_err());
    }

    #[test]
    fn test_as_socket() {
        let addr = Address::parse("10.0.0.1:8080").unwrap();
        assert_eq!(addr.as_socket(), Some("10.0.0.1:8080".parse().unwrap()));
        assert_eq!(Address::domain("example.com", 443).as_socket(), None);
    }
}
