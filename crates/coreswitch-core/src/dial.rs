//! Dial capabilities
//!
//! A core hands out a [`StreamDialer`] (TCP-like streams) and a
//! [`PacketDialer`] (UDP-like endpoints). Callers only see a destination in,
//! a connection out; transport and encryption stay inside the core.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream produced by a dialer
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Destination of a dial: a socket address or an unresolved host name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Build from a host as found in a URI (IPv6 literals may be bracketed)
    pub fn from_host(host: &str, port: u16) -> Self {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(bare.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(host, _) => host.clone(),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl FromStr for TargetAddr {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(TargetAddr::Ip(addr));
        }
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address: {}", s));
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(TargetAddr::from_host(host, port))
    }
}

/// Produces streams to a destination
#[async_trait]
pub trait StreamDialer: Send + Sync {
    async fn dial_stream(&self, target: &TargetAddr) -> io::Result<BoxedStream>;
}

/// A datagram endpoint that reaches arbitrary destinations
#[async_trait]
pub trait PacketEndpoint: Send + Sync {
    async fn send_to(&self, target: &TargetAddr, payload: &[u8]) -> io::Result<usize>;

    /// Receive one datagram and the address it came from
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, TargetAddr)>;
}

/// Produces packet endpoints
#[async_trait]
pub trait PacketDialer: Send + Sync {
    async fn dial_packet(&self) -> io::Result<Arc<dyn PacketEndpoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_and_domain_targets() {
        assert_eq!(
            "1.2.3.4:80".parse::<TargetAddr>().unwrap(),
            TargetAddr::Ip("1.2.3.4:80".parse().unwrap())
        );
        assert_eq!(
            "example.com:443".parse::<TargetAddr>().unwrap(),
            TargetAddr::Domain("example.com".into(), 443)
        );
        assert_eq!("[::1]:53".parse::<TargetAddr>().unwrap().port(), 53);
        assert!("example.com".parse::<TargetAddr>().is_err());
        assert!(":80".parse::<TargetAddr>().is_err());
    }

    #[test]
    fn uri_hosts_become_targets() {
        assert_eq!(TargetAddr::from_host("[::1]", 443), TargetAddr::Ip("[::1]:443".parse().unwrap()));
        assert_eq!(TargetAddr::from_host("good.example", 80).to_string(), "good.example:80");
    }
}
