//! Address specifications of the form `scheme://host:port`.
//!
//! The scheme selects the network (`tcp`, `tcp4`, `tcp6`) and the authority
//! is resolved at bind/dial time, so host names such as `localhost` work.
//! An empty host (`tcp://:8080`) means every local interface.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Network family selected by the address scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Any IP family
    Tcp,
    /// IPv4 only
    Tcp4,
    /// IPv6 only
    Tcp6,
}

impl Network {
    fn scheme(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

/// A parsed, not yet resolved, network address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    network: Network,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn network(&self) -> Network {
        self.network
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve the endpoint to the socket addresses allowed by its scheme.
    ///
    /// Blocks the calling thread during name lookup. Async callers use
    /// [`Endpoint::lookup`].
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs = (self.lookup_host(), self.port).to_socket_addrs()?;
        self.select(addrs)
    }

    /// Resolve the endpoint on Tokio's blocking pool.
    pub async fn lookup(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((self.lookup_host(), self.port)).await?;
        self.select(addrs)
    }

    fn lookup_host(&self) -> &str {
        match (self.host.as_str(), self.network) {
            ("", Network::Tcp6) => "::",
            ("", _) => "0.0.0.0",
            (host, _) => host,
        }
    }

    /// Keep only the addresses of the scheme's family.
    fn select(&self, addrs: impl Iterator<Item = SocketAddr>) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = addrs.filter(|addr| self.network.accepts(addr)).collect();

        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address found for {}", self.network.scheme(), self),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.network.scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.network.scheme(), self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| AddrError::MissingScheme(s.to_string()))?;

        let network = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Network::Tcp,
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            _ => return Err(AddrError::UnsupportedScheme(scheme.to_string())),
        };

        // Anything after the authority (a path, query or fragment) is ignored.
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();

        let (host, port) = split_host_port(authority)
            .ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AddrError::InvalidPort(port.to_string()))?;

        Ok(Endpoint {
            network,
            host: host.to_string(),
            port,
        })
    }
}

/// Split `host:port` or `[v6host]:port`.
fn split_host_port(authority: &str) -> Option<(&str, &str)> {
    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = authority.rsplit_once(':')?;
    if host.contains(':') {
        // Bare IPv6 literals must be bracketed.
        return None;
    }
    Some((host, port))
}

/// Malformed address specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    MissingScheme(String),
    UnsupportedScheme(String),
    MissingPort(String),
    InvalidPort(String),
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrError::MissingScheme(s) => {
                write!(f, "address '{}' has no scheme (expected e.g. tcp://host:port)", s)
            }
            AddrError::UnsupportedScheme(s) => {
                write!(f, "unsupported scheme '{}' (expected tcp, tcp4 or tcp6)", s)
            }
            AddrError::MissingPort(s) => write!(f, "address '{}' has no port", s),
            AddrError::InvalidPort(p) => write!(f, "invalid port '{}'", p),
        }
    }
}

impl std::error::Error for AddrError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let ep: Endpoint = "tcp://localhost:8080".parse().unwrap();
        assert_eq!(ep.network(), Network::Tcp);
        assert_eq!(ep.host(), "localhost");
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.to_string(), "tcp://localhost:8080");
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let ep: Endpoint = "tcp6://[::1]:9000".parse().unwrap();
        assert_eq!(ep.network(), Network::Tcp6);
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "tcp6://[::1]:9000");
    }

    #[test]
    fn test_empty_host_means_any_interface() {
        let ep: Endpoint = "tcp://:0".parse().unwrap();
        assert_eq!(ep.host(), "");
        let addrs = ep.resolve().unwrap();
        assert!(addrs[0].ip().is_unspecified());
    }

    #[test]
    fn test_parse_ignores_path() {
        let ep: Endpoint = "tcp://127.0.0.1:1/ignored".parse().unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "localhost:8080".parse::<Endpoint>(),
            Err(AddrError::MissingScheme(_))
        ));
        assert!(matches!(
            "udp://localhost:8080".parse::<Endpoint>(),
            Err(AddrError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            "tcp://localhost".parse::<Endpoint>(),
            Err(AddrError::MissingPort(_))
        ));
        assert!(matches!(
            "tcp://localhost:http".parse::<Endpoint>(),
            Err(AddrError::InvalidPort(_))
        ));
        assert!(matches!(
            "tcp://::1:80".parse::<Endpoint>(),
            Err(AddrError::MissingPort(_))
        ));
    }

    #[test]
    fn test_resolve_filters_by_family() {
        let ep: Endpoint = "tcp4://127.0.0.1:0".parse().unwrap();
        let addrs = ep.resolve().unwrap();
        assert!(addrs.iter().all(|a| a.is_ipv4()));

        let ep: Endpoint = "tcp6://127.0.0.1:0".parse().unwrap();
        assert!(ep.resolve().is_err());
    }

    #[tokio::test]
    async fn test_lookup_matches_resolve() {
        let ep: Endpoint = "tcp4://127.0.0.1:4000".parse().unwrap();
        assert_eq!(ep.lookup().await.unwrap(), ep.resolve().unwrap());

        let ep: Endpoint = "tcp6://127.0.0.1:4000".parse().unwrap();
        let err = ep.lookup().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
