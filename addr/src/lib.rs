//! Addressing for the reliable transport.
//!
//! A host is identified by a small link address and a connection endpoint by
//! a `(host, port)` pair. A `ConnectionKey` names one connection from the
//! point of view of the local host.
#![deny(missing_docs)]
#![deny(warnings)]
use std::str::FromStr;
use thiserror::Error;

/// Link address of a host.
pub type HostId = u8;

/// Transport port.
pub type Port = u8;

/// The upper bound (inclusive) on the value of any port.
pub const PORT_LIMIT: Port = 127;

/// Returns true if the port is within `0..=PORT_LIMIT`.
pub fn is_valid_port(port: Port) -> bool {
    port <= PORT_LIMIT
}

/// Address of one end of a connection.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Endpoint {
    /// Link address of the host.
    pub host: HostId,
    /// Port on the host.
    pub port: Port,
}

/// Endpoint parse error.
#[derive(Debug, Error, PartialEq)]
pub enum AddrParseError {
    /// Unknown protocol.
    #[error("Unknown protocol.")]
    UnknownProtocol,
    /// Number parse error.
    #[error("{0}")]
    Number(#[from] std::num::ParseIntError),
    /// Port outside of `0..=PORT_LIMIT`.
    #[error("port {0} exceeds the port limit")]
    PortLimit(Port),
}

impl Endpoint {
    /// Creates a new endpoint.
    pub fn new(host: HostId, port: Port) -> Self {
        Self { host, port }
    }
}

impl FromStr for Endpoint {
    type Err = AddrParseError;

    /// Parses endpoints of the form `/host/1/port/7`. The port defaults to 0.
    fn from_str(addr: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = addr.split('/').collect();
        if parts.len() < 3 || !parts[0].is_empty() {
            return Err(AddrParseError::UnknownProtocol);
        }
        let mut host = None;
        let mut port = None;
        for p in parts[1..].chunks(2).enumerate() {
            match p {
                (0, ["host", v]) => host = Some(HostId::from_str(v)?),
                (1, ["port", v]) => {
                    let v = Port::from_str(v)?;
                    if !is_valid_port(v) {
                        return Err(AddrParseError::PortLimit(v));
                    }
                    port = Some(v);
                }
                _ => return Err(AddrParseError::UnknownProtocol),
            }
        }
        match host {
            Some(host) => Ok(Self {
                host,
                port: port.unwrap_or(0),
            }),
            None => Err(AddrParseError::UnknownProtocol),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "/host/{}/port/{}", self.host, self.port)
    }
}

/// Identifies a connection by its remote and local endpoints.
///
/// Equality and hashing compare the full tuple in order. A key and its
/// `mirror` are different keys: a host that is both client and server of
/// the same peer port pair must not see the two sockets collide.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionKey {
    remote: Endpoint,
    local: Endpoint,
}

impl ConnectionKey {
    /// Creates a key from `(remote_host, remote_port, local_host, local_port)`.
    pub fn new(remote_host: HostId, remote_port: Port, local_host: HostId, local_port: Port) -> Self {
        Self {
            remote: Endpoint::new(remote_host, remote_port),
            local: Endpoint::new(local_host, local_port),
        }
    }

    /// Creates a key from two endpoints.
    pub fn from_endpoints(remote: Endpoint, local: Endpoint) -> Self {
        Self { remote, local }
    }

    /// Returns the peer's view of the same connection.
    pub fn mirror(&self) -> Self {
        Self {
            remote: self.local,
            local: self.remote,
        }
    }

    /// Returns true if `other` is the peer's view of this connection.
    pub fn is_paired(&self, other: &ConnectionKey) -> bool {
        self.mirror() == *other
    }

    /// Remote endpoint.
    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    /// Local endpoint.
    pub fn local(&self) -> Endpoint {
        self.local
    }

    /// Remote host.
    pub fn remote_host(&self) -> HostId {
        self.remote.host
    }

    /// Remote port.
    pub fn remote_port(&self) -> Port {
        self.remote.port
    }

    /// Local host.
    pub fn local_host(&self) -> HostId {
        self.local.host
    }

    /// Local port.
    pub fn local_port(&self) -> Port {
        self.local.port
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} <- {}", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn rt(saddr: &str) {
        // parse
        let addr: Endpoint = saddr.parse().unwrap();
        // format
        assert!(format!("{}", addr).starts_with(saddr));
        // Endpoint -> String -> Endpoint
        let addr2: Endpoint = addr.to_string().parse().unwrap();
        assert_eq!(addr, addr2);
    }

    #[test]
    fn test_endpoint() {
        rt("/host/1/port/7");
        rt("/host/255/port/127");
        rt("/host/0");
    }

    #[test]
    fn test_endpoint_errors() {
        assert_eq!(
            "/ip4/1/port/7".parse::<Endpoint>(),
            Err(AddrParseError::UnknownProtocol)
        );
        assert_eq!(
            "/host/1/port/128".parse::<Endpoint>(),
            Err(AddrParseError::PortLimit(128))
        );
        assert!("/host/256".parse::<Endpoint>().is_err());
        assert!("host/1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_mirror() {
        let key = ConnectionKey::new(1, 7, 2, 0);
        let mirror = key.mirror();
        assert_eq!(mirror, ConnectionKey::new(2, 0, 1, 7));
        assert_eq!(mirror.mirror(), key);
        assert!(key.is_paired(&mirror));
        assert!(!key.is_paired(&key));
    }

    #[test]
    fn test_order_sensitive_identity() {
        // A client socket (1:5 -> 2:7) and a server socket (2:7 <- 1:5) on
        // the same host must be distinct keys.
        let client = ConnectionKey::new(2, 7, 1, 5);
        let server = ConnectionKey::new(1, 5, 2, 7);
        assert_ne!(client, server);
        let mut set = HashSet::new();
        set.insert(client);
        set.insert(server);
        assert_eq!(set.len(), 2);
    }
}
