//! Node addresses
//!
//! A `host:port` pair naming a monitor or a store node.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Address of a monitor or store node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

/// Monitors are addressed exactly like store nodes
pub type MonitorEndpoint = NodeAddress;

impl NodeAddress {
    /// Create an address, rejecting an empty host or port 0
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, String> {
        let host = host.into();
        let host = host.trim().trim_start_matches('[').trim_end_matches(']').to_string();

        if host.is_empty() {
            return Err("empty host".to_string());
        }
        if host.chars().any(char::is_whitespace) {
            return Err(format!("invalid host '{}'", host));
        }
        if port == 0 {
            return Err(format!("invalid port 0 for host '{}'", host));
        }

        Ok(NodeAddress { host, port })
    }

    /// Build from the `[ip, port]` strings a monitor reports
    pub fn from_parts(host: &str, port: &str) -> Result<Self, String> {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}'", port))?;
        Self::new(host, port)
    }

    /// `host:port` form accepted by `TcpStream::connect`
    pub fn to_socket_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("address '{}' is not host:port", s))?;
        Self::from_parts(host, port)
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
