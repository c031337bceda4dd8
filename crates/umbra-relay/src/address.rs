//! Overlay endpoint addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProxyError;

/// A host and port on the overlay network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Overlay host name
    pub host: String,
    /// Port on that host
    pub port: u16,
}

impl PeerAddress {
    /// Create an address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or(ProxyError::invalid_value("address missing port"))?;
        if host.is_empty() {
            return Err(ProxyError::invalid_value("address missing host"));
        }
        let port = port
            .parse()
            .map_err(|_| ProxyError::invalid_value("address port is not a number"))?;
        Ok(Self::new(host, port))
    }
}
