//! File metadata and peer address value types.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WireError;

/// Metadata describing one complete file: its MD5 content hash (lowercase
/// hex), last-modified time in epoch milliseconds, and size in bytes.
///
/// A descriptor always refers to the *complete* file content; partial
/// content is never described by one of these. Descriptors are immutable —
/// a modification produces a new descriptor replacing the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// MD5 digest of the full file content, as a lowercase hex string.
    pub md5: String,
    /// Last-modified timestamp in milliseconds since the Unix epoch.
    pub last_modified: u64,
    /// File size in bytes.
    pub file_size: u64,
}

impl FileDescriptor {
    /// Create a new descriptor.
    pub fn new(md5: impl Into<String>, last_modified: u64, file_size: u64) -> Self {
        Self {
            md5: md5.into(),
            last_modified,
            file_size,
        }
    }
}

/// A peer's advertised address.
///
/// Equality (`==`, `Hash`) is textual. Use [`HostPort::fuzzy_eq`] when two
/// addresses should be considered the same peer even though one says
/// `localhost` and the other `127.0.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPort {
    /// Hostname or IP address.
    pub host: String,
    /// TCP or UDP port.
    pub port: u16,
}

impl HostPort {
    /// Create a new host/port pair.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Equality after resolving both sides to canonical socket addresses.
    ///
    /// Tolerates hostname-vs-alias differences (`localhost` vs `127.0.0.1`).
    /// Falls back to case-insensitive textual comparison when either side
    /// does not resolve.
    pub fn fuzzy_eq(&self, other: &HostPort) -> bool {
        if self.port == other.port && self.host.eq_ignore_ascii_case(&other.host) {
            return true;
        }
        match (self.resolve(), other.resolve()) {
            (Some(a), Some(b)) => a.iter().any(|addr| b.contains(addr)),
            _ => false,
        }
    }

    fn resolve(&self) -> Option<Vec<SocketAddr>> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .map(|addrs| addrs.collect())
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = WireError;

    /// Parse `host:port`. The port is everything after the *last* colon, so
    /// bracketless IPv6 literals are not supported (matching the original
    /// deployments, which addressed peers by hostname or IPv4).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| WireError::HostPort(s.to_string()))?;
        if host.is_empty() {
            return Err(WireError::HostPort(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| WireError::HostPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_serializes_with_canonical_field_names() {
        let fd = FileDescriptor::new("d41d8cd98f00b204e9800998ecf8427e", 1000, 0);
        let json = serde_json::to_string(&fd).unwrap();
        assert!(json.contains("\"md5\""));
        assert!(json.contains("\"lastModified\":1000"));
        assert!(json.contains("\"fileSize\":0"));
    }

    #[test]
    fn descriptor_roundtrip() {
        let fd = FileDescriptor::new("abc123", 42, 7);
        let json = serde_json::to_string(&fd).unwrap();
        let restored: FileDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(fd, restored);
    }

    #[test]
    fn host_port_display_and_parse() {
        let hp = HostPort::new("peer.example.org", 8111);
        assert_eq!(hp.to_string(), "peer.example.org:8111");

        let parsed: HostPort = "peer.example.org:8111".parse().unwrap();
        assert_eq!(parsed, hp);
    }

    #[test]
    fn host_port_parse_rejects_garbage() {
        assert!("no-port-here".parse::<HostPort>().is_err());
        assert!(":8111".parse::<HostPort>().is_err());
        assert!("host:notanumber".parse::<HostPort>().is_err());
        assert!("host:99999".parse::<HostPort>().is_err());
    }

    #[test]
    fn fuzzy_eq_matches_textual_equality() {
        let a = HostPort::new("Peer.Example.Org", 8111);
        let b = HostPort::new("peer.example.org", 8111);
        assert!(a.fuzzy_eq(&b));
    }

    #[test]
    fn fuzzy_eq_resolves_localhost_aliases() {
        let a = HostPort::new("localhost", 8111);
        let b = HostPort::new("127.0.0.1", 8111);
        assert!(a.fuzzy_eq(&b));
    }

    #[test]
    fn fuzzy_eq_distinguishes_ports() {
        let a = HostPort::new("127.0.0.1", 8111);
        let b = HostPort::new("127.0.0.1", 8112);
        assert!(!a.fuzzy_eq(&b));
    }

    #[test]
    fn host_port_serializes_with_canonical_field_names() {
        let hp = HostPort::new("localhost", 8111);
        let json = serde_json::to_string(&hp).unwrap();
        assert_eq!(json, "{\"host\":\"localhost\",\"port\":8111}");
    }
}
