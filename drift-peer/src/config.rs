//! Configuration loading for a driftsync node.
//!
//! Configuration is loaded from a TOML file, constructed once at startup,
//! and passed by `Arc` into every component — there is no ambient global
//! state. Malformed configuration is fatal at startup.

use std::path::PathBuf;

use serde::Deserialize;

use drift_wire::HostPort;

/// Which transport the node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Persistent TCP connections, one per peer.
    Tcp,
    /// Best-effort UDP datagrams with application-level retry.
    Udp,
}

/// Root configuration for a driftsync node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Node identity and transport.
    pub node: NodeConfig,
    /// Synchronization tuning.
    pub sync: SyncConfig,
    /// Connection limits.
    pub limits: LimitsConfig,
    /// UDP retry behavior (ignored in TCP mode).
    #[serde(default)]
    pub udp: UdpConfig,
}

/// Node identity and transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Transport mode (default: tcp).
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Port to listen on (default: 8111). Port 0 binds an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hostname other peers should use to reach this node (default: localhost).
    #[serde(default = "default_advertised_host")]
    pub advertised_host: String,
    /// Optional human-readable node name, sent in handshakes for logs.
    pub advertised_name: Option<String>,
    /// Directory to synchronize (default: share).
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    /// Peers to connect to, as `host:port` strings.
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Synchronization tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum bytes per chunk request/response (default: 8192).
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Seconds between filesystem scans (default: 1).
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Seconds between outbound connection retry sweeps (default: 10).
    #[serde(default = "default_connect_interval_secs")]
    pub connect_interval_secs: u64,
}

/// Connection limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent inbound peers; excess connections are refused
    /// with a peer list (default: 10).
    #[serde(default = "default_max_inbound_peers")]
    pub max_inbound_peers: usize,
}

/// UDP retry behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct UdpConfig {
    /// Milliseconds between resends of an unacknowledged request
    /// (default: 1000).
    #[serde(default = "default_retry_interval_millis")]
    pub retry_interval_millis: u64,
    /// Resend attempts before the session is closed as timed out
    /// (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum datagram payload in bytes (default: 16384).
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

// Default value functions
fn default_mode() -> Mode {
    Mode::Tcp
}

fn default_port() -> u16 {
    8111
}

fn default_advertised_host() -> String {
    "localhost".to_string()
}

fn default_share_dir() -> PathBuf {
    PathBuf::from("share")
}

fn default_block_size() -> u64 {
    8192
}

fn default_scan_interval_secs() -> u64 {
    1
}

fn default_connect_interval_secs() -> u64 {
    10
}

fn default_max_inbound_peers() -> usize {
    10
}

fn default_retry_interval_millis() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_payload() -> usize {
    16384
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                mode: default_mode(),
                port: default_port(),
                advertised_host: default_advertised_host(),
                advertised_name: None,
                share_dir: default_share_dir(),
                peers: Vec::new(),
            },
            sync: SyncConfig {
                block_size: default_block_size(),
                scan_interval_secs: default_scan_interval_secs(),
                connect_interval_secs: default_connect_interval_secs(),
            },
            limits: LimitsConfig {
                max_inbound_peers: default_max_inbound_peers(),
            },
            udp: UdpConfig::default(),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            retry_interval_millis: default_retry_interval_millis(),
            max_retries: default_max_retries(),
            max_payload: default_max_payload(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// The address this node tells peers to reach it on.
    pub fn advertised_host_port(&self) -> HostPort {
        HostPort::new(self.node.advertised_host.clone(), self.node.port)
    }

    /// The configured outbound peer addresses, parsed.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first malformed `host:port` entry.
    pub fn peer_host_ports(&self) -> Result<Vec<HostPort>, ConfigError> {
        self.node
            .peers
            .iter()
            .map(|s| {
                s.parse::<HostPort>().map_err(|_| ConfigError::InvalidPeer {
                    address: s.clone(),
                })
            })
            .collect()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A peer entry is not a valid `host:port`.
    #[error("invalid peer address in config: {address}")]
    InvalidPeer {
        /// The malformed entry.
        address: String,
    },
}
