//! Error types for driftsync-peer.

use thiserror::Error;

/// Main error type for node operations.
///
/// Failures stay inside their own domain as far as possible: an error on
/// one session or transfer never takes down another. Only configuration
/// and bind-time errors propagate out of [`crate::SyncNode::start`].
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Filesystem engine error.
    #[error("filesystem error: {0}")]
    Fs(#[from] drift_fs::FsError),

    /// Wire format error.
    #[error("wire error: {0}")]
    Wire(#[from] drift_wire::WireError),

    /// I/O error (bind, accept, socket setup).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
