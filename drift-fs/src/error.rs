//! Error types for driftsync-fs.
//!
//! These map one-to-one onto the failure reasons reported back to peers in
//! response messages: every variant's `Display` text is suitable as a
//! response `message` field.

use thiserror::Error;

/// Errors from the reconciliation engine and loader API.
#[derive(Debug, Error)]
pub enum FsError {
    /// A file or loader already occupies the path.
    #[error("pathname already exists: {path}")]
    AlreadyExists {
        /// Path relative to the share root.
        path: String,
    },

    /// No watched file, directory, or loader at the path.
    #[error("pathname does not exist: {path}")]
    NotFound {
        /// Path relative to the share root.
        path: String,
    },

    /// The request describes content older than (or conflicting with) what
    /// is already on disk.
    #[error("unexpected content for {path}: descriptor is stale or conflicting")]
    StaleOrConflicting {
        /// Path relative to the share root.
        path: String,
    },

    /// A write or read offset beyond the descriptor's file size.
    #[error("offset {offset} out of range for {path} (file size {size})")]
    OutOfRange {
        /// Path relative to the share root.
        path: String,
        /// The offending offset.
        offset: u64,
        /// The descriptor's file size.
        size: u64,
    },

    /// The path escapes the share root or names the root itself.
    #[error("unsafe pathname: {path}")]
    UnsafePath {
        /// The rejected path.
        path: String,
    },

    /// An underlying filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path relative to the share root.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
