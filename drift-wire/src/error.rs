//! Error types for driftsync-wire.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON serialization failed
    #[error("message encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON deserialization failed (malformed line, unknown command,
    /// missing or mistyped field)
    #[error("message decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// Chunk content was not valid base64
    #[error("invalid base64 content: {0}")]
    Content(#[from] base64::DecodeError),

    /// Host/port string was not of the form `host:port`
    #[error("invalid host:port string: {0}")]
    HostPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }

    #[test]
    fn host_port_error_display() {
        let err = WireError::HostPort("nonsense".to_string());
        assert_eq!(err.to_string(), "invalid host:port string: nonsense");
    }
}
