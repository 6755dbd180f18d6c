//! Protocol messages for driftsync.
//!
//! Every message is one JSON object per line, discriminated by its `command`
//! field. Field names on the wire are camelCase (`pathName`, `hostPort`,
//! `fileDescriptor`); commands are SCREAMING_SNAKE (`HANDSHAKE_REQUEST`).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{FileDescriptor, HostPort, WireError};

/// All protocol messages.
///
/// Requests announce state or ask for bytes; responses (other than the
/// handshake response) carry a `status` flag and a human-readable `message`
/// explaining failure. [`Message::is_request`] distinguishes the two, which
/// matters for the UDP retry logic: only requests are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Opens a session: the connecting peer advertises its own address.
    #[serde(rename_all = "camelCase")]
    HandshakeRequest {
        /// The address other peers can reach the sender on.
        host_port: HostPort,
        /// Optional human-readable peer name, for logs only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        friendly_name: Option<String>,
    },

    /// Accepts a handshake; the responder advertises its own address back.
    #[serde(rename_all = "camelCase")]
    HandshakeResponse {
        /// The responder's advertised address.
        host_port: HostPort,
    },

    /// Rejects a connection, listing currently active peers so the caller
    /// can try elsewhere.
    #[serde(rename_all = "camelCase")]
    ConnectionRefused {
        /// Why the connection was refused.
        message: String,
        /// Addresses of the refusing node's active peers.
        peers: Vec<HostPort>,
    },

    /// Announces a newly created file; the receiver is expected to fetch
    /// its content with byte requests.
    #[serde(rename_all = "camelCase")]
    FileCreateRequest {
        /// Descriptor of the complete new file.
        file_descriptor: FileDescriptor,
        /// Path relative to the share root.
        path_name: String,
    },

    /// Outcome of a file-create request.
    #[serde(rename_all = "camelCase")]
    FileCreateResponse {
        /// Echo of the request descriptor.
        file_descriptor: FileDescriptor,
        /// Echo of the request path.
        path_name: String,
        /// Human-readable outcome.
        message: String,
        /// Whether the receiver accepted the create and will fetch content.
        status: bool,
    },

    /// Announces a modified file.
    #[serde(rename_all = "camelCase")]
    FileModifyRequest {
        /// Descriptor of the file's new content.
        file_descriptor: FileDescriptor,
        /// Path relative to the share root.
        path_name: String,
    },

    /// Outcome of a file-modify request.
    #[serde(rename_all = "camelCase")]
    FileModifyResponse {
        /// Echo of the request descriptor.
        file_descriptor: FileDescriptor,
        /// Echo of the request path.
        path_name: String,
        /// Human-readable outcome.
        message: String,
        /// Whether the receiver accepted the modify.
        status: bool,
    },

    /// Announces a deleted file.
    #[serde(rename_all = "camelCase")]
    FileDeleteRequest {
        /// Descriptor the file had when it was deleted.
        file_descriptor: FileDescriptor,
        /// Path relative to the share root.
        path_name: String,
    },

    /// Outcome of a file-delete request.
    #[serde(rename_all = "camelCase")]
    FileDeleteResponse {
        /// Echo of the request descriptor.
        file_descriptor: FileDescriptor,
        /// Echo of the request path.
        path_name: String,
        /// Human-readable outcome.
        message: String,
        /// Whether the file was deleted.
        status: bool,
    },

    /// Asks the peer for a byte range of a file it announced.
    #[serde(rename_all = "camelCase")]
    FileBytesRequest {
        /// Descriptor identifying the wanted content (matched by hash).
        file_descriptor: FileDescriptor,
        /// Path relative to the share root.
        path_name: String,
        /// Byte offset to read from.
        position: u64,
        /// Number of bytes wanted (the responder may clamp this).
        length: u64,
    },

    /// Carries a byte range (base64) or a failure report.
    #[serde(rename_all = "camelCase")]
    FileBytesResponse {
        /// Echo of the request descriptor.
        file_descriptor: FileDescriptor,
        /// Echo of the request path.
        path_name: String,
        /// Byte offset the content starts at.
        position: u64,
        /// Number of bytes actually served.
        length: u64,
        /// Base64-encoded content; empty on failure.
        content: String,
        /// Human-readable outcome.
        message: String,
        /// Whether the read succeeded.
        status: bool,
    },

    /// Announces a newly created directory.
    #[serde(rename_all = "camelCase")]
    DirectoryCreateRequest {
        /// Path relative to the share root.
        path_name: String,
    },

    /// Outcome of a directory-create request.
    #[serde(rename_all = "camelCase")]
    DirectoryCreateResponse {
        /// Echo of the request path.
        path_name: String,
        /// Human-readable outcome.
        message: String,
        /// Whether the directory was created.
        status: bool,
    },

    /// Announces a deleted directory.
    #[serde(rename_all = "camelCase")]
    DirectoryDeleteRequest {
        /// Path relative to the share root.
        path_name: String,
    },

    /// Outcome of a directory-delete request.
    #[serde(rename_all = "camelCase")]
    DirectoryDeleteResponse {
        /// Echo of the request path.
        path_name: String,
        /// Human-readable outcome.
        message: String,
        /// Whether the directory was deleted.
        status: bool,
    },

    /// Reports a protocol violation. Terminal: the sender closes the
    /// session after sending this, and the receiver closes on receipt.
    #[serde(rename_all = "camelCase")]
    InvalidProtocol {
        /// What was violated.
        message: String,
    },
}

impl Message {
    /// Serialize to a single JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }

    /// Deserialize from one JSON line.
    ///
    /// Malformed JSON, an unknown `command`, or a missing/mistyped field
    /// all surface as [`WireError::Decode`].
    pub fn decode(line: &str) -> Result<Self, WireError> {
        serde_json::from_str(line.trim()).map_err(WireError::Decode)
    }

    /// The wire command name, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Message::HandshakeRequest { .. } => "HANDSHAKE_REQUEST",
            Message::HandshakeResponse { .. } => "HANDSHAKE_RESPONSE",
            Message::ConnectionRefused { .. } => "CONNECTION_REFUSED",
            Message::FileCreateRequest { .. } => "FILE_CREATE_REQUEST",
            Message::FileCreateResponse { .. } => "FILE_CREATE_RESPONSE",
            Message::FileModifyRequest { .. } => "FILE_MODIFY_REQUEST",
            Message::FileModifyResponse { .. } => "FILE_MODIFY_RESPONSE",
            Message::FileDeleteRequest { .. } => "FILE_DELETE_REQUEST",
            Message::FileDeleteResponse { .. } => "FILE_DELETE_RESPONSE",
            Message::FileBytesRequest { .. } => "FILE_BYTES_REQUEST",
            Message::FileBytesResponse { .. } => "FILE_BYTES_RESPONSE",
            Message::DirectoryCreateRequest { .. } => "DIRECTORY_CREATE_REQUEST",
            Message::DirectoryCreateResponse { .. } => "DIRECTORY_CREATE_RESPONSE",
            Message::DirectoryDeleteRequest { .. } => "DIRECTORY_DELETE_REQUEST",
            Message::DirectoryDeleteResponse { .. } => "DIRECTORY_DELETE_RESPONSE",
            Message::InvalidProtocol { .. } => "INVALID_PROTOCOL",
        }
    }

    /// Whether this message is a request (retried over UDP until its
    /// response arrives). Responses and terminal notices are never retried.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::HandshakeRequest { .. }
                | Message::FileCreateRequest { .. }
                | Message::FileModifyRequest { .. }
                | Message::FileDeleteRequest { .. }
                | Message::FileBytesRequest { .. }
                | Message::DirectoryCreateRequest { .. }
                | Message::DirectoryDeleteRequest { .. }
        )
    }

    /// Content-derived identifier matching a response to its request.
    ///
    /// A request and its response share the same key, so observing a
    /// response cancels the request's pending UDP retry with one map
    /// lookup. `CONNECTION_REFUSED` shares the handshake key: a refusal
    /// also settles an outstanding handshake request.
    pub fn summary_key(&self) -> String {
        match self {
            Message::HandshakeRequest { .. }
            | Message::HandshakeResponse { .. }
            | Message::ConnectionRefused { .. } => "HANDSHAKE".to_string(),
            Message::FileCreateRequest { path_name, .. }
            | Message::FileCreateResponse { path_name, .. } => {
                format!("FILE_CREATE:{path_name}")
            }
            Message::FileModifyRequest { path_name, .. }
            | Message::FileModifyResponse { path_name, .. } => {
                format!("FILE_MODIFY:{path_name}")
            }
            Message::FileDeleteRequest { path_name, .. }
            | Message::FileDeleteResponse { path_name, .. } => {
                format!("FILE_DELETE:{path_name}")
            }
            Message::FileBytesRequest {
                path_name, position, ..
            }
            | Message::FileBytesResponse {
                path_name, position, ..
            } => format!("FILE_BYTES:{path_name}:{position}"),
            Message::DirectoryCreateRequest { path_name }
            | Message::DirectoryCreateResponse { path_name, .. } => {
                format!("DIRECTORY_CREATE:{path_name}")
            }
            Message::DirectoryDeleteRequest { path_name }
            | Message::DirectoryDeleteResponse { path_name, .. } => {
                format!("DIRECTORY_DELETE:{path_name}")
            }
            Message::InvalidProtocol { .. } => "INVALID_PROTOCOL".to_string(),
        }
    }

    /// The `(status, message)` pair of a response, if this is a response
    /// that carries one.
    pub fn response_status(&self) -> Option<(bool, &str)> {
        match self {
            Message::FileCreateResponse {
                status, message, ..
            }
            | Message::FileModifyResponse {
                status, message, ..
            }
            | Message::FileDeleteResponse {
                status, message, ..
            }
            | Message::FileBytesResponse {
                status, message, ..
            }
            | Message::DirectoryCreateResponse {
                status, message, ..
            }
            | Message::DirectoryDeleteResponse {
                status, message, ..
            } => Some((*status, message)),
            _ => None,
        }
    }
}

/// Base64-encode chunk content for the `content` field.
pub fn encode_content(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode the base64 `content` field of a bytes response.
pub fn decode_content(content: &str) -> Result<Vec<u8>, WireError> {
    Ok(BASE64.decode(content)?)
}
