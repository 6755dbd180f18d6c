//! # driftsync-wire
//!
//! Wire format types for the driftsync peer-to-peer sync protocol.
//!
//! This crate provides the foundational types used across all driftsync
//! crates:
//! - [`FileDescriptor`], [`HostPort`] - File metadata and peer address types
//! - [`Message`] - Protocol messages (handshake, file/dir events, byte transfer)
//! - [`WireError`] - Error types
//!
//! The protocol is newline-delimited JSON: every message is one UTF-8 JSON
//! object on its own line, discriminated by its `command` field.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod descriptor;
mod error;
mod messages;

pub use descriptor::{FileDescriptor, HostPort};
pub use error::WireError;
pub use messages::{decode_content, encode_content, Message};
