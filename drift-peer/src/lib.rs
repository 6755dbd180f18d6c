//! # driftsync-peer
//!
//! The networked half of driftsync: peer sessions with their handshake
//! state machine and ordered outbound queues, the protocol dispatcher, the
//! chunked transfer coordinator, and the connection manager that accepts,
//! dials, and retries peers over TCP or UDP.
//!
//! [`SyncNode`] ties everything together; the CLI builds one from a
//! [`Config`] and runs it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod dispatcher;
mod error;
pub mod link;
mod node;
mod roster;
mod session;
mod transfer;

pub use config::{Config, ConfigError, Mode};
pub use drift_wire::{FileDescriptor, HostPort, Message};
pub use dispatcher::{event_message, Dispatcher, Inbound};
pub use error::{NodeError, Result};
pub use node::SyncNode;
pub use roster::{AddressBook, Roster};
pub use session::{Direction, Peer, PeerHandle, PeerState, RetryPolicy};
pub use transfer::{BeginKind, TransferCoordinator};
