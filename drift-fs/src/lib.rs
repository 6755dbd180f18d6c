//! # driftsync-fs
//!
//! The filesystem reconciliation engine for driftsync.
//!
//! [`SyncTree`] owns the authoritative in-memory picture of one shared
//! directory: the watched files (with cached content hashes), the watched
//! directories, a content-hash reverse index, and the set of in-progress
//! incoming-file loaders. A periodic [`SyncTree::scan`] diffs that picture
//! against the disk and emits ordered [`FsEvent`]s; the loader API stages
//! bytes arriving from peers into placeholder files that are promoted
//! atomically once their content hash checks out.
//!
//! All I/O here is synchronous `std::fs` — callers on an async runtime run
//! these methods through `spawn_blocking`. One mutex covers the watched maps
//! and the loader map together, since loader promotion mutates both.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event;
mod hash;
mod loader;
mod tree;

pub use error::FsError;
pub use event::FsEvent;
pub use hash::{hash_bytes, hash_file};
pub use loader::PART_SUFFIX;
pub use tree::SyncTree;
