//! The peer roster and the outbound address book.
//!
//! All roster mutation goes through named methods on one `RwLock`-guarded
//! map — no ad-hoc synchronization anywhere else. Broadcast iteration takes
//! a snapshot so senders never hold the lock across I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use uuid::Uuid;

use drift_wire::{HostPort, Message};

use crate::session::PeerHandle;

/// The set of known peer sessions.
pub struct Roster {
    peers: RwLock<HashMap<Uuid, PeerHandle>>,
    max_inbound: usize,
}

impl Roster {
    /// Create an empty roster with the given inbound-connection cap.
    pub fn new(max_inbound: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_inbound,
        }
    }

    /// Register a session.
    pub fn add(&self, peer: PeerHandle) {
        self.peers.write().unwrap().insert(peer.id(), peer);
    }

    /// Remove a session by id.
    pub fn remove(&self, id: &Uuid) -> Option<PeerHandle> {
        self.peers.write().unwrap().remove(id)
    }

    /// Snapshot of every live session.
    pub fn iter_live(&self) -> Vec<PeerHandle> {
        self.peers
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_live())
            .cloned()
            .collect()
    }

    /// Snapshot of every session past its handshake.
    pub fn iter_active(&self) -> Vec<PeerHandle> {
        self.peers
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect()
    }

    /// Live inbound session count.
    pub fn inbound_count(&self) -> usize {
        self.peers
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_live() && !p.is_outbound())
            .count()
    }

    /// Whether another inbound connection would exceed the cap.
    pub fn at_inbound_capacity(&self) -> bool {
        self.inbound_count() >= self.max_inbound
    }

    /// Whether a live *outbound* session already targets `host_port`.
    /// Used to reject the simultaneous-connect race on the inbound side.
    pub fn has_outbound_to(&self, host_port: &HostPort) -> bool {
        self.peers
            .read()
            .unwrap()
            .values()
            .any(|p| p.is_live() && p.is_outbound() && p.matches_host_port(host_port))
    }

    /// Any live session addressed by `host_port`.
    pub fn find_by_host_port(&self, host_port: &HostPort) -> Option<PeerHandle> {
        self.peers
            .read()
            .unwrap()
            .values()
            .find(|p| p.is_live() && p.matches_host_port(host_port))
            .cloned()
    }

    /// Advertised addresses of every active peer — the payload of a
    /// `CONNECTION_REFUSED`.
    pub fn active_host_ports(&self) -> Vec<HostPort> {
        self.iter_active()
            .iter()
            .filter_map(|p| p.advertised())
            .collect()
    }

    /// Send a copy of `msg` to every active peer, in each session's own
    /// queue order.
    pub fn broadcast(&self, msg: &Message) {
        for peer in self.iter_active() {
            peer.send(msg.clone());
        }
    }
}

/// Outbound addresses the connect loop should keep trying: the configured
/// peers plus any learned from `CONNECTION_REFUSED` peer lists. An address
/// is removed once a handshake with it completes.
#[derive(Default)]
pub struct AddressBook {
    addresses: Mutex<HashSet<HostPort>>,
}

impl AddressBook {
    /// Create a book seeded with the configured peer addresses.
    pub fn new(seed: impl IntoIterator<Item = HostPort>) -> Self {
        Self {
            addresses: Mutex::new(seed.into_iter().collect()),
        }
    }

    /// Add one address to retry.
    pub fn add(&self, host_port: HostPort) {
        self.addresses.lock().unwrap().insert(host_port);
    }

    /// Merge a harvested peer list.
    pub fn extend(&self, host_ports: impl IntoIterator<Item = HostPort>) {
        self.addresses.lock().unwrap().extend(host_ports);
    }

    /// Forget an address (its handshake completed).
    pub fn remove(&self, host_port: &HostPort) {
        self.addresses.lock().unwrap().remove(host_port);
    }

    /// Snapshot for one retry sweep.
    pub fn snapshot(&self) -> Vec<HostPort> {
        self.addresses.lock().unwrap().iter().cloned().collect()
    }
}
