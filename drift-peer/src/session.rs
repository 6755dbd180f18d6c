//! Per-peer session state machine and outbound queue.
//!
//! Every connected peer gets one [`Peer`]: a small state machine around the
//! handshake lifecycle, a single-consumer ordered outbound queue drained by
//! exactly one writer task, and (for datagram links) a retry ledger that
//! resends unacknowledged requests until a matching response is observed or
//! the attempt budget runs out.
//!
//! Handles are freely cloneable and safe to use after the session closes:
//! every operation on a closed peer is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use drift_wire::{HostPort, Message};

use crate::link::Link;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Inbound connection, waiting for the peer's handshake request.
    AwaitingRequest,
    /// Outbound connection, handshake request sent, waiting for the response.
    AwaitingResponse,
    /// Handshake complete; normal traffic flows.
    Active,
    /// Close requested; the writer is flushing its final messages. No
    /// further sends are honored.
    Inactive,
    /// Terminal: writer finished, transport torn down.
    Closed,
}

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote peer connected to us.
    Inbound,
    /// We connected to the remote peer.
    Outbound,
}

/// Retry behavior for requests over an unreliable link.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Time between resends of an unacknowledged request.
    pub interval: Duration,
    /// Resend attempts before the session is closed as timed out.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            max_retries: 5,
        }
    }
}

/// Shared handle to one peer session.
pub type PeerHandle = Arc<Peer>;

type CloseHook = Box<dyn FnOnce() + Send>;

/// One peer session.
pub struct Peer {
    id: Uuid,
    direction: Direction,
    remote_label: String,
    friendly_name: Mutex<Option<String>>,
    advertised: Mutex<Option<HostPort>>,
    dialed: Mutex<Option<HostPort>>,
    state: Mutex<PeerState>,
    queue: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    close_hooks: Mutex<Vec<CloseHook>>,
    retries: RetryLedger,
}

impl Peer {
    /// Create the session and spawn its writer task (plus, for datagram
    /// links, its retry timer).
    pub fn spawn(
        link: Arc<dyn Link>,
        direction: Direction,
        remote_label: String,
        retry: RetryPolicy,
    ) -> PeerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id: Uuid::new_v4(),
            direction,
            remote_label,
            friendly_name: Mutex::new(None),
            advertised: Mutex::new(None),
            dialed: Mutex::new(None),
            state: Mutex::new(match direction {
                Direction::Inbound => PeerState::AwaitingRequest,
                Direction::Outbound => PeerState::AwaitingResponse,
            }),
            queue: Mutex::new(Some(tx)),
            close_hooks: Mutex::new(Vec::new()),
            retries: RetryLedger::new(retry.max_retries),
        });

        tokio::spawn(writer_task(Arc::downgrade(&peer), link.clone(), rx));
        if link.is_datagram() {
            tokio::spawn(retry_task(Arc::downgrade(&peer), link, retry.interval));
        }
        peer
    }

    /// Session id, unique per process.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether we dialed this peer.
    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    /// Whether the session can still make progress (pre-close).
    pub fn is_live(&self) -> bool {
        matches!(
            self.state(),
            PeerState::AwaitingRequest | PeerState::AwaitingResponse | PeerState::Active
        )
    }

    /// Whether the handshake has completed.
    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    /// Complete the handshake. Only moves forward from a pre-handshake
    /// state; closed sessions stay closed.
    pub fn activate(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(
            *state,
            PeerState::AwaitingRequest | PeerState::AwaitingResponse
        ) {
            *state = PeerState::Active;
        }
    }

    /// Record the address the peer advertised in its handshake.
    pub fn set_advertised(&self, host_port: HostPort) {
        *self.advertised.lock().unwrap() = Some(host_port);
    }

    /// The address the peer claims to be reachable on.
    pub fn advertised(&self) -> Option<HostPort> {
        self.advertised.lock().unwrap().clone()
    }

    /// Record the address we dialed to reach this peer.
    pub fn set_dialed(&self, host_port: HostPort) {
        *self.dialed.lock().unwrap() = Some(host_port);
    }

    /// The address we dialed, if we initiated.
    pub fn dialed(&self) -> Option<HostPort> {
        self.dialed.lock().unwrap().clone()
    }

    /// Record the friendly name the peer offered.
    pub fn set_friendly_name(&self, name: Option<String>) {
        *self.friendly_name.lock().unwrap() = name;
    }

    /// Name for log lines: friendly name, else advertised address, else
    /// the transport-level remote address.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.friendly_name.lock().unwrap().clone() {
            return name;
        }
        if let Some(hp) = self.advertised.lock().unwrap().clone() {
            return hp.to_string();
        }
        self.remote_label.clone()
    }

    /// Whether this peer is addressed by `host_port` (advertised or dialed,
    /// fuzzy equality).
    pub fn matches_host_port(&self, host_port: &HostPort) -> bool {
        if let Some(hp) = self.advertised.lock().unwrap().as_ref() {
            if hp.fuzzy_eq(host_port) {
                return true;
            }
        }
        if let Some(hp) = self.dialed.lock().unwrap().as_ref() {
            if hp.fuzzy_eq(host_port) {
                return true;
            }
        }
        false
    }

    /// Send a message, validating session state.
    ///
    /// Honored only while `Active`. On a closed or closing session this is
    /// a no-op. In any other live state the payload is discarded — queuing
    /// it across the handshake would break ordering — and the violation is
    /// reported to the peer before closing.
    pub fn send(&self, msg: Message) {
        match self.state() {
            PeerState::Active => self.enqueue(msg),
            PeerState::Inactive | PeerState::Closed => {}
            PeerState::AwaitingRequest | PeerState::AwaitingResponse => {
                tracing::warn!(
                    peer = %self.display_name(),
                    command = msg.command(),
                    "message attempted before handshake completed"
                );
                self.enqueue(Message::InvalidProtocol {
                    message: format!(
                        "{} not allowed until the handshake completes",
                        msg.command()
                    ),
                });
                self.close();
            }
        }
    }

    /// Queue a message without a state check. Session-internal traffic
    /// only (handshakes, refusals, violation notices).
    pub(crate) fn enqueue(&self, msg: Message) {
        if let Some(tx) = self.queue.lock().unwrap().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Settle any pending retry matched by this inbound message. Inbound
    /// requests never settle anything — only responses answer requests.
    pub(crate) fn observe(&self, msg: &Message) {
        if !msg.is_request() {
            self.retries.settle(&msg.summary_key());
        }
    }

    /// Register a hook to run when the session closes. Hooks run exactly
    /// once; registering on an already-closed session runs the hook
    /// immediately so cleanup can never be skipped.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let run_now = {
            let state = self.state.lock().unwrap();
            if matches!(*state, PeerState::Inactive | PeerState::Closed) {
                true
            } else {
                self.close_hooks.lock().unwrap().push(Box::new(hook));
                return;
            }
        };
        if run_now {
            tokio::task::spawn_blocking(hook);
        }
    }

    /// Close the session. Idempotent and safe to race: exactly one caller
    /// runs the close sequence (hook drain, retry cancel, writer stop);
    /// everyone else observes a closing/closed state and returns.
    pub fn close(&self) {
        let hooks: Vec<CloseHook>;
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, PeerState::Inactive | PeerState::Closed) {
                return;
            }
            *state = PeerState::Inactive;
            hooks = std::mem::take(&mut *self.close_hooks.lock().unwrap());
        }
        // Dropping the sender lets the writer drain whatever is already
        // queued (the final flush), then mark the session Closed.
        self.queue.lock().unwrap().take();
        self.retries.clear();
        tracing::info!(peer = %self.display_name(), "session closed");
        if !hooks.is_empty() {
            tokio::task::spawn_blocking(move || {
                for hook in hooks {
                    hook();
                }
            });
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote", &self.remote_label)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Drains the outbound queue in order — the single writer per session.
async fn writer_task(
    peer: Weak<Peer>,
    link: Arc<dyn Link>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let line = match msg.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outbound message");
                continue;
            }
        };
        // Register before the first transmission so a lost first datagram
        // is still retried.
        if link.is_datagram() && msg.is_request() {
            if let Some(peer) = peer.upgrade() {
                peer.retries.register(msg.summary_key(), line.clone());
            }
        }
        if let Err(e) = link.send_line(&line).await {
            tracing::debug!(error = %e, "send failed, closing session");
            if let Some(peer) = peer.upgrade() {
                peer.close();
            }
            break;
        }
    }
    if let Some(peer) = peer.upgrade() {
        *peer.state.lock().unwrap() = PeerState::Closed;
    }
    link.shutdown().await;
}

/// One timer per session resends every due request — not one thread per
/// outstanding request.
async fn retry_task(peer: Weak<Peer>, link: Arc<dyn Link>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.tick().await; // consume the immediate first tick
    loop {
        timer.tick().await;
        let Some(peer) = peer.upgrade() else { return };
        if !peer.is_live() {
            return;
        }
        match peer.retries.tick() {
            RetryTick::Idle => {}
            RetryTick::Resend(lines) => {
                for line in lines {
                    if let Err(e) = link.send_line(&line).await {
                        tracing::debug!(error = %e, "retry resend failed");
                    }
                }
            }
            RetryTick::Exhausted => {
                tracing::warn!(
                    peer = %peer.display_name(),
                    "request retries exhausted, closing timed-out session"
                );
                peer.close();
                return;
            }
        }
    }
}

/// Outstanding requests awaiting responses, keyed by summary key.
struct RetryLedger {
    max_retries: u32,
    entries: Mutex<HashMap<String, RetryEntry>>,
}

struct RetryEntry {
    line: String,
    attempts: u32,
}

enum RetryTick {
    Idle,
    Resend(Vec<String>),
    Exhausted,
}

impl RetryLedger {
    fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, key: String, line: String) {
        self.entries
            .lock()
            .unwrap()
            .insert(key, RetryEntry { line, attempts: 0 });
    }

    fn settle(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn tick(&self) -> RetryTick {
        let mut entries = self.entries.lock().unwrap();
        if entries.is_empty() {
            return RetryTick::Idle;
        }
        for entry in entries.values_mut() {
            entry.attempts += 1;
            if entry.attempts > self.max_retries {
                return RetryTick::Exhausted;
            }
        }
        RetryTick::Resend(entries.values().map(|e| e.line.clone()).collect())
    }
}
