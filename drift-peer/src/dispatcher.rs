//! Inbound message parsing, validation, and routing.
//!
//! One logical consumer drains the shared inbound queue for every peer
//! session. Handshake-family messages drive the session state machine
//! inline; everything else is validated against session state and handed
//! to the transfer coordinator or the filesystem engine on a spawned task,
//! so file I/O never stalls queue consumption. Malformed lines, unknown
//! commands, and out-of-state messages are all terminal for the offending
//! session: `INVALID_PROTOCOL`, then close.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use drift_fs::{FsEvent, SyncTree};
use drift_wire::{HostPort, Message};

use crate::roster::{AddressBook, Roster};
use crate::session::{PeerHandle, PeerState};
use crate::transfer::{with_tree, BeginKind, TransferCoordinator};

/// One inbound wire line, tagged with the session it arrived on.
pub type Inbound = (PeerHandle, String);

/// Routes every inbound message to the right component.
#[derive(Clone)]
pub struct Dispatcher {
    tree: Arc<SyncTree>,
    coordinator: Arc<TransferCoordinator>,
    roster: Arc<Roster>,
    book: Arc<AddressBook>,
    advertised: HostPort,
}

impl Dispatcher {
    /// Build a dispatcher over the node's shared components.
    pub fn new(
        tree: Arc<SyncTree>,
        coordinator: Arc<TransferCoordinator>,
        roster: Arc<Roster>,
        book: Arc<AddressBook>,
        advertised: HostPort,
    ) -> Self {
        Self {
            tree,
            coordinator,
            roster,
            book,
            advertised,
        }
    }

    /// Spawn the queue consumer.
    pub fn spawn_consumer(self, mut rx: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((peer, line)) = rx.recv().await {
                self.dispatch(peer, line).await;
            }
        })
    }

    /// Handle one inbound line from one session.
    pub async fn dispatch(&self, peer: PeerHandle, line: String) {
        if line.trim().is_empty() {
            return;
        }
        let msg = match Message::decode(&line) {
            Ok(msg) => msg,
            Err(e) => {
                self.protocol_violation(&peer, format!("unable to parse message: {e}"));
                return;
            }
        };
        tracing::debug!(peer = %peer.display_name(), command = msg.command(), "message received");
        // A response settles any pending retry of its request.
        peer.observe(&msg);

        match msg {
            Message::HandshakeRequest {
                host_port,
                friendly_name,
            } => self.handle_handshake_request(peer, host_port, friendly_name).await,
            Message::HandshakeResponse { host_port } => {
                self.handle_handshake_response(peer, host_port).await
            }
            Message::ConnectionRefused { message, peers } => {
                tracing::warn!(
                    peer = %peer.display_name(),
                    reason = %message,
                    learned = peers.len(),
                    "connection refused by peer"
                );
                self.book.extend(peers);
                peer.close();
            }
            Message::InvalidProtocol { message } => {
                tracing::warn!(
                    peer = %peer.display_name(),
                    reason = %message,
                    "peer reported a protocol violation, closing"
                );
                peer.close();
            }
            other => {
                if !peer.is_active() {
                    self.protocol_violation(
                        &peer,
                        format!("{} received before handshake completed", other.command()),
                    );
                    return;
                }
                // Filesystem work runs off the queue consumer; per-transfer
                // ordering is preserved by the one-outstanding-request rule.
                let ctx = self.clone();
                tokio::spawn(async move {
                    ctx.handle_active(peer, other).await;
                });
            }
        }
    }

    /// Messages allowed only on an active session.
    async fn handle_active(&self, peer: PeerHandle, msg: Message) {
        match msg {
            Message::FileCreateRequest {
                file_descriptor,
                path_name,
            } => {
                let (status, message) = if self.tree.is_safe_path(&path_name) {
                    self.coordinator
                        .begin_transfer(&peer, BeginKind::Create, &path_name, file_descriptor.clone())
                        .await
                } else {
                    (false, format!("unsafe pathname: {path_name}"))
                };
                peer.send(Message::FileCreateResponse {
                    file_descriptor,
                    path_name,
                    message,
                    status,
                });
            }
            Message::FileModifyRequest {
                file_descriptor,
                path_name,
            } => {
                let (status, message) = if self.tree.is_safe_path(&path_name) {
                    self.coordinator
                        .begin_transfer(&peer, BeginKind::Modify, &path_name, file_descriptor.clone())
                        .await
                } else {
                    (false, format!("unsafe pathname: {path_name}"))
                };
                peer.send(Message::FileModifyResponse {
                    file_descriptor,
                    path_name,
                    message,
                    status,
                });
            }
            Message::FileDeleteRequest {
                file_descriptor,
                path_name,
            } => {
                let result = {
                    let path = path_name.clone();
                    let descriptor = file_descriptor.clone();
                    with_tree(&self.tree, move |tree| tree.delete_file(&path, &descriptor)).await
                };
                let (status, message) = match result {
                    Some(Ok(())) => {
                        self.coordinator.forget_path(&path_name);
                        (true, "file deleted".to_string())
                    }
                    Some(Err(e)) => (false, e.to_string()),
                    None => (false, "internal error: filesystem task failed".to_string()),
                };
                peer.send(Message::FileDeleteResponse {
                    file_descriptor,
                    path_name,
                    message,
                    status,
                });
            }
            Message::DirectoryCreateRequest { path_name } => {
                let result = {
                    let path = path_name.clone();
                    with_tree(&self.tree, move |tree| tree.create_directory(&path)).await
                };
                let (status, message) = match result {
                    Some(Ok(())) => (true, "directory created".to_string()),
                    Some(Err(e)) => (false, e.to_string()),
                    None => (false, "internal error: filesystem task failed".to_string()),
                };
                peer.send(Message::DirectoryCreateResponse {
                    path_name,
                    message,
                    status,
                });
            }
            Message::DirectoryDeleteRequest { path_name } => {
                let result = {
                    let path = path_name.clone();
                    with_tree(&self.tree, move |tree| tree.delete_directory(&path)).await
                };
                let (status, message) = match result {
                    Some(Ok(())) => (true, "directory deleted".to_string()),
                    Some(Err(e)) => (false, e.to_string()),
                    None => (false, "internal error: filesystem task failed".to_string()),
                };
                peer.send(Message::DirectoryDeleteResponse {
                    path_name,
                    message,
                    status,
                });
            }
            Message::FileBytesRequest {
                file_descriptor,
                path_name,
                position,
                length,
            } => {
                let response = self
                    .coordinator
                    .handle_bytes_request(path_name, file_descriptor, position, length)
                    .await;
                peer.send(response);
            }
            Message::FileBytesResponse {
                file_descriptor,
                path_name,
                position,
                length: _,
                content,
                status,
                message,
            } => {
                self.coordinator
                    .handle_bytes_response(
                        &peer,
                        path_name,
                        file_descriptor,
                        position,
                        content,
                        status,
                        message,
                    )
                    .await;
            }
            // Responses to our own announcements are informational — a
            // rejected create on one peer is not fatal to the session.
            other @ (Message::FileCreateResponse { .. }
            | Message::FileModifyResponse { .. }
            | Message::FileDeleteResponse { .. }
            | Message::DirectoryCreateResponse { .. }
            | Message::DirectoryDeleteResponse { .. }) => {
                if let Some((status, reason)) = other.response_status() {
                    if status {
                        tracing::debug!(
                            peer = %peer.display_name(),
                            command = other.command(),
                            "peer accepted request"
                        );
                    } else {
                        tracing::warn!(
                            peer = %peer.display_name(),
                            command = other.command(),
                            reason,
                            "peer rejected request"
                        );
                    }
                }
            }
            // Handshake-family messages never reach here; dispatch()
            // consumes them before spawning.
            _ => {}
        }
    }

    async fn handle_handshake_request(
        &self,
        peer: PeerHandle,
        host_port: HostPort,
        friendly_name: Option<String>,
    ) {
        match peer.state() {
            PeerState::AwaitingRequest => {
                // Simultaneous-connect race: we already dialed the address
                // this peer advertises, so one of the two connections has
                // to go.
                if self.roster.has_outbound_to(&host_port) {
                    tracing::info!(
                        advertised = %host_port,
                        "refusing inbound duplicate of an existing outbound session"
                    );
                    peer.enqueue(Message::ConnectionRefused {
                        message: "already connected to you".to_string(),
                        peers: self.roster.active_host_ports(),
                    });
                    peer.close();
                    return;
                }
                peer.set_advertised(host_port);
                peer.set_friendly_name(friendly_name);
                peer.activate();
                peer.enqueue(Message::HandshakeResponse {
                    host_port: self.advertised.clone(),
                });
                tracing::info!(peer = %peer.display_name(), "handshake complete (inbound)");
                self.full_sync(&peer).await;
            }
            PeerState::AwaitingResponse | PeerState::Active => {
                // Simultaneous connect or a duplicated datagram; tolerated.
                tracing::debug!(
                    peer = %peer.display_name(),
                    "ignoring handshake request on an already-initiated session"
                );
            }
            PeerState::Inactive | PeerState::Closed => {}
        }
    }

    async fn handle_handshake_response(&self, peer: PeerHandle, host_port: HostPort) {
        match peer.state() {
            PeerState::AwaitingResponse => {
                // The handshake succeeded; stop retrying this address.
                self.book.remove(&host_port);
                if let Some(dialed) = peer.dialed() {
                    self.book.remove(&dialed);
                }
                peer.set_advertised(host_port);
                peer.activate();
                tracing::info!(peer = %peer.display_name(), "handshake complete (outbound)");
                self.full_sync(&peer).await;
            }
            _ => {
                tracing::debug!(
                    peer = %peer.display_name(),
                    "ignoring unexpected handshake response"
                );
            }
        }
    }

    /// Replay the whole tree to a freshly active peer.
    async fn full_sync(&self, peer: &PeerHandle) {
        let events = with_tree(&self.tree, |tree| tree.sync_events())
            .await
            .unwrap_or_default();
        tracing::info!(
            peer = %peer.display_name(),
            events = events.len(),
            "sending full tree replay"
        );
        for event in events {
            peer.send(event_message(event));
        }
    }

    fn protocol_violation(&self, peer: &PeerHandle, why: String) {
        tracing::warn!(
            peer = %peer.display_name(),
            reason = %why,
            "protocol violation, closing session"
        );
        peer.enqueue(Message::InvalidProtocol { message: why });
        peer.close();
    }
}

/// Serialize a filesystem event into its announcement message.
pub fn event_message(event: FsEvent) -> Message {
    match event {
        FsEvent::FileCreate {
            path_name,
            descriptor,
        } => Message::FileCreateRequest {
            file_descriptor: descriptor,
            path_name,
        },
        FsEvent::FileModify {
            path_name,
            descriptor,
        } => Message::FileModifyRequest {
            file_descriptor: descriptor,
            path_name,
        },
        FsEvent::FileDelete {
            path_name,
            descriptor,
        } => Message::FileDeleteRequest {
            file_descriptor: descriptor,
            path_name,
        },
        FsEvent::DirectoryCreate { path_name } => Message::DirectoryCreateRequest { path_name },
        FsEvent::DirectoryDelete { path_name } => Message::DirectoryDeleteRequest { path_name },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;
    use crate::session::{Direction, Peer, RetryPolicy};
    use drift_fs::hash_bytes;
    use drift_wire::FileDescriptor;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    struct Fixture {
        dispatcher: Dispatcher,
        book: Arc<AddressBook>,
        roster: Arc<Roster>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        tree.scan();
        let coordinator = Arc::new(TransferCoordinator::new(tree.clone(), 8192, 3));
        let roster = Arc::new(Roster::new(10));
        let book = Arc::new(AddressBook::default());
        let dispatcher = Dispatcher::new(
            tree,
            coordinator,
            roster.clone(),
            book.clone(),
            HostPort::new("localhost", 8111),
        );
        Fixture {
            dispatcher,
            book,
            roster,
            _dir: dir,
        }
    }

    fn seeded_fixture(files: &[(&str, &[u8])]) -> Fixture {
        let dir = tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        tree.scan();
        let coordinator = Arc::new(TransferCoordinator::new(tree.clone(), 8192, 3));
        let roster = Arc::new(Roster::new(10));
        let book = Arc::new(AddressBook::default());
        let dispatcher = Dispatcher::new(
            tree,
            coordinator,
            roster.clone(),
            book.clone(),
            HostPort::new("localhost", 8111),
        );
        Fixture {
            dispatcher,
            book,
            roster,
            _dir: dir,
        }
    }

    fn peer_pair(direction: Direction) -> (PeerHandle, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (link, rx) = MockLink::new();
        (
            Peer::spawn(link, direction, "remote:1".to_string(), RetryPolicy::default()),
            rx,
        )
    }

    async fn recv_message(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Message {
        let line = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("writer stopped");
        Message::decode(&line).unwrap()
    }

    #[tokio::test]
    async fn malformed_line_is_terminal() {
        let f = fixture();
        let (peer, mut rx) = peer_pair(Direction::Inbound);

        f.dispatcher
            .dispatch(peer.clone(), "{not json at all".to_string())
            .await;

        match recv_message(&mut rx).await {
            Message::InvalidProtocol { message } => {
                assert!(message.contains("unable to parse"))
            }
            other => panic!("expected InvalidProtocol, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
        assert!(!peer.is_live());
    }

    #[tokio::test]
    async fn non_handshake_before_handshake_is_terminal() {
        let f = fixture();
        let (peer, mut rx) = peer_pair(Direction::Inbound);

        let line = Message::DirectoryCreateRequest {
            path_name: "d".to_string(),
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;

        match recv_message(&mut rx).await {
            Message::InvalidProtocol { message } => {
                assert!(message.contains("DIRECTORY_CREATE_REQUEST"))
            }
            other => panic!("expected InvalidProtocol, got {other:?}"),
        }
        assert!(!peer.is_live());
    }

    #[tokio::test]
    async fn handshake_request_activates_and_replays_tree() {
        let f = seeded_fixture(&[("docs/a.txt", b"hello")]);
        let (peer, mut rx) = peer_pair(Direction::Inbound);

        let line = Message::HandshakeRequest {
            host_port: HostPort::new("remote.example", 9000),
            friendly_name: Some("remote-node".to_string()),
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;

        match recv_message(&mut rx).await {
            Message::HandshakeResponse { host_port } => {
                assert_eq!(host_port, HostPort::new("localhost", 8111))
            }
            other => panic!("expected HandshakeResponse, got {other:?}"),
        }
        // Full replay: parent directory first, then the file.
        match recv_message(&mut rx).await {
            Message::DirectoryCreateRequest { path_name } => assert_eq!(path_name, "docs"),
            other => panic!("expected DirectoryCreateRequest, got {other:?}"),
        }
        match recv_message(&mut rx).await {
            Message::FileCreateRequest {
                path_name,
                file_descriptor,
            } => {
                assert_eq!(path_name, "docs/a.txt");
                assert_eq!(file_descriptor.md5, hash_bytes(b"hello"));
            }
            other => panic!("expected FileCreateRequest, got {other:?}"),
        }
        assert!(peer.is_active());
        assert_eq!(peer.display_name(), "remote-node");
    }

    #[tokio::test]
    async fn simultaneous_connect_duplicate_is_refused_with_peer_list() {
        let f = fixture();

        // We already dialed this address ourselves.
        let (outbound, _orx) = peer_pair(Direction::Outbound);
        outbound.set_dialed(HostPort::new("remote.example", 9000));
        f.roster.add(outbound);

        // And an unrelated active peer for the refusal's peer list.
        let (active, _arx) = peer_pair(Direction::Inbound);
        active.set_advertised(HostPort::new("other.example", 9100));
        active.activate();
        f.roster.add(active);

        let (peer, mut rx) = peer_pair(Direction::Inbound);
        let line = Message::HandshakeRequest {
            host_port: HostPort::new("remote.example", 9000),
            friendly_name: None,
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;

        match recv_message(&mut rx).await {
            Message::ConnectionRefused { peers, .. } => {
                assert_eq!(peers, vec![HostPort::new("other.example", 9100)]);
            }
            other => panic!("expected ConnectionRefused, got {other:?}"),
        }
        assert!(!peer.is_live());
    }

    #[tokio::test]
    async fn handshake_response_activates_outbound_and_settles_address() {
        let f = fixture();
        f.book.add(HostPort::new("remote.example", 9000));

        let (peer, _rx) = peer_pair(Direction::Outbound);
        peer.set_dialed(HostPort::new("remote.example", 9000));

        let line = Message::HandshakeResponse {
            host_port: HostPort::new("remote.example", 9000),
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;

        assert!(peer.is_active());
        assert!(f.book.snapshot().is_empty(), "handshake success removes the address");
    }

    #[tokio::test]
    async fn connection_refused_harvests_peer_list() {
        let f = fixture();
        let (peer, _rx) = peer_pair(Direction::Outbound);

        let line = Message::ConnectionRefused {
            message: "connection limit reached".to_string(),
            peers: vec![
                HostPort::new("alt-a.example", 9000),
                HostPort::new("alt-b.example", 9001),
            ],
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;

        assert!(!peer.is_live());
        let learned = f.book.snapshot();
        assert!(learned.contains(&HostPort::new("alt-a.example", 9000)));
        assert!(learned.contains(&HostPort::new("alt-b.example", 9001)));
    }

    #[tokio::test]
    async fn stale_modify_request_gets_failure_response_and_no_loader() {
        let f = seeded_fixture(&[("f.txt", b"current content")]);
        let (peer, mut rx) = peer_pair(Direction::Inbound);
        peer.activate();

        let stale = FileDescriptor::new(hash_bytes(b"ancient content"), 500, 15);
        let line = Message::FileModifyRequest {
            file_descriptor: stale,
            path_name: "f.txt".to_string(),
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;

        match recv_message(&mut rx).await {
            Message::FileModifyResponse {
                status, message, ..
            } => {
                assert!(!status);
                assert!(message.contains("stale"), "message was: {message}");
            }
            other => panic!("expected FileModifyResponse, got {other:?}"),
        }
        assert!(!f._dir.path().join("f.txt.driftpart").exists());
        // An informational rejection never closes the session.
        assert!(peer.is_live());
    }

    #[tokio::test]
    async fn traversal_path_is_rejected_in_responses() {
        let f = fixture();
        let (peer, mut rx) = peer_pair(Direction::Inbound);
        peer.activate();

        let line = Message::FileCreateRequest {
            file_descriptor: FileDescriptor::new(hash_bytes(b"x"), 1_000, 1),
            path_name: "../../etc/passwd".to_string(),
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;

        match recv_message(&mut rx).await {
            Message::FileCreateResponse {
                status, message, ..
            } => {
                assert!(!status);
                assert!(message.contains("unsafe"));
            }
            other => panic!("expected FileCreateResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_requests_round_trip() {
        let f = fixture();
        let (peer, mut rx) = peer_pair(Direction::Inbound);
        peer.activate();

        let line = Message::DirectoryCreateRequest {
            path_name: "fresh".to_string(),
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;
        match recv_message(&mut rx).await {
            Message::DirectoryCreateResponse { status, .. } => assert!(status),
            other => panic!("expected DirectoryCreateResponse, got {other:?}"),
        }
        assert!(f._dir.path().join("fresh").is_dir());

        let line = Message::DirectoryDeleteRequest {
            path_name: "fresh".to_string(),
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;
        match recv_message(&mut rx).await {
            Message::DirectoryDeleteResponse { status, .. } => assert!(status),
            other => panic!("expected DirectoryDeleteResponse, got {other:?}"),
        }
        assert!(!f._dir.path().join("fresh").exists());
    }

    #[tokio::test]
    async fn failed_responses_are_logged_not_escalated() {
        let f = fixture();
        let (peer, _rx) = peer_pair(Direction::Inbound);
        peer.activate();

        let line = Message::FileCreateResponse {
            file_descriptor: FileDescriptor::new("00", 1, 1),
            path_name: "f.txt".to_string(),
            message: "pathname already exists".to_string(),
            status: false,
        }
        .encode()
        .unwrap();
        f.dispatcher.dispatch(peer.clone(), line).await;

        // Give the spawned handler a moment, then confirm the session survived.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(peer.is_active());
    }

    #[test]
    fn events_map_onto_announcement_commands() {
        let fd = FileDescriptor::new("00", 1, 1);
        let cases = [
            (
                FsEvent::FileCreate {
                    path_name: "p".to_string(),
                    descriptor: fd.clone(),
                },
                "FILE_CREATE_REQUEST",
            ),
            (
                FsEvent::FileModify {
                    path_name: "p".to_string(),
                    descriptor: fd.clone(),
                },
                "FILE_MODIFY_REQUEST",
            ),
            (
                FsEvent::FileDelete {
                    path_name: "p".to_string(),
                    descriptor: fd,
                },
                "FILE_DELETE_REQUEST",
            ),
            (
                FsEvent::DirectoryCreate {
                    path_name: "p".to_string(),
                },
                "DIRECTORY_CREATE_REQUEST",
            ),
            (
                FsEvent::DirectoryDelete {
                    path_name: "p".to_string(),
                },
                "DIRECTORY_DELETE_REQUEST",
            ),
        ];
        for (event, command) in cases {
            assert_eq!(event_message(event).command(), command);
        }
    }
}
