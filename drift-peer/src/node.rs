//! The running node: transports, background loops, and the admin surface.
//!
//! [`SyncNode::start`] binds the configured transport and spawns the
//! node's background tasks: the dispatcher consumer, the accept/receive
//! loop, the periodic filesystem scan (whose events broadcast to every
//! active peer), and the outbound connect retry loop. Everything is torn
//! down by [`SyncNode::stop`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use drift_fs::SyncTree;
use drift_wire::{HostPort, Message};

use crate::config::{Config, Mode};
use crate::dispatcher::{event_message, Dispatcher, Inbound};
use crate::error::Result;
use crate::link::{TcpLink, UdpLink};
use crate::roster::{AddressBook, Roster};
use crate::session::{Direction, Peer, PeerHandle, RetryPolicy};
use crate::transfer::TransferCoordinator;

/// Shared state of the UDP transport: one socket, sessions keyed by the
/// datagram source address.
#[derive(Clone)]
struct UdpShared {
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<SocketAddr, PeerHandle>>,
}

/// One running driftsync node.
pub struct SyncNode {
    config: Arc<Config>,
    tree: Arc<SyncTree>,
    coordinator: Arc<TransferCoordinator>,
    roster: Arc<Roster>,
    book: Arc<AddressBook>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    udp: Option<UdpShared>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncNode {
    /// Bind the transport, seed the watched tree, and spawn the node's
    /// background tasks.
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let tree = Arc::new(SyncTree::open(&config.node.share_dir)?);

        // Seed the watched maps before any peer can ask for a replay.
        {
            let tree = tree.clone();
            tokio::task::spawn_blocking(move || tree.scan())
                .await
                .map_err(|e| std::io::Error::other(e))?;
        }

        let coordinator = Arc::new(TransferCoordinator::new(
            tree.clone(),
            config.sync.block_size,
            config.udp.max_retries,
        ));
        let roster = Arc::new(Roster::new(config.limits.max_inbound_peers));
        let book = Arc::new(AddressBook::new(config.peer_host_ports()?));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            tree.clone(),
            coordinator.clone(),
            roster.clone(),
            book.clone(),
            config.advertised_host_port(),
        );

        let mut tcp_listener = None;
        let mut udp = None;
        let local_addr = match config.node.mode {
            Mode::Tcp => {
                let listener = TcpListener::bind(("0.0.0.0", config.node.port)).await?;
                let addr = listener.local_addr()?;
                tcp_listener = Some(listener);
                addr
            }
            Mode::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", config.node.port)).await?;
                let addr = socket.local_addr()?;
                udp = Some(UdpShared {
                    socket: Arc::new(socket),
                    peers: Arc::new(DashMap::new()),
                });
                addr
            }
        };

        let node = Arc::new(Self {
            config: config.clone(),
            tree,
            coordinator,
            roster,
            book,
            inbound_tx,
            udp,
            local_addr,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![dispatcher.spawn_consumer(inbound_rx)];
        match config.node.mode {
            Mode::Tcp => {
                if let Some(listener) = tcp_listener {
                    tasks.push(tokio::spawn(tcp_accept_loop(node.clone(), listener)));
                }
            }
            Mode::Udp => {
                tasks.push(tokio::spawn(udp_recv_loop(node.clone())));
            }
        }
        tasks.push(tokio::spawn(scan_loop(node.clone())));
        tasks.push(tokio::spawn(connect_loop(node.clone())));
        *node.tasks.lock().unwrap() = tasks;

        tracing::info!(
            mode = ?config.node.mode,
            addr = %local_addr,
            share = %node.tree.root().display(),
            files = node.tree.watched_file_count(),
            "node started"
        );
        Ok(node)
    }

    /// The bound listen address (useful when the configured port was 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The engine behind this node.
    pub fn tree(&self) -> &Arc<SyncTree> {
        &self.tree
    }

    /// Advertised addresses of every active peer.
    pub fn list_active_peers(&self) -> Vec<HostPort> {
        self.roster.active_host_ports()
    }

    /// Dial a peer now. Returns whether a session was initiated (TCP also
    /// requires the dial itself to succeed; the handshake completes
    /// asynchronously).
    pub async fn try_connect(self: &Arc<Self>, host_port: &HostPort) -> bool {
        match self.config.node.mode {
            Mode::Tcp => {
                match TcpStream::connect((host_port.host.as_str(), host_port.port)).await {
                    Ok(stream) => {
                        let peer = self.register_tcp_peer(
                            stream,
                            Direction::Outbound,
                            Some(host_port.clone()),
                        );
                        self.send_handshake(&peer);
                        tracing::info!(peer = %host_port, "dialed peer, handshake sent");
                        true
                    }
                    Err(e) => {
                        tracing::debug!(peer = %host_port, error = %e, "connect failed, will retry");
                        false
                    }
                }
            }
            Mode::Udp => {
                let Some(udp) = self.udp.clone() else {
                    return false;
                };
                let target = match tokio::net::lookup_host((host_port.host.as_str(), host_port.port))
                    .await
                {
                    Ok(mut addrs) => addrs.next(),
                    Err(e) => {
                        tracing::debug!(peer = %host_port, error = %e, "address lookup failed");
                        None
                    }
                };
                let Some(target) = target else { return false };
                if let Some(existing) = udp.peers.get(&target) {
                    if existing.is_live() {
                        return true;
                    }
                }
                let peer =
                    self.register_udp_peer(&udp, target, Direction::Outbound, Some(host_port.clone()));
                self.send_handshake(&peer);
                tracing::info!(peer = %host_port, "handshake sent over datagram transport");
                true
            }
        }
    }

    /// Close the session addressed by `host_port`, if any.
    pub fn disconnect(&self, host_port: &HostPort) -> bool {
        match self.roster.find_by_host_port(host_port) {
            Some(peer) => {
                peer.close();
                true
            }
            None => false,
        }
    }

    /// Abort the background tasks and close every session.
    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for peer in self.roster.iter_live() {
            peer.close();
        }
        tracing::info!("node stopped");
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.config.udp.retry_interval_millis),
            max_retries: self.config.udp.max_retries,
        }
    }

    fn send_handshake(&self, peer: &PeerHandle) {
        peer.enqueue(Message::HandshakeRequest {
            host_port: self.config.advertised_host_port(),
            friendly_name: self.config.node.advertised_name.clone(),
        });
    }

    /// Roster registration plus the disconnect cleanup every session needs:
    /// leave the roster and cancel any transfers keyed to the peer.
    fn attach_peer(&self, peer: &PeerHandle) {
        let roster = self.roster.clone();
        let coordinator = self.coordinator.clone();
        let id = peer.id();
        peer.on_close(move || {
            roster.remove(&id);
            coordinator.cancel_for_peer(id);
        });
        self.roster.add(peer.clone());
    }

    fn register_tcp_peer(
        self: &Arc<Self>,
        stream: TcpStream,
        direction: Direction,
        dialed: Option<HostPort>,
    ) -> PeerHandle {
        let remote_label = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        let link = Arc::new(TcpLink::new(write_half));
        let peer = Peer::spawn(link, direction, remote_label, self.retry_policy());
        if let Some(host_port) = dialed {
            peer.set_dialed(host_port);
        }
        self.attach_peer(&peer);

        // Reader task: one per connection, feeding the shared dispatcher
        // queue. Any transport error closes the session; the close sequence
        // runs exactly once no matter who triggers it.
        let inbound_tx = self.inbound_tx.clone();
        let reader_peer = peer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if inbound_tx.send((reader_peer.clone(), line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(peer = %reader_peer.display_name(), error = %e, "read failed");
                        break;
                    }
                }
            }
            reader_peer.close();
        });
        peer
    }

    fn register_udp_peer(
        &self,
        udp: &UdpShared,
        target: SocketAddr,
        direction: Direction,
        dialed: Option<HostPort>,
    ) -> PeerHandle {
        let link = Arc::new(UdpLink::new(
            udp.socket.clone(),
            target,
            self.config.udp.max_payload,
        ));
        let peer = Peer::spawn(link, direction, target.to_string(), self.retry_policy());
        if let Some(host_port) = dialed {
            peer.set_dialed(host_port);
        }
        self.attach_peer(&peer);

        udp.peers.insert(target, peer.clone());
        let peers = udp.peers.clone();
        let id = peer.id();
        peer.on_close(move || {
            peers.remove_if(&target, |_, p| p.id() == id);
        });
        peer
    }

    /// Find or create the session behind a datagram source address.
    /// Returns `None` when a new inbound session would exceed the cap (the
    /// sender gets a refusal listing active peers and is never registered).
    fn udp_peer_for(&self, addr: SocketAddr) -> Option<PeerHandle> {
        let udp = self.udp.as_ref()?;
        if let Some(existing) = udp.peers.get(&addr) {
            if existing.is_live() {
                return Some(existing.clone());
            }
        }
        if self.roster.at_inbound_capacity() {
            tracing::info!(%addr, "refusing datagram peer: at inbound capacity");
            let refusal = Message::ConnectionRefused {
                message: "connection limit reached".to_string(),
                peers: self.roster.active_host_ports(),
            };
            if let Ok(line) = refusal.encode() {
                let socket = udp.socket.clone();
                tokio::spawn(async move {
                    let mut payload = line.into_bytes();
                    payload.push(b'\n');
                    let _ = socket.send_to(&payload, addr).await;
                });
            }
            return None;
        }
        Some(self.register_udp_peer(udp, addr, Direction::Inbound, None))
    }
}

async fn tcp_accept_loop(node: Arc<SyncNode>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if node.roster.at_inbound_capacity() {
                    tracing::info!(%addr, "refusing inbound connection: at capacity");
                    let refusal = Message::ConnectionRefused {
                        message: "connection limit reached".to_string(),
                        peers: node.roster.active_host_ports(),
                    };
                    tokio::spawn(refuse_raw_tcp(stream, refusal));
                    continue;
                }
                node.register_tcp_peer(stream, Direction::Inbound, None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Refuse a connection that never becomes a session: write the refusal on
/// the raw socket and hang up.
async fn refuse_raw_tcp(stream: TcpStream, refusal: Message) {
    let Ok(line) = refusal.encode() else { return };
    let (_read, mut write) = stream.into_split();
    let _ = write.write_all(line.as_bytes()).await;
    let _ = write.write_all(b"\n").await;
    let _ = write.shutdown().await;
}

async fn udp_recv_loop(node: Arc<SyncNode>) {
    let Some(udp) = node.udp.clone() else { return };
    let mut buf = vec![0u8; node.config.udp.max_payload.max(1024)];
    loop {
        match udp.socket.recv_from(&mut buf).await {
            Ok((n, addr)) => {
                let line = String::from_utf8_lossy(&buf[..n]).into_owned();
                let Some(peer) = node.udp_peer_for(addr) else {
                    continue;
                };
                let _ = node.inbound_tx.send((peer, line));
            }
            Err(e) => {
                tracing::warn!(error = %e, "datagram receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Periodic reconciliation: scan, then broadcast every event to every
/// active peer in event order.
async fn scan_loop(node: Arc<SyncNode>) {
    let secs = node.config.sync.scan_interval_secs.max(1);
    let mut timer = interval(Duration::from_secs(secs));
    loop {
        timer.tick().await;
        let tree = node.tree.clone();
        let events = match tokio::task::spawn_blocking(move || tree.scan()).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "scan task failed");
                continue;
            }
        };
        if events.is_empty() {
            continue;
        }
        tracing::debug!(count = events.len(), "broadcasting filesystem events");
        for event in events {
            node.roster.broadcast(&event_message(event));
        }
    }
}

/// Retry every known-but-unconnected outbound address on a fixed cadence.
async fn connect_loop(node: Arc<SyncNode>) {
    let secs = node.config.sync.connect_interval_secs.max(1);
    let mut timer = interval(Duration::from_secs(secs));
    loop {
        timer.tick().await;
        for host_port in node.book.snapshot() {
            if node.roster.find_by_host_port(&host_port).is_some() {
                continue;
            }
            node.try_connect(&host_port).await;
        }
    }
}
