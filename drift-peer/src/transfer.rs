//! Chunked file-transfer coordination.
//!
//! The coordinator turns "peer P announced file F" into a sequence of
//! byte-range request/response exchanges. At most one transfer is active
//! per path — a same-path announcement with a newer `lastModified`
//! supersedes the one in flight, anything older is ignored. One request is
//! outstanding per transfer at a time, which is what keeps chunk handling
//! for a path sequential without any global lock.
//!
//! Engine calls run on the blocking pool; the transfer map itself is only
//! ever held for map operations, never across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use drift_fs::{FsError, SyncTree};
use drift_wire::{decode_content, encode_content, FileDescriptor, Message};

use crate::session::PeerHandle;

/// Run a closure against the engine on the blocking pool. `None` only when
/// the blocking task itself dies, which callers treat as an internal error.
pub(crate) async fn with_tree<T, F>(tree: &Arc<SyncTree>, f: F) -> Option<T>
where
    F: FnOnce(&SyncTree) -> T + Send + 'static,
    T: Send + 'static,
{
    let tree = tree.clone();
    tokio::task::spawn_blocking(move || f(&tree)).await.ok()
}

/// How a transfer was announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginKind {
    /// `FILE_CREATE_REQUEST`: the path should not exist yet.
    Create,
    /// `FILE_MODIFY_REQUEST`: the path exists and is being replaced.
    Modify,
}

struct Transfer {
    peer_id: Uuid,
    descriptor: FileDescriptor,
    position: u64,
    failures: u32,
}

/// Tracks and drives all in-flight incoming transfers.
pub struct TransferCoordinator {
    tree: Arc<SyncTree>,
    block_size: u64,
    max_failures: u32,
    transfers: Mutex<HashMap<String, Transfer>>,
}

impl TransferCoordinator {
    /// Create a coordinator over the given engine.
    ///
    /// `block_size` caps both requested and served chunk sizes;
    /// `max_failures` bounds same-offset retries after failed responses so
    /// a persistently failing peer cannot loop forever.
    pub fn new(tree: Arc<SyncTree>, block_size: u64, max_failures: u32) -> Self {
        Self {
            tree,
            block_size,
            max_failures,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    /// Drop the bookkeeping for a path without touching its loader.
    pub fn forget_path(&self, path: &str) {
        self.transfers.lock().unwrap().remove(path);
    }

    /// React to a file announcement: resolve same-path races, stage a
    /// loader, consult the shortcut, and issue the first byte request.
    ///
    /// Returns the `(status, message)` pair for the announcement response.
    pub async fn begin_transfer(
        &self,
        peer: &PeerHandle,
        kind: BeginKind,
        path: &str,
        descriptor: FileDescriptor,
    ) -> (bool, String) {
        // Same-path races resolve by lastModified: newer wins, the loser's
        // loader is cancelled. The reservation is inserted in the same
        // critical section so a concurrent announcement sees it.
        let superseded;
        {
            let mut transfers = self.transfers.lock().unwrap();
            let existing_mtime = transfers.get(path).map(|t| t.descriptor.last_modified);
            match existing_mtime {
                Some(mtime) if descriptor.last_modified <= mtime => {
                    tracing::info!(
                        path,
                        "ignoring announcement: transfer for newer or equal content in flight"
                    );
                    return (
                        false,
                        "a transfer for newer or equal content is already in progress".to_string(),
                    );
                }
                Some(_) => {
                    tracing::info!(path, "superseding in-flight transfer with newer content");
                    transfers.remove(path);
                    superseded = true;
                }
                None => superseded = false,
            }
            transfers.insert(
                path.to_string(),
                Transfer {
                    peer_id: peer.id(),
                    descriptor: descriptor.clone(),
                    position: 0,
                    failures: 0,
                },
            );
        }

        let loader_result = {
            let path_owned = path.to_string();
            let d = descriptor.clone();
            with_tree(&self.tree, move |tree| {
                if superseded {
                    tree.cancel_loader(&path_owned);
                }
                match kind {
                    BeginKind::Create => tree.create_loader(&path_owned, d),
                    BeginKind::Modify => match tree.modify_loader(&path_owned, d.clone()) {
                        // The watched file can be missing when this modify
                        // supersedes a create that never finished; proceed
                        // as a create so the content still arrives.
                        Err(FsError::NotFound { .. }) => tree.create_loader(&path_owned, d),
                        other => other,
                    },
                }
            })
            .await
        };
        match loader_result {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.release_if_owned(path, peer.id(), &descriptor);
                return (false, e.to_string());
            }
            None => {
                self.release_if_owned(path, peer.id(), &descriptor);
                return (false, "internal error: filesystem task failed".to_string());
            }
        }

        // Shortcut before any bytes move: matching local content finishes
        // the transfer with a copy.
        let shortcut = {
            let path_owned = path.to_string();
            with_tree(&self.tree, move |tree| tree.check_shortcut(&path_owned)).await
        };
        match shortcut {
            Some(Ok(true)) => {
                self.release_if_owned(path, peer.id(), &descriptor);
                tracing::info!(path, "transfer completed from matching local content");
                return (true, "created from matching local content".to_string());
            }
            Some(Ok(false)) => {}
            Some(Err(e)) => {
                self.release_if_owned(path, peer.id(), &descriptor);
                self.cancel_loader_task(path).await;
                return (false, e.to_string());
            }
            None => {
                self.release_if_owned(path, peer.id(), &descriptor);
                self.cancel_loader_task(path).await;
                return (false, "internal error: filesystem task failed".to_string());
            }
        }

        // An empty file has nothing to request; the empty placeholder
        // either already matches or the announcement was nonsense.
        if descriptor.file_size == 0 {
            let done = {
                let path_owned = path.to_string();
                with_tree(&self.tree, move |tree| tree.check_write_complete(&path_owned)).await
            };
            self.release_if_owned(path, peer.id(), &descriptor);
            return match done {
                Some(Ok(true)) => (true, "created".to_string()),
                Some(Ok(false)) => {
                    self.cancel_loader_task(path).await;
                    (false, "empty file did not match its descriptor".to_string())
                }
                Some(Err(e)) => {
                    self.cancel_loader_task(path).await;
                    (false, e.to_string())
                }
                None => {
                    self.cancel_loader_task(path).await;
                    (false, "internal error: filesystem task failed".to_string())
                }
            };
        }

        // A newer announcement may have superseded us while the loader was
        // being staged; if our reservation is gone, so is our loader.
        {
            let transfers = self.transfers.lock().unwrap();
            match transfers.get(path) {
                Some(t) if t.peer_id == peer.id() && t.descriptor == descriptor => {}
                _ => return (false, "superseded by newer content".to_string()),
            }
        }

        let length = self.block_size.min(descriptor.file_size);
        peer.send(Message::FileBytesRequest {
            file_descriptor: descriptor,
            path_name: path.to_string(),
            position: 0,
            length,
        });
        (true, "ready for content".to_string())
    }

    /// Responder side: serve a byte range from local content matching the
    /// descriptor's hash. The requested length is clamped to our own block
    /// size; failures are always reported, never dropped.
    pub async fn handle_bytes_request(
        &self,
        path: String,
        descriptor: FileDescriptor,
        position: u64,
        length: u64,
    ) -> Message {
        let clamped = length.min(self.block_size);
        let read = {
            let md5 = descriptor.md5.clone();
            with_tree(&self.tree, move |tree| tree.read_file(&md5, position, clamped)).await
        };
        match read {
            Some(Ok(bytes)) => {
                let served = bytes.len() as u64;
                Message::FileBytesResponse {
                    file_descriptor: descriptor,
                    path_name: path,
                    position,
                    length: served,
                    content: encode_content(&bytes),
                    message: "successful read".to_string(),
                    status: true,
                }
            }
            Some(Err(e)) => failed_bytes_response(descriptor, path, position, length, e.to_string()),
            None => failed_bytes_response(
                descriptor,
                path,
                position,
                length,
                "internal error: filesystem task failed".to_string(),
            ),
        }
    }

    /// Requester side: write a received chunk, finish the transfer after
    /// the last expected chunk, or issue the next request. Failure-status
    /// responses retry the same offset (bounded); local write errors
    /// cancel the transfer outright.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_bytes_response(
        &self,
        peer: &PeerHandle,
        path: String,
        descriptor: FileDescriptor,
        position: u64,
        content: String,
        status: bool,
        message: String,
    ) {
        let (expected_position, file_size) = {
            let transfers = self.transfers.lock().unwrap();
            match transfers.get(&path) {
                Some(t) if t.peer_id == peer.id() && t.descriptor.md5 == descriptor.md5 => {
                    (t.position, t.descriptor.file_size)
                }
                Some(_) => {
                    tracing::debug!(path = %path, "dropping bytes response for superseded transfer");
                    return;
                }
                None => {
                    tracing::debug!(path = %path, "dropping bytes response with no matching transfer");
                    return;
                }
            }
        };

        if !status {
            self.retry_same_offset(peer, &path, &descriptor, expected_position, file_size, &message)
                .await;
            return;
        }

        // Duplicate or late responses (UDP resends) target an offset we
        // already passed; ignore them and let the outstanding request's own
        // retry produce the current chunk again if needed.
        if position != expected_position {
            tracing::debug!(
                path = %path,
                position,
                expected_position,
                "ignoring out-of-sequence bytes response"
            );
            return;
        }

        let bytes = match decode_content(&content) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "invalid base64 in bytes response, cancelling transfer");
                self.abort_transfer(&path).await;
                return;
            }
        };
        let wrote_len = bytes.len() as u64;
        if wrote_len == 0 {
            // A success response with no data cannot make progress.
            self.retry_same_offset(peer, &path, &descriptor, expected_position, file_size, "empty content")
                .await;
            return;
        }

        let write = {
            let path_owned = path.clone();
            with_tree(&self.tree, move |tree| {
                tree.write_loader(&path_owned, position, &bytes)
            })
            .await
        };
        match write {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                // Local I/O failure is terminal for the transfer; retrying
                // would fail the same way.
                tracing::warn!(path = %path, error = %e, "loader write failed, cancelling transfer");
                self.abort_transfer(&path).await;
                return;
            }
            None => {
                self.abort_transfer(&path).await;
                return;
            }
        }

        let new_position = position + wrote_len;
        if new_position >= file_size {
            // Last expected chunk: the one full-file hash check of the
            // whole transfer.
            let complete = {
                let path_owned = path.clone();
                with_tree(&self.tree, move |tree| tree.check_write_complete(&path_owned)).await
            };
            match complete {
                Some(Ok(true)) => {
                    self.forget_path(&path);
                    tracing::info!(path = %path, peer = %peer.display_name(), "file transfer complete");
                }
                Some(Ok(false)) => {
                    tracing::warn!(path = %path, "content hash mismatch after final chunk, cancelling transfer");
                    self.abort_transfer(&path).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(path = %path, error = %e, "completion check failed, cancelling transfer");
                    self.abort_transfer(&path).await;
                }
                None => {
                    self.abort_transfer(&path).await;
                }
            }
            return;
        }

        let next_length = self.block_size.min(file_size - new_position);
        {
            let mut transfers = self.transfers.lock().unwrap();
            match transfers.get_mut(&path) {
                Some(t) if t.peer_id == peer.id() && t.descriptor.md5 == descriptor.md5 => {
                    t.position = new_position;
                    t.failures = 0;
                }
                _ => return, // superseded while writing
            }
        }
        peer.send(Message::FileBytesRequest {
            file_descriptor: descriptor,
            path_name: path,
            position: new_position,
            length: next_length,
        });
    }

    /// Cancel every transfer keyed to a disconnected peer and remove the
    /// loaders. Registered as a close hook at session creation, so it runs
    /// exactly once per session from the blocking pool.
    pub fn cancel_for_peer(&self, peer_id: Uuid) {
        let paths: Vec<String> = {
            let mut transfers = self.transfers.lock().unwrap();
            let paths: Vec<String> = transfers
                .iter()
                .filter(|(_, t)| t.peer_id == peer_id)
                .map(|(p, _)| p.clone())
                .collect();
            for path in &paths {
                transfers.remove(path);
            }
            paths
        };
        for path in paths {
            self.tree.cancel_loader(&path);
            tracing::info!(path = %path, "transfer cancelled: peer disconnected");
        }
    }

    async fn retry_same_offset(
        &self,
        peer: &PeerHandle,
        path: &str,
        descriptor: &FileDescriptor,
        position: u64,
        file_size: u64,
        why: &str,
    ) {
        let exhausted = {
            let mut transfers = self.transfers.lock().unwrap();
            match transfers.get_mut(path) {
                Some(t) => {
                    t.failures += 1;
                    t.failures > self.max_failures
                }
                None => return,
            }
        };
        if exhausted {
            tracing::warn!(path, why, "peer keeps failing byte requests, cancelling transfer");
            self.abort_transfer(path).await;
            return;
        }
        tracing::debug!(path, why, "byte request failed remotely, retrying same offset");
        let length = self.block_size.min(file_size.saturating_sub(position)).max(1);
        peer.send(Message::FileBytesRequest {
            file_descriptor: descriptor.clone(),
            path_name: path.to_string(),
            position,
            length,
        });
    }

    async fn abort_transfer(&self, path: &str) {
        self.forget_path(path);
        self.cancel_loader_task(path).await;
    }

    async fn cancel_loader_task(&self, path: &str) {
        let path_owned = path.to_string();
        with_tree(&self.tree, move |tree| tree.cancel_loader(&path_owned)).await;
    }

    fn release_if_owned(&self, path: &str, peer_id: Uuid, descriptor: &FileDescriptor) {
        let mut transfers = self.transfers.lock().unwrap();
        if let Some(t) = transfers.get(path) {
            if t.peer_id == peer_id && t.descriptor == *descriptor {
                transfers.remove(path);
            }
        }
    }
}

fn failed_bytes_response(
    descriptor: FileDescriptor,
    path: String,
    position: u64,
    length: u64,
    message: String,
) -> Message {
    Message::FileBytesResponse {
        file_descriptor: descriptor,
        path_name: path,
        position,
        length,
        content: String::new(),
        message,
        status: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;
    use crate::session::{Direction, Peer, RetryPolicy};
    use drift_fs::hash_bytes;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn descriptor_of(content: &[u8], mtime: u64) -> FileDescriptor {
        FileDescriptor::new(hash_bytes(content), mtime, content.len() as u64)
    }

    fn active_peer() -> (PeerHandle, mpsc::UnboundedReceiver<String>) {
        let (link, rx) = MockLink::new();
        let peer = Peer::spawn(
            link,
            Direction::Inbound,
            "test-peer".to_string(),
            RetryPolicy::default(),
        );
        peer.activate();
        (peer, rx)
    }

    async fn recv_message(rx: &mut mpsc::UnboundedReceiver<String>) -> Message {
        let line = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("writer stopped");
        Message::decode(&line).unwrap()
    }

    #[tokio::test]
    async fn chunked_transfer_runs_to_completion() {
        let source_dir = tempdir().unwrap();
        let sink_dir = tempdir().unwrap();
        let content = b"ten bytes!";
        std::fs::write(source_dir.path().join("f.bin"), content).unwrap();

        let source_tree = Arc::new(SyncTree::open(source_dir.path()).unwrap());
        source_tree.scan();
        let sink_tree = Arc::new(SyncTree::open(sink_dir.path()).unwrap());

        let source = TransferCoordinator::new(source_tree, 4, 3);
        let sink = TransferCoordinator::new(sink_tree, 4, 3);

        let (peer, mut rx) = active_peer();
        let descriptor = descriptor_of(content, 1_700_000_000_000);

        let (status, _msg) = sink
            .begin_transfer(&peer, BeginKind::Create, "f.bin", descriptor.clone())
            .await;
        assert!(status);

        // Drive request/response rounds until the sink stops asking.
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds <= 4, "transfer did not converge");
            match recv_message(&mut rx).await {
                Message::FileBytesRequest {
                    file_descriptor,
                    path_name,
                    position,
                    length,
                } => {
                    let response = source
                        .handle_bytes_request(path_name.clone(), file_descriptor, position, length)
                        .await;
                    match response {
                        Message::FileBytesResponse {
                            file_descriptor,
                            path_name,
                            position,
                            content,
                            status,
                            message,
                            ..
                        } => {
                            assert!(status, "source failed: {message}");
                            sink.handle_bytes_response(
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
                        other => panic!("unexpected response: {other:?}"),
                    }
                }
                other => panic!("unexpected message: {other:?}"),
            }
            if sink.in_flight() == 0 {
                break;
            }
        }

        // Three rounds for a 10-byte file at block size 4.
        assert_eq!(rounds, 3);
        assert_eq!(
            std::fs::read(sink_dir.path().join("f.bin")).unwrap(),
            content
        );
        assert!(!sink_dir.path().join("f.bin.driftpart").exists());
    }

    #[tokio::test]
    async fn newer_announcement_supersedes_in_flight_transfer() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        let coordinator = TransferCoordinator::new(tree, 1024, 3);
        let (peer, mut rx) = active_peer();

        let older = descriptor_of(b"old content", 1_000);
        let newer = descriptor_of(b"new content!", 2_000);

        let (status, _) = coordinator
            .begin_transfer(&peer, BeginKind::Create, "f.txt", older.clone())
            .await;
        assert!(status);
        match recv_message(&mut rx).await {
            Message::FileBytesRequest { file_descriptor, .. } => {
                assert_eq!(file_descriptor.md5, older.md5)
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // Newer descriptor wins; only one transfer remains.
        let (status, _) = coordinator
            .begin_transfer(&peer, BeginKind::Create, "f.txt", newer.clone())
            .await;
        assert!(status);
        assert_eq!(coordinator.in_flight(), 1);
        match recv_message(&mut rx).await {
            Message::FileBytesRequest { file_descriptor, .. } => {
                assert_eq!(file_descriptor.md5, newer.md5)
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // A late response for the superseded transfer is dropped silently.
        coordinator
            .handle_bytes_response(
                &peer,
                "f.txt".to_string(),
                older.clone(),
                0,
                encode_content(b"old content"),
                true,
                "successful read".to_string(),
            )
            .await;
        assert_eq!(coordinator.in_flight(), 1);

        // And an even older announcement is refused outright.
        let (status, message) = coordinator
            .begin_transfer(&peer, BeginKind::Create, "f.txt", older)
            .await;
        assert!(!status);
        assert!(message.contains("already in progress"));
    }

    #[tokio::test]
    async fn shortcut_completes_without_byte_requests() {
        let dir = tempdir().unwrap();
        let content = b"content that already exists locally";
        std::fs::write(dir.path().join("original.txt"), content).unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        tree.scan();

        let coordinator = TransferCoordinator::new(tree, 1024, 3);
        let (peer, mut rx) = active_peer();

        let (status, message) = coordinator
            .begin_transfer(
                &peer,
                BeginKind::Create,
                "copy.txt",
                descriptor_of(content, 2_000),
            )
            .await;
        assert!(status, "{message}");
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(std::fs::read(dir.path().join("copy.txt")).unwrap(), content);

        // No byte request ever went out.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_file_completes_without_byte_requests() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        let coordinator = TransferCoordinator::new(tree, 1024, 3);
        let (peer, mut rx) = active_peer();

        let (status, _) = coordinator
            .begin_transfer(&peer, BeginKind::Create, "empty.txt", descriptor_of(b"", 1_000))
            .await;
        assert!(status);
        assert!(dir.path().join("empty.txt").exists());
        assert_eq!(coordinator.in_flight(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn modify_transfer_replaces_existing_content() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"old").unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        tree.scan();

        let coordinator = TransferCoordinator::new(tree, 1024, 3);
        let (peer, mut rx) = active_peer();
        let new_content = b"replacement";
        let descriptor = descriptor_of(new_content, 4_000_000_000_000);

        let (status, message) = coordinator
            .begin_transfer(&peer, BeginKind::Modify, "f.txt", descriptor.clone())
            .await;
        assert!(status, "{message}");

        match recv_message(&mut rx).await {
            Message::FileBytesRequest { position, length, .. } => {
                assert_eq!(position, 0);
                assert_eq!(length, new_content.len() as u64);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        coordinator
            .handle_bytes_response(
                &peer,
                "f.txt".to_string(),
                descriptor,
                0,
                encode_content(new_content),
                true,
                "successful read".to_string(),
            )
            .await;

        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(
            std::fs::read(dir.path().join("f.txt")).unwrap(),
            new_content
        );
    }

    #[tokio::test]
    async fn failure_responses_retry_same_offset_until_exhausted() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        let coordinator = TransferCoordinator::new(tree, 1024, 2);
        let (peer, mut rx) = active_peer();
        let descriptor = descriptor_of(b"some content", 1_000);

        let (status, _) = coordinator
            .begin_transfer(&peer, BeginKind::Create, "f.txt", descriptor.clone())
            .await;
        assert!(status);
        match recv_message(&mut rx).await {
            Message::FileBytesRequest { position, .. } => assert_eq!(position, 0),
            other => panic!("unexpected message: {other:?}"),
        }

        // Two failures retry the same offset.
        for _ in 0..2 {
            coordinator
                .handle_bytes_response(
                    &peer,
                    "f.txt".to_string(),
                    descriptor.clone(),
                    0,
                    String::new(),
                    false,
                    "read failed".to_string(),
                )
                .await;
            match recv_message(&mut rx).await {
                Message::FileBytesRequest { position, .. } => assert_eq!(position, 0),
                other => panic!("unexpected message: {other:?}"),
            }
        }

        // The third failure exhausts the budget: transfer and loader gone.
        coordinator
            .handle_bytes_response(
                &peer,
                "f.txt".to_string(),
                descriptor,
                0,
                String::new(),
                false,
                "read failed".to_string(),
            )
            .await;
        assert_eq!(coordinator.in_flight(), 0);
        assert!(!dir.path().join("f.txt.driftpart").exists());
    }

    #[tokio::test]
    async fn bytes_request_failures_are_reported_not_dropped() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        let coordinator = TransferCoordinator::new(tree, 1024, 3);

        let response = coordinator
            .handle_bytes_request(
                "nowhere.txt".to_string(),
                FileDescriptor::new("ffffffffffffffffffffffffffffffff", 1, 10),
                0,
                10,
            )
            .await;
        match response {
            Message::FileBytesResponse {
                status, message, content, ..
            } => {
                assert!(!status);
                assert!(!message.is_empty());
                assert!(content.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bytes_request_clamps_length_to_block_size() {
        let dir = tempdir().unwrap();
        let content = b"0123456789abcdef";
        std::fs::write(dir.path().join("f.bin"), content).unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        tree.scan();
        let coordinator = TransferCoordinator::new(tree, 4, 3);

        let response = coordinator
            .handle_bytes_request(
                "f.bin".to_string(),
                descriptor_of(content, 1_000),
                0,
                1_000_000,
            )
            .await;
        match response {
            Message::FileBytesResponse {
                status,
                length,
                content,
                ..
            } => {
                assert!(status);
                assert_eq!(length, 4);
                assert_eq!(decode_content(&content).unwrap(), b"0123");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_disconnect_cancels_its_transfers() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        let coordinator = TransferCoordinator::new(tree, 1024, 3);
        let (peer, _rx) = active_peer();

        let (status, _) = coordinator
            .begin_transfer(
                &peer,
                BeginKind::Create,
                "f.txt",
                descriptor_of(b"content", 1_000),
            )
            .await;
        assert!(status);
        assert_eq!(coordinator.in_flight(), 1);
        assert!(dir.path().join("f.txt.driftpart").exists());

        coordinator.cancel_for_peer(peer.id());
        assert_eq!(coordinator.in_flight(), 0);
        assert!(!dir.path().join("f.txt.driftpart").exists());
    }

    #[tokio::test]
    async fn responses_from_other_peers_are_ignored() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(SyncTree::open(dir.path()).unwrap());
        let coordinator = TransferCoordinator::new(tree, 1024, 3);
        let (owner, _rx1) = active_peer();
        let (stranger, _rx2) = active_peer();
        let content = b"content";
        let descriptor = descriptor_of(content, 1_000);

        let (status, _) = coordinator
            .begin_transfer(&owner, BeginKind::Create, "f.txt", descriptor.clone())
            .await;
        assert!(status);

        coordinator
            .handle_bytes_response(
                &stranger,
                "f.txt".to_string(),
                descriptor,
                0,
                encode_content(content),
                true,
                "successful read".to_string(),
            )
            .await;
        // Still in flight: the stranger's bytes were not accepted.
        assert_eq!(coordinator.in_flight(), 1);
        assert!(!dir.path().join("f.txt").exists());
    }
}
