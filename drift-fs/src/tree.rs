//! The watched-tree engine: scan diffing, event ordering, and the loader
//! lifecycle.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use drift_wire::FileDescriptor;

use crate::error::FsError;
use crate::event::FsEvent;
use crate::hash::{hash_bytes, hash_file};
use crate::loader::{Loader, PART_SUFFIX};

/// The reconciliation engine for one shared directory.
///
/// Owns the watched-file map, watched-directory set, content-hash reverse
/// index, and loader map — all under a single mutex, since loader promotion
/// mutates the watched maps. Filesystem cost dominates lock hold times, so
/// the coarse lock is deliberate.
pub struct SyncTree {
    root: PathBuf,
    inner: Mutex<TreeState>,
}

#[derive(Default)]
struct TreeState {
    /// Relative path -> descriptor of the complete on-disk file.
    files: HashMap<String, FileDescriptor>,
    /// Relative paths of watched directories (root excluded).
    directories: HashSet<String>,
    /// Content hash -> watched paths carrying that content.
    hash_index: HashMap<String, HashSet<String>>,
    /// Relative path -> in-progress incoming transfer.
    loaders: HashMap<String, Loader>,
}

impl SyncTree {
    /// Open (creating if necessary) the share root.
    ///
    /// The watched maps start empty; the first [`scan`](Self::scan) seeds
    /// them from disk.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, FsError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| FsError::io(root.display().to_string(), e))?;
        let root = root
            .canonicalize()
            .map_err(|e| FsError::io(root.display().to_string(), e))?;
        Ok(Self {
            root,
            inner: Mutex::new(TreeState::default()),
        })
    }

    /// The canonicalized share root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of watched files.
    pub fn watched_file_count(&self) -> usize {
        self.lock().files.len()
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    /// Walk the root, reconcile the watched maps against disk, and return
    /// the change events in a safe replay order: creation-side events
    /// (directory creates, file creates/modifies) sorted shallowest-first,
    /// then deletion-side events sorted deepest-first so no directory is
    /// reported deleted before its children.
    ///
    /// A file is only rehashed when its on-disk mtime differs from the
    /// cached descriptor; hashing is O(file size) and the mtime is the
    /// cache key.
    pub fn scan(&self) -> Vec<FsEvent> {
        let mut state = self.lock();
        let (disk_dirs, disk_files) = self.walk();

        let mut creations: Vec<FsEvent> = Vec::new();

        for dir in &disk_dirs {
            if state.directories.insert(dir.clone()) {
                creations.push(FsEvent::DirectoryCreate {
                    path_name: dir.clone(),
                });
            }
        }

        for (path, &(mtime, size)) in &disk_files {
            let unchanged = state
                .files
                .get(path)
                .is_some_and(|fd| fd.last_modified == mtime);
            if unchanged {
                continue;
            }
            let md5 = match hash_file(&self.abs(path)) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to hash file, skipping this pass");
                    continue;
                }
            };
            let descriptor = FileDescriptor::new(md5, mtime, size);
            let old = state.files.insert(path.clone(), descriptor.clone());
            if let Some(old) = &old {
                detach_hash(&mut state, &old.md5, path);
            }
            state
                .hash_index
                .entry(descriptor.md5.clone())
                .or_default()
                .insert(path.clone());
            creations.push(match old {
                None => FsEvent::FileCreate {
                    path_name: path.clone(),
                    descriptor,
                },
                Some(_) => FsEvent::FileModify {
                    path_name: path.clone(),
                    descriptor,
                },
            });
        }

        creations.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.path_name().cmp(b.path_name()))
        });

        let gone_files: Vec<String> = state
            .files
            .keys()
            .filter(|p| !disk_files.contains_key(*p))
            .cloned()
            .collect();
        let gone_dirs: Vec<String> = state
            .directories
            .iter()
            .filter(|d| !disk_dirs.contains(*d))
            .cloned()
            .collect();

        let mut deletions: Vec<FsEvent> = Vec::new();
        for path in gone_files {
            if let Some(fd) = state.files.remove(&path) {
                detach_hash(&mut state, &fd.md5, &path);
                deletions.push(FsEvent::FileDelete {
                    path_name: path,
                    descriptor: fd,
                });
            }
        }
        for dir in gone_dirs {
            state.directories.remove(&dir);
            deletions.push(FsEvent::DirectoryDelete { path_name: dir });
        }
        deletions.sort_by(|a, b| {
            b.depth()
                .cmp(&a.depth())
                .then_with(|| b.path_name().cmp(a.path_name()))
        });

        let mut events = creations;
        events.append(&mut deletions);
        events
    }

    /// Replay the entire watched tree from empty: every directory
    /// (shallowest-first), then every file, as create events. Handed to a
    /// freshly connected peer so it can reconstruct full state without a
    /// separate bulk-transfer protocol.
    pub fn sync_events(&self) -> Vec<FsEvent> {
        let state = self.lock();

        let mut dirs: Vec<&String> = state.directories.iter().collect();
        dirs.sort_by(|a, b| {
            depth_of(a)
                .cmp(&depth_of(b))
                .then_with(|| a.cmp(b))
        });

        let mut events: Vec<FsEvent> = dirs
            .into_iter()
            .map(|d| FsEvent::DirectoryCreate {
                path_name: d.clone(),
            })
            .collect();

        let mut files: Vec<(&String, &FileDescriptor)> = state.files.iter().collect();
        files.sort_by(|a, b| a.0.cmp(b.0));
        events.extend(files.into_iter().map(|(p, fd)| FsEvent::FileCreate {
            path_name: p.clone(),
            descriptor: fd.clone(),
        }));

        events
    }

    // ------------------------------------------------------------------
    // Path safety
    // ------------------------------------------------------------------

    /// Whether `path` is a relative path that stays inside the share root.
    ///
    /// Purely lexical — the path need not exist yet. Rejects absolute
    /// paths, traversal above the root, the root itself, and placeholder
    /// names (peers may not address `.driftpart` files).
    pub fn is_safe_path(&self, path: &str) -> bool {
        let p = Path::new(path);
        if p.is_absolute() {
            return false;
        }
        let mut depth = 0usize;
        for component in p.components() {
            match component {
                Component::Normal(name) => {
                    if name.to_string_lossy().ends_with(PART_SUFFIX) {
                        return false;
                    }
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => match depth.checked_sub(1) {
                    Some(d) => depth = d,
                    None => return false,
                },
                Component::RootDir | Component::Prefix(_) => return false,
            }
        }
        depth > 0
    }

    // ------------------------------------------------------------------
    // Loader API
    // ------------------------------------------------------------------

    /// Start a loader for a brand-new file. Fails with `AlreadyExists` if a
    /// file or loader already occupies the path.
    pub fn create_loader(&self, path: &str, descriptor: FileDescriptor) -> Result<(), FsError> {
        self.ensure_safe(path)?;
        let mut state = self.lock();
        if state.loaders.contains_key(path)
            || state.files.contains_key(path)
            || self.abs(path).exists()
        {
            return Err(FsError::AlreadyExists {
                path: path.to_string(),
            });
        }
        let loader = Loader::create(&self.abs(path), descriptor)
            .map_err(|e| FsError::io(path, e))?;
        state.loaders.insert(path.to_string(), loader);
        Ok(())
    }

    /// Idempotent loader creation: when several chunks race to initialize
    /// the same path, the first caller creates the loader and later callers
    /// attach to it.
    pub fn create_or_get_loader(
        &self,
        path: &str,
        descriptor: FileDescriptor,
    ) -> Result<(), FsError> {
        self.ensure_safe(path)?;
        let mut state = self.lock();
        if state.loaders.contains_key(path) {
            return Ok(());
        }
        let loader = Loader::create(&self.abs(path), descriptor)
            .map_err(|e| FsError::io(path, e))?;
        state.loaders.insert(path.to_string(), loader);
        Ok(())
    }

    /// Start a loader replacing an existing watched file.
    ///
    /// Accepted only when the watched file is not newer than the incoming
    /// descriptor, or its hash already matches — anything else means the
    /// file changed locally while the modify request was in flight, and the
    /// request is stale.
    pub fn modify_loader(&self, path: &str, descriptor: FileDescriptor) -> Result<(), FsError> {
        self.ensure_safe(path)?;
        let mut state = self.lock();
        if state.loaders.contains_key(path) {
            return Err(FsError::AlreadyExists {
                path: path.to_string(),
            });
        }
        let watched = state.files.get(path).ok_or_else(|| FsError::NotFound {
            path: path.to_string(),
        })?;
        let acceptable = watched.md5 == descriptor.md5
            || watched.last_modified <= descriptor.last_modified;
        if !acceptable {
            return Err(FsError::StaleOrConflicting {
                path: path.to_string(),
            });
        }
        let loader = Loader::create(&self.abs(path), descriptor)
            .map_err(|e| FsError::io(path, e))?;
        state.loaders.insert(path.to_string(), loader);
        Ok(())
    }

    /// Write `buf` at `offset` into the loader's placeholder.
    pub fn write_loader(&self, path: &str, offset: u64, buf: &[u8]) -> Result<(), FsError> {
        let mut state = self.lock();
        let loader = state
            .loaders
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound {
                path: path.to_string(),
            })?;
        let size = loader.descriptor().file_size;
        if offset > size {
            return Err(FsError::OutOfRange {
                path: path.to_string(),
                offset,
                size,
            });
        }
        if !loader.part_exists() {
            // Placeholder swept away externally mid-transfer.
            return Err(FsError::NotFound {
                path: path.to_string(),
            });
        }
        loader.write_at(offset, buf).map_err(|e| FsError::io(path, e))
    }

    /// Hash the placeholder; on a match, promote it: atomic rename over the
    /// target, mtime stamped from the descriptor, watched maps updated, and
    /// loader removed. Returns `false` (loader intact) when more data is
    /// still needed.
    ///
    /// This is the only full-file hashing during a transfer, so callers
    /// invoke it only once the last expected chunk has been written.
    pub fn check_write_complete(&self, path: &str) -> Result<bool, FsError> {
        let mut state = self.lock();
        self.try_promote(&mut state, path)
    }

    /// Try to finish the transfer without any network traffic: if another
    /// watched file already carries the target hash, copy its content into
    /// the placeholder and promote. Consulted immediately after loader
    /// creation, before the first byte request.
    pub fn check_shortcut(&self, path: &str) -> Result<bool, FsError> {
        let mut state = self.lock();
        let descriptor = match state.loaders.get(path) {
            Some(l) => l.descriptor().clone(),
            None => {
                return Err(FsError::NotFound {
                    path: path.to_string(),
                })
            }
        };
        let candidates: Vec<String> = state
            .hash_index
            .get(&descriptor.md5)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for candidate in candidates {
            let content = match std::fs::read(self.abs(&candidate)) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %candidate, error = %e, "shortcut candidate unreadable");
                    continue;
                }
            };
            if hash_bytes(&content) != descriptor.md5 {
                // Disk drifted since the last scan; the scan will catch up.
                continue;
            }
            if let Some(loader) = state.loaders.get_mut(path) {
                loader
                    .write_at(0, &content)
                    .map_err(|e| FsError::io(path, e))?;
            }
            return self.try_promote(&mut state, path);
        }
        Ok(false)
    }

    /// Drop the loader and delete its placeholder. Idempotent: cancelling a
    /// path with no loader returns `false`.
    pub fn cancel_loader(&self, path: &str) -> bool {
        let mut state = self.lock();
        match state.loaders.remove(path) {
            Some(loader) => {
                if let Err(e) = loader.remove_part() {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path, error = %e, "failed to delete placeholder");
                    }
                }
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Direct mutations driven by peer requests
    // ------------------------------------------------------------------

    /// Delete a watched file at a peer's request. Rejected as stale when
    /// the local file is newer than the request's descriptor and its hash
    /// differs. Updates the watched maps in the same critical section so
    /// the next scan does not echo the deletion back.
    pub fn delete_file(&self, path: &str, descriptor: &FileDescriptor) -> Result<(), FsError> {
        self.ensure_safe(path)?;
        let mut state = self.lock();
        let watched = state
            .files
            .get(path)
            .ok_or_else(|| FsError::NotFound {
                path: path.to_string(),
            })?
            .clone();
        if watched.md5 != descriptor.md5 && watched.last_modified > descriptor.last_modified {
            return Err(FsError::StaleOrConflicting {
                path: path.to_string(),
            });
        }
        match std::fs::remove_file(self.abs(path)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::io(path, e)),
        }
        state.files.remove(path);
        detach_hash(&mut state, &watched.md5, path);
        if let Some(loader) = state.loaders.remove(path) {
            let _ = loader.remove_part();
        }
        Ok(())
    }

    /// Create a directory at a peer's request.
    pub fn create_directory(&self, path: &str) -> Result<(), FsError> {
        self.ensure_safe(path)?;
        let mut state = self.lock();
        if state.directories.contains(path) || self.abs(path).exists() {
            return Err(FsError::AlreadyExists {
                path: path.to_string(),
            });
        }
        std::fs::create_dir(self.abs(path)).map_err(|e| FsError::io(path, e))?;
        state.directories.insert(path.to_string());
        Ok(())
    }

    /// Delete a directory at a peer's request. Non-recursive: a non-empty
    /// directory is an error (a well-ordered event stream deletes children
    /// first).
    pub fn delete_directory(&self, path: &str) -> Result<(), FsError> {
        self.ensure_safe(path)?;
        let mut state = self.lock();
        if !state.directories.contains(path) {
            return Err(FsError::NotFound {
                path: path.to_string(),
            });
        }
        std::fs::remove_dir(self.abs(path)).map_err(|e| FsError::io(path, e))?;
        state.directories.remove(path);
        Ok(())
    }

    /// Serve a byte range from any watched file carrying `md5`. Responder
    /// side of a byte request; the caller clamps `length` to its block
    /// size before getting here.
    pub fn read_file(&self, md5: &str, position: u64, length: u64) -> Result<Vec<u8>, FsError> {
        let state = self.lock();
        let candidates: Vec<String> = state
            .hash_index
            .get(md5)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if candidates.is_empty() {
            return Err(FsError::NotFound {
                path: format!("(content {md5})"),
            });
        }

        let mut last_err: Option<FsError> = None;
        for candidate in candidates {
            let Some(fd) = state.files.get(&candidate) else {
                continue;
            };
            if position >= fd.file_size {
                return Err(FsError::OutOfRange {
                    path: candidate,
                    offset: position,
                    size: fd.file_size,
                });
            }
            match read_range(&self.abs(&candidate), position, length) {
                Ok(buf) if !buf.is_empty() => return Ok(buf),
                Ok(_) => {
                    last_err = Some(FsError::io(
                        candidate,
                        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "file shrank"),
                    ));
                }
                Err(e) => {
                    tracing::warn!(path = %candidate, error = %e, "failed to read for byte response");
                    last_err = Some(FsError::io(candidate, e));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FsError::NotFound {
            path: format!("(content {md5})"),
        }))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.inner.lock().unwrap()
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn rel_of(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    fn ensure_safe(&self, path: &str) -> Result<(), FsError> {
        if self.is_safe_path(path) {
            Ok(())
        } else {
            Err(FsError::UnsafePath {
                path: path.to_string(),
            })
        }
    }

    /// Depth-first walk collecting (directories, files with mtime+size).
    /// Placeholders are invisible; per-entry errors are logged and skipped
    /// so one unreadable entry never aborts a scan pass.
    fn walk(&self) -> (HashSet<String>, HashMap<String, (u64, u64)>) {
        let mut dirs = HashSet::new();
        let mut files = HashMap::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to read directory");
                    continue;
                }
            };
            for entry in entries {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "failed to read entry");
                        continue;
                    }
                };
                let path = entry.path();
                let Some(rel) = self.rel_of(&path) else {
                    continue;
                };
                let file_type = match entry.file_type() {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(path = %rel, error = %e, "failed to stat entry");
                        continue;
                    }
                };
                if file_type.is_dir() {
                    dirs.insert(rel);
                    pending.push(path);
                } else if file_type.is_file() {
                    if rel.ends_with(PART_SUFFIX) {
                        continue;
                    }
                    let meta = match entry.metadata() {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(path = %rel, error = %e, "failed to stat file");
                            continue;
                        }
                    };
                    let mtime = match meta.modified() {
                        Ok(t) => epoch_millis(t),
                        Err(e) => {
                            tracing::warn!(path = %rel, error = %e, "no mtime available");
                            continue;
                        }
                    };
                    files.insert(rel, (mtime, meta.len()));
                }
                // Symlinks and special files are not synchronized.
            }
        }
        (dirs, files)
    }

    /// Hash the placeholder and, on a match, rename it over the target and
    /// update the watched maps. Caller holds the lock.
    fn try_promote(&self, state: &mut TreeState, path: &str) -> Result<bool, FsError> {
        let loader = state
            .loaders
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound {
                path: path.to_string(),
            })?;
        let digest = loader.hash().map_err(|e| FsError::io(path, e))?;
        if digest != loader.descriptor().md5 {
            return Ok(false);
        }

        let descriptor = loader.descriptor().clone();
        let target = self.abs(path);
        std::fs::rename(loader.part_path(), &target).map_err(|e| FsError::io(path, e))?;
        state.loaders.remove(path);

        // Stamp the announced mtime so the next scan sees nothing new.
        let stamp = UNIX_EPOCH + Duration::from_millis(descriptor.last_modified);
        match File::options().write(true).open(&target) {
            Ok(f) => {
                if let Err(e) = f.set_modified(stamp) {
                    tracing::warn!(path, error = %e, "failed to set mtime on promoted file");
                }
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "failed to reopen promoted file for mtime");
            }
        }

        if let Some(old) = state.files.insert(path.to_string(), descriptor.clone()) {
            detach_hash(state, &old.md5, path);
        }
        state
            .hash_index
            .entry(descriptor.md5.clone())
            .or_default()
            .insert(path.to_string());

        tracing::debug!(path, md5 = %descriptor.md5, "loader promoted");
        Ok(true)
    }
}

fn detach_hash(state: &mut TreeState, md5: &str, path: &str) {
    if let Some(set) = state.hash_index.get_mut(md5) {
        set.remove(path);
        if set.is_empty() {
            state.hash_index.remove(md5);
        }
    }
}

fn depth_of(path: &str) -> usize {
    path.split('/').count()
}

fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn read_range(path: &Path, position: u64, length: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(position))?;
    let mut buf = Vec::with_capacity(length.min(1 << 20) as usize);
    file.take(length).read_to_end(&mut buf)?;
    Ok(buf)
}
