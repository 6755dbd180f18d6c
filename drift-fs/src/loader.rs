//! Placeholder files for in-progress incoming transfers.
//!
//! A loader accumulates bytes for one incoming file in a sibling
//! placeholder (`<name>.driftpart`) that the reconciliation scan ignores.
//! The loader holds the placeholder's handle open for its whole lifetime;
//! promotion and cancellation are driven by [`crate::SyncTree`], which owns
//! all loaders under its lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use drift_wire::FileDescriptor;

use crate::hash::hash_reader;

/// Suffix appended to a target path to form its placeholder path.
/// Files with this suffix are invisible to the scan and may not be
/// addressed by peers.
pub const PART_SUFFIX: &str = ".driftpart";

/// One in-progress incoming file.
#[derive(Debug)]
pub(crate) struct Loader {
    descriptor: FileDescriptor,
    part_path: PathBuf,
    file: File,
}

impl Loader {
    /// Create (truncating) the placeholder next to `target` and open an
    /// exclusive read/write handle on it.
    pub(crate) fn create(target: &Path, descriptor: FileDescriptor) -> io::Result<Self> {
        let part_path = part_path_for(target);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part_path)?;
        Ok(Self {
            descriptor,
            part_path,
            file,
        })
    }

    pub(crate) fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub(crate) fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Whether the placeholder still exists on disk (it can be swept away
    /// externally mid-transfer).
    pub(crate) fn part_exists(&self) -> bool {
        self.part_path.exists()
    }

    /// Write `buf` at `offset` in the placeholder.
    pub(crate) fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.flush()
    }

    /// Hash the placeholder's current content.
    pub(crate) fn hash(&mut self) -> io::Result<String> {
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        hash_reader(&mut self.file)
    }

    /// Delete the placeholder. The open handle stays valid until drop.
    pub(crate) fn remove_part(&self) -> io::Result<()> {
        std::fs::remove_file(&self.part_path)
    }
}

/// `a/b.txt` -> `a/b.txt.driftpart`
pub(crate) fn part_path_for(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_os_string();
    s.push(PART_SUFFIX);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn descriptor_of(bytes: &[u8]) -> FileDescriptor {
        FileDescriptor::new(crate::hash_bytes(bytes), 1_000, bytes.len() as u64)
    }

    #[test]
    fn part_path_appends_suffix() {
        let p = part_path_for(Path::new("/tmp/share/a/b.txt"));
        assert_eq!(p, Path::new("/tmp/share/a/b.txt.driftpart"));
    }

    #[test]
    fn out_of_order_writes_then_hash() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.bin");
        let content = b"0123456789";
        let mut loader = Loader::create(&target, descriptor_of(content)).unwrap();

        // Tail first, then head.
        loader.write_at(5, &content[5..]).unwrap();
        loader.write_at(0, &content[..5]).unwrap();

        assert_eq!(loader.hash().unwrap(), crate::hash_bytes(content));
        assert!(loader.part_exists());
        assert!(!target.exists());
    }

    #[test]
    fn create_truncates_stale_placeholder() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.bin");
        std::fs::write(part_path_for(&target), b"stale junk").unwrap();

        let mut loader = Loader::create(&target, descriptor_of(b"")).unwrap();
        assert_eq!(loader.hash().unwrap(), crate::hash_bytes(b""));
    }

    #[test]
    fn remove_part_deletes_placeholder() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.bin");
        let loader = Loader::create(&target, descriptor_of(b"x")).unwrap();
        assert!(loader.part_exists());
        loader.remove_part().unwrap();
        assert!(!loader.part_exists());
    }
}
