//! In-memory mountdb driver.
//!
//! Nodes and streams are plain in-process data. Persistence is explicit: a
//! snapshot is a full-tree dump (see [`snapshot`]) that can be written to a
//! single file and loaded back.
//!
//! # Example
//!
//! ```rust
//! use mountdb_core::{path, CreateOptions, Database, StreamType};
//! use mountdb_memory::MemoryDriver;
//!
//! let db = Database::with_driver(MemoryDriver::new());
//! db.create(&path!("/etc/app"), &StreamType::config(), CreateOptions::default())?;
//! db.write_bytes(&path!("/etc/app"), &StreamType::config(), b"x=1")?;
//!
//! let restored = MemoryDriver::load(&db.snapshot()?)?;
//! assert!(restored.tree().root().children().contains_key("etc"));
//! # Ok::<(), mountdb_core::Error>(())
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path as FsPath, PathBuf};

use bytes::Bytes;
use mountdb_core::{
    Driver, Error, NodeInfo, NodeSpec, NodeTree, Path, Result, StreamOptions, StreamType,
};

pub mod snapshot;

/// A driver holding the whole tree in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    tree: NodeTree,
    capacity: Option<u64>,
    /// Written on flush, when set.
    persist_to: Option<PathBuf>,
}

impl MemoryDriver {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tree(tree: NodeTree) -> Self {
        Self {
            tree,
            ..Self::default()
        }
    }

    /// Set the advisory capacity reported as device storage.
    #[must_use]
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Persist to `file` whenever the owning database is flushed or closed.
    #[must_use]
    pub fn persist_on_flush(mut self, file: impl Into<PathBuf>) -> Self {
        self.persist_to = Some(file.into());
        self
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// Restore a tree from snapshot bytes.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_tree(snapshot::decode(bytes)?))
    }

    /// Restore a tree from a snapshot file.
    pub fn load_file(file: impl AsRef<FsPath>) -> Result<Self> {
        let file = file.as_ref();
        let bytes = fs::read(file)?;
        let driver = Self::load(&bytes)?;
        tracing::debug!(file = %file.display(), len = bytes.len(), "loaded snapshot");
        Ok(driver)
    }

    /// Restore from `file` if it exists, else start empty. Either way the
    /// tree is persisted back to `file` on flush.
    pub fn open_file(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let driver = if file.exists() {
            Self::load_file(&file)?
        } else {
            Self::new()
        };
        Ok(driver.persist_on_flush(file))
    }

    /// Write a snapshot to `file` through a temporary sibling and a rename,
    /// so a crash never leaves a truncated snapshot behind.
    pub fn persist(&self, file: impl AsRef<FsPath>) -> Result<()> {
        let file = file.as_ref();
        let bytes = snapshot::encode(&self.tree)?;

        let mut tmp_name = file
            .file_name()
            .ok_or_else(|| Error::internal(format!("not a file path: {}", file.display())))?
            .to_os_string();
        tmp_name.push(".tmp");
        let tmp = file.with_file_name(tmp_name);

        let mut out = fs::File::create(&tmp)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
        fs::rename(&tmp, file)?;

        tracing::debug!(file = %file.display(), len = bytes.len(), "persisted snapshot");
        Ok(())
    }
}

impl Driver for MemoryDriver {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn stat(&self, path: &Path) -> Result<NodeInfo> {
        self.tree.stat(path)
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        self.tree.list(path)
    }

    fn create(&mut self, path: &Path, spec: &NodeSpec) -> Result<()> {
        self.tree.create(path, spec)
    }

    fn delete(&mut self, path: &Path) -> Result<()> {
        self.tree.delete(path)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.tree.rename(from, to)
    }

    fn add_stream(
        &mut self,
        path: &Path,
        stream_type: &StreamType,
        options: StreamOptions,
    ) -> Result<()> {
        self.tree.add_stream(path, stream_type, options)
    }

    fn remove_stream(&mut self, path: &Path, stream_type: &StreamType) -> Result<bool> {
        self.tree.remove_stream(path, stream_type)
    }

    fn read_stream(&self, path: &Path, stream_type: &StreamType) -> Result<Bytes> {
        self.tree.read_stream(path, stream_type)
    }

    fn write_stream(&mut self, path: &Path, stream_type: &StreamType, data: Bytes) -> Result<()> {
        self.tree.write_stream(path, stream_type, data)
    }

    fn free_space(&self) -> Option<u64> {
        self.capacity
            .map(|capacity| capacity.saturating_sub(self.tree.root().used_bytes()))
    }

    fn device_storage(&self) -> Option<u64> {
        self.capacity
    }

    fn snapshot(&self) -> Result<Bytes> {
        snapshot::encode(&self.tree)
    }

    fn flush(&mut self) -> Result<()> {
        match &self.persist_to {
            Some(file) => self.persist(file),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mountdb_core::{path, CreateOptions, Database};
    use tempfile::TempDir;

    fn populated() -> Database {
        let db = Database::with_driver(MemoryDriver::new().with_capacity(1024));
        db.create(&path!("/a/b/c"), &StreamType::config(), CreateOptions::default())
            .unwrap();
        db.write_bytes(&path!("/a/b/c"), &StreamType::config(), b"x=1")
            .unwrap();
        db.create(&path!("/doc"), &StreamType::xml(), CreateOptions::default().leaf())
            .unwrap();
        db.add_stream(&path!("/doc"), &StreamType::binary(), StreamOptions::derived())
            .unwrap();
        db.write_bytes(&path!("/doc"), &StreamType::binary(), &[1, 2, 3, 4])
            .unwrap();
        db
    }

    #[test]
    fn advisory_space() {
        let db = populated();
        assert_eq!(db.device_storage().unwrap(), Some(1024));
        assert_eq!(db.free_space().unwrap(), Some(1024 - 7));

        let unbounded = Database::with_driver(MemoryDriver::new());
        assert_eq!(unbounded.free_space().unwrap(), None);
    }

    #[test]
    fn persist_and_load_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("root.snap");

        let db = populated();
        let restored = MemoryDriver::load(&db.snapshot().unwrap()).unwrap();
        restored.persist(&file).unwrap();
        assert!(!dir.path().join("root.snap.tmp").exists());

        let loaded = Database::with_driver(MemoryDriver::load_file(&file).unwrap());
        assert_eq!(
            loaded.read_bytes(&path!("/a/b/c"), &StreamType::config())
                .unwrap(),
            Bytes::from_static(b"x=1")
        );
        let doc = loaded.stat(&path!("/doc")).unwrap();
        assert_eq!(doc.streams.len(), 2);
    }

    #[test]
    fn close_persists_when_configured() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("state.snap");

        let db = Database::with_driver(MemoryDriver::open_file(&file).unwrap());
        db.create(&path!("/kept"), &StreamType::text(), CreateOptions::default())
            .unwrap();
        db.close().unwrap();

        let reopened = Database::with_driver(MemoryDriver::open_file(&file).unwrap());
        assert!(reopened.exists(&path!("/kept")).unwrap());
    }

    #[test]
    fn corrupt_file_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bad.snap");
        fs::write(&file, b"MDBSNAP\0\x01\x00{\"kind\":").unwrap();
        assert!(matches!(
            MemoryDriver::load_file(&file),
            Err(Error::CorruptSnapshot { .. })
        ));
        assert!(matches!(
            MemoryDriver::load_file(dir.path().join("missing.snap")),
            Err(Error::Io(_))
        ));
    }
}
