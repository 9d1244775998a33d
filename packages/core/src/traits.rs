//! The driver contract.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::{NodeInfo, NodeSpec, StreamOptions};
use crate::path::Path;
use crate::stream_type::StreamType;

/// A backend that materializes the nodes of one database.
///
/// Every path is relative to the driver's own root. Drivers only implement
/// the raw tree operations; mutual exclusion, stream locking and type
/// resolution are layered on top by [`Database`](crate::Database), so a
/// driver behaves the same whether it is reached directly, through a mount,
/// or through a remote proxy.
///
/// Methods taking `&mut self` mutate the tree and are serialized by the
/// owning database; methods taking `&self` may run concurrently.
///
/// # Object Safety
///
/// This trait is object-safe: databases hold a `Box<dyn Driver>`.
pub trait Driver: Send + Sync {
    /// Short name of the backend, for diagnostics.
    fn kind(&self) -> &'static str;

    /// Resolve a path to a description of its node.
    fn stat(&self, path: &Path) -> Result<NodeInfo>;

    /// Names of the children of a node, sorted.
    fn list(&self, path: &Path) -> Result<Vec<String>>;

    /// Create a node, and optionally its first stream.
    fn create(&mut self, path: &Path, spec: &NodeSpec) -> Result<()>;

    /// Create a child of `parent` under a freshly generated name and return
    /// its path. Every call mints a new node.
    fn create_unique(&mut self, parent: &Path, prefix: &str, spec: &NodeSpec) -> Result<Path> {
        let path = parent.child(&format!("{}-{}", prefix, Uuid::new_v4().simple()))?;
        self.create(&path, spec)?;
        Ok(path)
    }

    /// Delete a node and its whole subtree.
    fn delete(&mut self, path: &Path) -> Result<()>;

    /// Re-parent a node under a new name.
    fn rename(&mut self, from: &Path, to: &Path) -> Result<()>;

    fn add_stream(&mut self, path: &Path, stream_type: &StreamType, options: StreamOptions)
        -> Result<()>;

    /// Remove the stream with exactly this type. Returns whether it existed.
    fn remove_stream(&mut self, path: &Path, stream_type: &StreamType) -> Result<bool>;

    fn read_stream(&self, path: &Path, stream_type: &StreamType) -> Result<Bytes>;

    /// Replace the whole contents of a stream.
    fn write_stream(&mut self, path: &Path, stream_type: &StreamType, data: Bytes) -> Result<()>;

    /// Advisory free space in bytes.
    fn free_space(&self) -> Option<u64> {
        None
    }

    /// Advisory total capacity in bytes.
    fn device_storage(&self) -> Option<u64> {
        None
    }

    /// Serialize the whole tree, for drivers that can.
    fn snapshot(&self) -> Result<Bytes> {
        Err(Error::not_supported(format!("snapshot of {} driver", self.kind())))
    }

    /// Persist any pending state. Called when the database closes.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: Driver + ?Sized> Driver for Box<T> {
    fn kind(&self) -> &'static str {
        self.as_ref().kind()
    }

    fn stat(&self, path: &Path) -> Result<NodeInfo> {
        self.as_ref().stat(path)
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        self.as_ref().list(path)
    }

    fn create(&mut self, path: &Path, spec: &NodeSpec) -> Result<()> {
        self.as_mut().create(path, spec)
    }

    fn create_unique(&mut self, parent: &Path, prefix: &str, spec: &NodeSpec) -> Result<Path> {
        self.as_mut().create_unique(parent, prefix, spec)
    }

    fn delete(&mut self, path: &Path) -> Result<()> {
        self.as_mut().delete(path)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.as_mut().rename(from, to)
    }

    fn add_stream(
        &mut self,
        path: &Path,
        stream_type: &StreamType,
        options: StreamOptions,
    ) -> Result<()> {
        self.as_mut().add_stream(path, stream_type, options)
    }

    fn remove_stream(&mut self, path: &Path, stream_type: &StreamType) -> Result<bool> {
        self.as_mut().remove_stream(path, stream_type)
    }

    fn read_stream(&self, path: &Path, stream_type: &StreamType) -> Result<Bytes> {
        self.as_ref().read_stream(path, stream_type)
    }

    fn write_stream(&mut self, path: &Path, stream_type: &StreamType, data: Bytes) -> Result<()> {
        self.as_mut().write_stream(path, stream_type, data)
    }

    fn free_space(&self) -> Option<u64> {
        self.as_ref().free_space()
    }

    fn device_storage(&self) -> Option<u64> {
        self.as_ref().device_storage()
    }

    fn snapshot(&self) -> Result<Bytes> {
        self.as_ref().snapshot()
    }

    fn flush(&mut self) -> Result<()> {
        self.as_mut().flush()
    }
}
