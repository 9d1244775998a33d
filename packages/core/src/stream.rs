//! Handles on open typed streams.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::database::DatabaseInner;
use crate::error::{Error, Result};
use crate::lock::{Lease, LeaseMode};
use crate::path::Path;
use crate::stream_type::StreamType;

/// How a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    /// Shared access to a snapshot of the contents taken at open.
    Read,
    /// Exclusive access; staging starts empty and replaces the contents on
    /// commit.
    Write,
    /// Exclusive access; staging starts from the current contents.
    Append,
}

impl OpenMode {
    pub(crate) fn lease_mode(self) -> LeaseMode {
        match self {
            OpenMode::Read => LeaseMode::Shared,
            OpenMode::Write | OpenMode::Append => LeaseMode::Exclusive,
        }
    }
}

enum HandleState {
    Reading {
        data: Bytes,
        position: usize,
    },
    Writing {
        /// Last committed contents, restored by `rollback`.
        base: Bytes,
        staged: Vec<u8>,
        /// Writes made since the last commit.
        dirty: bool,
        /// A write-mode open whose truncation is not yet published.
        truncate: bool,
    },
}

/// An open stream on one (node, type) pair.
///
/// Writer handles are scoped transactions: writes are staged in the handle,
/// [`commit`](Self::commit) publishes them, [`close`](Self::close) commits and
/// releases, and dropping the handle without committing discards the staged
/// bytes. The stream lock is released on every path out, including panics.
///
/// Every operation fails with [`Error::StreamClosed`] once the handle has been
/// invalidated by a forced delete or by closing its database.
pub struct StreamHandle {
    db: Arc<DatabaseInner>,
    lease: Lease,
    mode: OpenMode,
    state: HandleState,
}

impl StreamHandle {
    pub(crate) fn new(db: Arc<DatabaseInner>, lease: Lease, mode: OpenMode, initial: Bytes) -> Self {
        let state = match mode {
            OpenMode::Read => HandleState::Reading {
                data: initial,
                position: 0,
            },
            OpenMode::Write => HandleState::Writing {
                base: initial,
                staged: Vec::new(),
                dirty: false,
                truncate: true,
            },
            OpenMode::Append => HandleState::Writing {
                staged: initial.to_vec(),
                base: initial,
                dirty: false,
                truncate: false,
            },
        };
        Self {
            db,
            lease,
            mode,
            state,
        }
    }

    pub fn path(&self) -> &Path {
        &self.lease.key().path
    }

    /// The registered type this handle resolved to.
    pub fn stream_type(&self) -> &StreamType {
        &self.lease.key().stream_type
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// False once the handle has been invalidated.
    pub fn is_open(&self) -> bool {
        self.lease.is_live()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.lease.is_live() {
            Ok(())
        } else {
            Err(Error::StreamClosed)
        }
    }

    /// Length of the snapshot (readers) or of the staged bytes (writers).
    pub fn len(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(match &self.state {
            HandleState::Reading { data, .. } => data.len() as u64,
            HandleState::Writing { staged, .. } => staged.len() as u64,
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The full snapshot (readers) or the staged bytes (writers).
    pub fn contents(&self) -> Result<Bytes> {
        self.ensure_open()?;
        Ok(match &self.state {
            HandleState::Reading { data, .. } => data.clone(),
            HandleState::Writing { staged, .. } => Bytes::copy_from_slice(staged),
        })
    }

    /// Read everything from the current position to the end.
    pub fn read_to_end(&mut self) -> Result<Bytes> {
        self.ensure_open()?;
        match &mut self.state {
            HandleState::Reading { data, position } => {
                let rest = data.slice(*position..);
                *position = data.len();
                Ok(rest)
            }
            HandleState::Writing { .. } => Err(Error::not_supported("read on a write handle")),
        }
    }

    /// Append bytes to the staged contents.
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        match &mut self.state {
            HandleState::Writing { staged, dirty, .. } => {
                staged.extend_from_slice(buf);
                *dirty = true;
                Ok(())
            }
            HandleState::Reading { .. } => Err(Error::not_supported("write on a read handle")),
        }
    }

    /// Replace the staged contents.
    pub fn set_contents(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.ensure_open()?;
        match &mut self.state {
            HandleState::Writing { staged, dirty, .. } => {
                *staged = data.into();
                *dirty = true;
                Ok(())
            }
            HandleState::Reading { .. } => Err(Error::not_supported("write on a read handle")),
        }
    }

    /// Whether bytes written through this handle are still unpublished.
    pub fn has_uncommitted_writes(&self) -> bool {
        matches!(self.state, HandleState::Writing { dirty: true, .. })
    }

    /// Publish the staged bytes. The handle stays open and keeps its lock.
    ///
    /// A write-mode handle publishes its (possibly empty) staging at least
    /// once, so opening for writing and committing truncates the stream.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let HandleState::Writing {
            base,
            staged,
            dirty,
            truncate,
        } = &mut self.state
        else {
            return Ok(());
        };
        if !*dirty && !*truncate {
            return Ok(());
        }
        let data = Bytes::copy_from_slice(staged);
        self.db.commit(&self.lease, data.clone())?;
        *base = data;
        *dirty = false;
        *truncate = false;
        Ok(())
    }

    /// Discard staged bytes, returning to the last committed contents.
    pub fn rollback(&mut self) {
        if let HandleState::Writing {
            base,
            staged,
            dirty,
            truncate,
        } = &mut self.state
        {
            *staged = base.to_vec();
            *dirty = false;
            *truncate = false;
        }
    }

    /// Commit (writers) and release the handle.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("path", self.path())
            .field("stream_type", self.stream_type())
            .field("mode", &self.mode)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.has_uncommitted_writes() {
            tracing::debug!(
                path = %self.path(),
                stream_type = %self.stream_type(),
                "discarding uncommitted stream writes"
            );
        }
    }
}

fn to_io(e: Error) -> io::Error {
    match e {
        Error::Io(inner) => inner,
        other => io::Error::other(other),
    }
}

impl io::Read for StreamHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open().map_err(to_io)?;
        match &mut self.state {
            HandleState::Reading { data, position } => {
                let rest = &data[*position..];
                let n = rest.len().min(buf.len());
                buf[..n].copy_from_slice(&rest[..n]);
                *position += n;
                Ok(n)
            }
            HandleState::Writing { .. } => Err(to_io(Error::not_supported("read on a write handle"))),
        }
    }
}

impl io::Write for StreamHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(to_io)?;
        Ok(buf.len())
    }

    /// Flushing a stream handle commits it.
    fn flush(&mut self) -> io::Result<()> {
        self.commit().map_err(to_io)
    }
}
