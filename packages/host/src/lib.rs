//! Host-filesystem mountdb driver.
//!
//! Maps a node tree onto a directory:
//! - directories are directory nodes
//! - a regular file `name.ext` is a leaf node named `name.ext` carrying
//!   exactly one stream, whose type comes from the factory registered for
//!   `ext` in the driver's [`FormatTable`]
//!
//! Files with unknown extensions are listed but cannot be opened; they fail
//! with `UnsupportedFormat`.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use mountdb_core::{
    Driver, Error, NodeInfo, NodeKind, NodeSpec, Path, PathError, Result, StreamInfo,
    StreamOptions, StreamType,
};

mod format;

pub use format::{
    BinaryFactory, FormatTable, JsonFactory, StreamFactory, TextFactory, XmlFactory,
};

/// Settings for a host-backed database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Directory the database root maps to. Must exist.
    pub root: PathBuf,
    /// Advisory capacity in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
}

impl HostConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            capacity: None,
        }
    }
}

/// What a namespace path points at on disk.
enum Entry {
    Directory(PathBuf),
    File(PathBuf, fs::Metadata),
}

pub struct HostDriver {
    root: PathBuf,
    formats: FormatTable,
    capacity: Option<u64>,
}

impl std::fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDriver")
            .field("root", &self.root)
            .field("formats", &self.formats)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Translate an I/O error on `path` into the node error taxonomy.
///
/// Only failures of the host itself become [`Error::Io`], which faults the
/// mount. A name the host filesystem refuses is the caller's problem.
fn io_error(path: &Path, error: io::Error) -> Error {
    match error.kind() {
        io::ErrorKind::NotFound => Error::NotFound { path: path.clone() },
        io::ErrorKind::PermissionDenied => Error::PermissionDenied { path: path.clone() },
        io::ErrorKind::AlreadyExists => Error::AlreadyExists {
            path: path.clone(),
            stream_type: None,
        },
        io::ErrorKind::NotADirectory => Error::NotADirectory { path: path.clone() },
        io::ErrorKind::InvalidFilename | io::ErrorKind::InvalidInput => {
            Error::InvalidPath(PathError::InvalidSegment {
                segment: path.name().unwrap_or_default().to_string(),
                depth: path.len().saturating_sub(1),
                reason: error.to_string(),
            })
        }
        _ => Error::Io(error),
    }
}

impl HostDriver {
    /// Open `config.root` with the default format table.
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::with_formats(config, FormatTable::new())
    }

    pub fn with_formats(config: HostConfig, formats: FormatTable) -> Result<Self> {
        let attr = fs::metadata(&config.root).map_err(|error| {
            Error::Io(io::Error::new(
                error.kind(),
                format!("host root {} is invalid: {}", config.root.display(), error),
            ))
        })?;
        if !attr.is_dir() {
            return Err(Error::Io(io::Error::other(format!(
                "host root {} must be a directory",
                config.root.display()
            ))));
        }
        let root = config.root.canonicalize()?;
        tracing::debug!(root = %root.display(), "opened host driver");
        Ok(Self {
            root,
            formats,
            capacity: config.capacity,
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    fn file_path(&self, path: &Path) -> PathBuf {
        self.root
            .components()
            .chain(path.iter().map(|s| Component::Normal(OsStr::new(s))))
            .collect()
    }

    /// Walk `path` segment by segment so a file in the middle of the path is
    /// reported as `NotADirectory` rather than a bare I/O error.
    fn locate(&self, path: &Path) -> Result<Entry> {
        let mut current = self.root.clone();
        for (depth, segment) in path.iter().enumerate() {
            current.push(segment);
            let attr = fs::metadata(&current).map_err(|e| io_error(&path.slice(0, depth + 1), e))?;
            let last = depth + 1 == path.len();
            if attr.is_file() {
                if last {
                    return Ok(Entry::File(current, attr));
                }
                return Err(Error::NotADirectory {
                    path: path.slice(0, depth + 1),
                });
            }
        }
        Ok(Entry::Directory(current))
    }

    fn locate_file(&self, path: &Path) -> Result<(PathBuf, fs::Metadata)> {
        match self.locate(path)? {
            Entry::File(file, attr) => Ok((file, attr)),
            Entry::Directory(_) => Err(Error::not_supported(format!(
                "streams on host directory {}",
                path
            ))),
        }
    }

    fn factory_for(&self, path: &Path) -> Result<&std::sync::Arc<dyn StreamFactory>> {
        let name = path
            .name()
            .ok_or_else(|| Error::not_supported("streams on the host root"))?;
        self.formats.for_name(name)
    }

    /// Check that the file at `path` carries `stream_type`.
    fn file_stream(
        &self,
        path: &Path,
        stream_type: &StreamType,
    ) -> Result<(PathBuf, &std::sync::Arc<dyn StreamFactory>)> {
        let (file, _) = self.locate_file(path)?;
        let factory = self.factory_for(path)?;
        if &factory.stream_type() != stream_type {
            return Err(Error::StreamNotFound {
                path: path.clone(),
                stream_type: stream_type.clone(),
            });
        }
        Ok((file, factory))
    }

    /// Ensure the parent directory of `path` exists, creating it when allowed.
    fn prepare_parent(&self, path: &Path, implicit: bool) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid_path("the root node cannot be created"))?;
        match self.locate(&parent) {
            Ok(Entry::Directory(_)) => Ok(()),
            Ok(Entry::File(..)) => Err(Error::NotADirectory { path: parent }),
            Err(Error::NotFound { path: missing }) => {
                if !implicit {
                    return Err(Error::MissingParent { path: missing });
                }
                let dir = self.file_path(&parent);
                fs::create_dir_all(&dir).map_err(|e| io_error(&parent, e))
            }
            Err(e) => Err(e),
        }
    }

    fn used_bytes(&self) -> u64 {
        walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|attr| attr.is_file())
            .map(|attr| attr.len())
            .sum()
    }
}

impl Driver for HostDriver {
    fn kind(&self) -> &'static str {
        "host"
    }

    fn stat(&self, path: &Path) -> Result<NodeInfo> {
        match self.locate(path)? {
            Entry::Directory(dir) => Ok(NodeInfo {
                path: path.clone(),
                kind: NodeKind::Directory,
                children: fs::read_dir(&dir).map_err(|e| io_error(path, e))?.count(),
                streams: Vec::new(),
            }),
            Entry::File(_, attr) => {
                let factory = self.factory_for(path)?;
                Ok(NodeInfo {
                    path: path.clone(),
                    kind: NodeKind::Leaf,
                    children: 0,
                    streams: vec![StreamInfo {
                        stream_type: factory.stream_type(),
                        options: StreamOptions::default(),
                        len: attr.len(),
                    }],
                })
            }
        }
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let dir = match self.locate(path)? {
            Entry::Directory(dir) => dir,
            Entry::File(..) => return Err(Error::NotADirectory { path: path.clone() }),
        };
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_error(path, e))? {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) if Path::validate_name(&name).is_ok() => names.push(name),
                other => tracing::debug!(?other, dir = %dir.display(), "skipping unaddressable entry"),
            }
        }
        names.sort();
        Ok(names)
    }

    /// A spec carrying a stream creates a file; one without creates a
    /// directory, or an empty file for leaves.
    fn create(&mut self, path: &Path, spec: &NodeSpec) -> Result<()> {
        match self.locate(path) {
            Ok(_) => {
                return Err(Error::AlreadyExists {
                    path: path.clone(),
                    stream_type: None,
                })
            }
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        // Reject unsupported formats before touching the disk.
        let is_file = spec.stream.is_some() || spec.kind == NodeKind::Leaf;
        if is_file {
            let factory = self.factory_for(path)?;
            if let Some((stream_type, _)) = &spec.stream {
                if &factory.stream_type() != stream_type {
                    return Err(Error::UnsupportedFormat {
                        format: stream_type.to_string(),
                        message: format!(
                            "{} files carry {} streams",
                            path.name().unwrap_or_default(),
                            factory.stream_type()
                        ),
                    });
                }
            }
        }
        self.prepare_parent(path, spec.implicit_parents)?;

        let target = self.file_path(path);
        tracing::debug!(file = %target.display(), is_file, "host create");
        if is_file {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .map(|_| ())
                .map_err(|e| io_error(path, e))
        } else {
            fs::create_dir(&target).map_err(|e| io_error(path, e))
        }
    }

    fn delete(&mut self, path: &Path) -> Result<()> {
        if path.is_root() {
            return Err(Error::invalid_path("the root node cannot be deleted"));
        }
        match self.locate(path)? {
            Entry::Directory(dir) => fs::remove_dir_all(&dir),
            Entry::File(file, _) => fs::remove_file(&file),
        }
        .map_err(|e| io_error(path, e))
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        if from.is_root() || to.is_root() {
            return Err(Error::invalid_path("the root node cannot be moved"));
        }
        if to.has_prefix(from) {
            return Err(Error::invalid_path(format!(
                "cannot move {} into its own subtree {}",
                from, to
            )));
        }
        let source = self.locate(from)?;
        if let Entry::File(..) = source {
            let before = self.factory_for(from)?.stream_type();
            let after = self.factory_for(to)?.stream_type();
            if before != after {
                return Err(Error::UnsupportedFormat {
                    format: after.to_string(),
                    message: format!("renaming {} to {} would change its stream type", from, to),
                });
            }
        }
        match self.locate(to) {
            Ok(_) => {
                return Err(Error::AlreadyExists {
                    path: to.clone(),
                    stream_type: None,
                })
            }
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.prepare_parent(to, false)?;

        let src = match source {
            Entry::Directory(dir) => dir,
            Entry::File(file, _) => file,
        };
        fs::rename(&src, self.file_path(to)).map_err(|e| io_error(from, e))
    }

    fn add_stream(
        &mut self,
        path: &Path,
        stream_type: &StreamType,
        _options: StreamOptions,
    ) -> Result<()> {
        self.locate_file(path)?;
        if &self.factory_for(path)?.stream_type() == stream_type {
            return Err(Error::AlreadyExists {
                path: path.clone(),
                stream_type: Some(stream_type.clone()),
            });
        }
        Err(Error::not_supported(format!(
            "a second stream on host file {}",
            path
        )))
    }

    fn remove_stream(&mut self, path: &Path, stream_type: &StreamType) -> Result<bool> {
        match self.file_stream(path, stream_type) {
            Ok(_) => Err(Error::not_supported(format!(
                "removing the only stream of host file {}; delete the node instead",
                path
            ))),
            Err(Error::StreamNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_stream(&self, path: &Path, stream_type: &StreamType) -> Result<Bytes> {
        let (file, factory) = self.file_stream(path, stream_type)?;
        tracing::debug!(file = %file.display(), "host read");
        let raw = fs::read(&file).map_err(|e| io_error(path, e))?;
        factory.decode(raw)
    }

    fn write_stream(&mut self, path: &Path, stream_type: &StreamType, data: Bytes) -> Result<()> {
        let (file, factory) = self.file_stream(path, stream_type)?;
        let encoded = factory.encode(&data)?;
        tracing::debug!(file = %file.display(), len = encoded.len(), "host write");
        fs::write(&file, encoded).map_err(|e| io_error(path, e))
    }

    fn free_space(&self) -> Option<u64> {
        self.capacity
            .map(|capacity| capacity.saturating_sub(self.used_bytes()))
    }

    fn device_storage(&self) -> Option<u64> {
        self.capacity
    }
}
