//! Error types shared by every mountdb layer.

use serde::{Deserialize, Serialize};

use crate::path::{Path, PathError};
use crate::stream_type::StreamType;

/// Result type alias for mountdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by nodes, drivers, databases and the mount table.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Path syntax error, or a path that is invalid for the operation.
    #[error("{0}")]
    InvalidPath(#[from] PathError),

    #[error("not found: {path}")]
    NotFound { path: Path },

    /// An intermediate segment names a node that cannot have children.
    #[error("not a directory: {path}")]
    NotADirectory { path: Path },

    /// Strict creation found no parent node.
    #[error("missing parent: {path}")]
    MissingParent { path: Path },

    #[error("already exists: {path}{}", stream_suffix(.stream_type))]
    AlreadyExists {
        path: Path,
        stream_type: Option<StreamType>,
    },

    #[error("no stream of type {stream_type} at {path}")]
    StreamNotFound { path: Path, stream_type: StreamType },

    #[error("ambiguous stream type {requested} at {path}: candidates {candidates:?}")]
    AmbiguousStreamType {
        path: Path,
        requested: StreamType,
        candidates: Vec<StreamType>,
    },

    #[error("no mount point covers {path}")]
    NoMountPoint { path: Path },

    #[error("already mounted: {path}")]
    AlreadyMounted { path: Path },

    #[error("mount in use: {path} has {} nested mount(s)", .nested.len())]
    MountInUse { path: Path, nested: Vec<Path> },

    /// A stream or subtree is locked by an open handle.
    #[error("resource busy: {path}: {reason}")]
    ResourceBusy { path: Path, reason: String },

    /// The handle was invalidated underneath its holder.
    #[error("stream closed")]
    StreamClosed,

    #[error("database closed: {name}")]
    DatabaseClosed { name: String },

    #[error("unsupported format {format}: {message}")]
    UnsupportedFormat { format: String, message: String },

    #[error("corrupt snapshot: {message}")]
    CorruptSnapshot { message: String },

    #[error("operation not supported: {operation}")]
    NotSupported { operation: String },

    #[error("permission denied: {path}")]
    PermissionDenied { path: Path },

    #[error("timed out: {operation}")]
    Timeout { operation: String },

    #[error("disconnected from {endpoint}")]
    Disconnected { endpoint: String },

    #[error("endpoint in use: {endpoint}")]
    EndpointInUse { endpoint: String },

    #[error("cancelled")]
    Cancelled,

    /// The mount was marked faulted after a fatal driver error.
    #[error("mount {mount} is faulted: {message}")]
    Faulted { mount: Path, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {message}")]
    Internal { message: String },
}

fn stream_suffix(stream_type: &Option<StreamType>) -> String {
    stream_type
        .as_ref()
        .map(|t| format!(" [{}]", t))
        .unwrap_or_default()
}

/// Stable, serializable classification of an [`Error`].
///
/// Used by the remote protocol to carry errors across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPath,
    NotFound,
    NotADirectory,
    MissingParent,
    AlreadyExists,
    StreamNotFound,
    AmbiguousStreamType,
    NoMountPoint,
    AlreadyMounted,
    MountInUse,
    ResourceBusy,
    StreamClosed,
    DatabaseClosed,
    UnsupportedFormat,
    CorruptSnapshot,
    NotSupported,
    PermissionDenied,
    Timeout,
    Disconnected,
    EndpointInUse,
    Cancelled,
    Faulted,
    Io,
    Internal,
}

impl Error {
    pub fn invalid_path(message: impl Into<String>) -> Self {
        Error::InvalidPath(PathError::InvalidPath {
            message: message.into(),
        })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    pub fn not_supported(operation: impl Into<String>) -> Self {
        Error::NotSupported {
            operation: operation.into(),
        }
    }

    pub fn busy(path: &Path, reason: impl Into<String>) -> Self {
        Error::ResourceBusy {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    /// Errors a caller may recover from by retrying an idempotent operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Disconnected { .. } | Error::Timeout { .. } | Error::Cancelled
        )
    }

    /// Driver-internal faults that poison the database that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptSnapshot { .. } | Error::Io(_) | Error::Internal { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidPath(_) => ErrorKind::InvalidPath,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::NotADirectory { .. } => ErrorKind::NotADirectory,
            Error::MissingParent { .. } => ErrorKind::MissingParent,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::StreamNotFound { .. } => ErrorKind::StreamNotFound,
            Error::AmbiguousStreamType { .. } => ErrorKind::AmbiguousStreamType,
            Error::NoMountPoint { .. } => ErrorKind::NoMountPoint,
            Error::AlreadyMounted { .. } => ErrorKind::AlreadyMounted,
            Error::MountInUse { .. } => ErrorKind::MountInUse,
            Error::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            Error::StreamClosed => ErrorKind::StreamClosed,
            Error::DatabaseClosed { .. } => ErrorKind::DatabaseClosed,
            Error::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Error::CorruptSnapshot { .. } => ErrorKind::CorruptSnapshot,
            Error::NotSupported { .. } => ErrorKind::NotSupported,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Disconnected { .. } => ErrorKind::Disconnected,
            Error::EndpointInUse { .. } => ErrorKind::EndpointInUse,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Faulted { .. } => ErrorKind::Faulted,
            Error::Io(_) => ErrorKind::Io,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// The path the error refers to, when it names one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Error::NotFound { path }
            | Error::NotADirectory { path }
            | Error::MissingParent { path }
            | Error::AlreadyExists { path, .. }
            | Error::StreamNotFound { path, .. }
            | Error::AmbiguousStreamType { path, .. }
            | Error::NoMountPoint { path }
            | Error::AlreadyMounted { path }
            | Error::MountInUse { path, .. }
            | Error::ResourceBusy { path, .. }
            | Error::PermissionDenied { path } => Some(path),
            Error::Faulted { mount, .. } => Some(mount),
            _ => None,
        }
    }
}

impl Error {
    /// Re-anchor a path carried by the error under `prefix`.
    ///
    /// Databases report paths relative to their own root; the mount table
    /// uses this to report them in namespace terms.
    pub fn with_prefix(self, prefix: &Path) -> Self {
        if prefix.is_root() {
            return self;
        }
        match self {
            Error::NotFound { path } => Error::NotFound {
                path: prefix.join(&path),
            },
            Error::NotADirectory { path } => Error::NotADirectory {
                path: prefix.join(&path),
            },
            Error::MissingParent { path } => Error::MissingParent {
                path: prefix.join(&path),
            },
            Error::AlreadyExists { path, stream_type } => Error::AlreadyExists {
                path: prefix.join(&path),
                stream_type,
            },
            Error::StreamNotFound { path, stream_type } => Error::StreamNotFound {
                path: prefix.join(&path),
                stream_type,
            },
            Error::AmbiguousStreamType {
                path,
                requested,
                candidates,
            } => Error::AmbiguousStreamType {
                path: prefix.join(&path),
                requested,
                candidates,
            },
            Error::ResourceBusy { path, reason } => Error::ResourceBusy {
                path: prefix.join(&path),
                reason,
            },
            Error::PermissionDenied { path } => Error::PermissionDenied {
                path: prefix.join(&path),
            },
            Error::Faulted { mount, message } => Error::Faulted {
                mount: prefix.join(&mount),
                message,
            },
            other => other,
        }
    }
}

/// Map a poisoned lock into a fatal internal error.
pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::internal("lock poisoned")
}
