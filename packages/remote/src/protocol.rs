//! Wire messages.
//!
//! A request is `(id, path, op)` where `op` carries an operation code and its
//! payload; a response is `(id, status, body | error)`. Both are JSON; stream
//! bytes travel base64-encoded.
//!
//! ```json
//! {"id": 7, "path": "/etc/app", "op": {"code": "read_stream", "payload": {"stream_type": "Config"}}}
//! {"id": 7, "status": "ok", "body": {"type": "bytes", "data": "eD0x"}}
//! {"id": 8, "status": "not_found", "error": {"kind": "not_found", "message": "not found: /x", "path": "/x"}}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use mountdb_core::{Error, ErrorKind, NodeInfo, NodeKind, Path, StreamOptions, StreamType};

/// One remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// Absolute path inside the served database.
    pub path: Path,
    pub op: Op,
}

/// Operation code and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", content = "payload", rename_all = "snake_case")]
pub enum Op {
    /// Handshake; succeeds if `path` exists.
    Ping,
    Stat,
    List,
    Create {
        kind: NodeKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_type: Option<StreamType>,
        #[serde(default)]
        options: StreamOptions,
        implicit_parents: bool,
    },
    /// Create a child of `path` under a name chosen by the server.
    CreateUnique {
        prefix: String,
        kind: NodeKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_type: Option<StreamType>,
        #[serde(default)]
        options: StreamOptions,
        implicit_parents: bool,
    },
    Delete,
    Rename {
        to: Path,
    },
    AddStream {
        stream_type: StreamType,
        #[serde(default)]
        options: StreamOptions,
    },
    RemoveStream {
        stream_type: StreamType,
    },
    ReadStream {
        stream_type: StreamType,
    },
    WriteStream {
        stream_type: StreamType,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    Capacity,
    Snapshot,
}

impl Op {
    /// Whether repeating the operation cannot create state a single call
    /// would not. A retried `Create` may report `AlreadyExists`, but never
    /// duplicates a node; `CreateUnique` mints a new node per call.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Op::CreateUnique { .. })
    }

    /// Whether the operation changes the served tree.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Op::Create { .. }
                | Op::CreateUnique { .. }
                | Op::Delete
                | Op::Rename { .. }
                | Op::AddStream { .. }
                | Op::RemoveStream { .. }
                | Op::WriteStream { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            Op::Ping => "ping",
            Op::Stat => "stat",
            Op::List => "list",
            Op::Create { .. } => "create",
            Op::CreateUnique { .. } => "create_unique",
            Op::Delete => "delete",
            Op::Rename { .. } => "rename",
            Op::AddStream { .. } => "add_stream",
            Op::RemoveStream { .. } => "remove_stream",
            Op::ReadStream { .. } => "read_stream",
            Op::WriteStream { .. } => "write_stream",
            Op::Capacity => "capacity",
            Op::Snapshot => "snapshot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    NotFound,
    Busy,
    PermissionDenied,
    AlreadyExists,
    InvalidRequest,
    Unsupported,
    InternalError,
}

impl From<ErrorKind> for Status {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound | ErrorKind::StreamNotFound | ErrorKind::NoMountPoint => {
                Status::NotFound
            }
            ErrorKind::ResourceBusy => Status::Busy,
            ErrorKind::PermissionDenied => Status::PermissionDenied,
            ErrorKind::AlreadyExists => Status::AlreadyExists,
            ErrorKind::InvalidPath
            | ErrorKind::NotADirectory
            | ErrorKind::MissingParent
            | ErrorKind::AmbiguousStreamType => Status::InvalidRequest,
            ErrorKind::NotSupported | ErrorKind::UnsupportedFormat => Status::Unsupported,
            _ => Status::InternalError,
        }
    }
}

/// Successful result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Unit,
    Node {
        info: NodeInfo,
    },
    Names {
        names: Vec<String>,
    },
    Flag {
        value: bool,
    },
    Bytes {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    Path {
        path: Path,
    },
    Capacity {
        free: Option<u64>,
        total: Option<u64>,
    },
}

/// A failed call, in enough detail to rebuild the error on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    /// Human-readable rendering of the server-side error.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<StreamType>,
    /// Free-form payload of the error (busy reason, unsupported operation...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorDescriptor {
    pub fn from_error(error: &Error) -> Self {
        let (stream_type, detail) = match error {
            Error::AlreadyExists { stream_type, .. } => (stream_type.clone(), None),
            Error::StreamNotFound { stream_type, .. } => (Some(stream_type.clone()), None),
            Error::AmbiguousStreamType { requested, .. } => (Some(requested.clone()), None),
            Error::ResourceBusy { reason, .. } => (None, Some(reason.clone())),
            Error::UnsupportedFormat { format, message } => {
                (Some(StreamType::new(format.clone())), Some(message.clone()))
            }
            Error::NotSupported { operation } => (None, Some(operation.clone())),
            Error::Timeout { operation } => (None, Some(operation.clone())),
            Error::Disconnected { endpoint } | Error::EndpointInUse { endpoint } => {
                (None, Some(endpoint.clone()))
            }
            Error::DatabaseClosed { name } => (None, Some(name.clone())),
            Error::Faulted { message, .. } => (None, Some(message.clone())),
            _ => (None, None),
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            path: error.path().cloned(),
            stream_type,
            detail,
        }
    }

    /// Rebuild the error. Paths are passed through `rebase` so the caller
    /// can express them relative to its own root.
    pub fn into_error(self, rebase: impl Fn(Path) -> Path) -> Error {
        let path = rebase(self.path.unwrap_or_default());
        let detail = self.detail.unwrap_or_else(|| self.message.clone());
        let stream_type = self.stream_type;
        match self.kind {
            ErrorKind::InvalidPath => Error::invalid_path(self.message),
            ErrorKind::NotFound => Error::NotFound { path },
            ErrorKind::NotADirectory => Error::NotADirectory { path },
            ErrorKind::MissingParent => Error::MissingParent { path },
            ErrorKind::AlreadyExists => Error::AlreadyExists { path, stream_type },
            ErrorKind::StreamNotFound => Error::StreamNotFound {
                path,
                stream_type: stream_type.unwrap_or_else(StreamType::binary),
            },
            ErrorKind::AmbiguousStreamType => Error::AmbiguousStreamType {
                path,
                requested: stream_type.unwrap_or_else(StreamType::binary),
                candidates: Vec::new(),
            },
            ErrorKind::NoMountPoint => Error::NoMountPoint { path },
            ErrorKind::AlreadyMounted => Error::AlreadyMounted { path },
            ErrorKind::MountInUse => Error::MountInUse {
                path,
                nested: Vec::new(),
            },
            ErrorKind::ResourceBusy => Error::ResourceBusy {
                path,
                reason: detail,
            },
            ErrorKind::StreamClosed => Error::StreamClosed,
            ErrorKind::DatabaseClosed => Error::DatabaseClosed { name: detail },
            ErrorKind::UnsupportedFormat => Error::UnsupportedFormat {
                format: stream_type.map(|t| t.to_string()).unwrap_or_default(),
                message: detail,
            },
            ErrorKind::NotSupported => Error::NotSupported { operation: detail },
            ErrorKind::PermissionDenied => Error::PermissionDenied { path },
            ErrorKind::Timeout => Error::Timeout { operation: detail },
            ErrorKind::Disconnected => Error::Disconnected { endpoint: detail },
            ErrorKind::EndpointInUse => Error::EndpointInUse { endpoint: detail },
            ErrorKind::Cancelled => Error::Cancelled,
            ErrorKind::Faulted => Error::Faulted {
                mount: path,
                message: detail,
            },
            // The served database is broken; surface it as a fault of ours.
            ErrorKind::CorruptSnapshot | ErrorKind::Io | ErrorKind::Internal => {
                Error::internal(format!("remote: {}", self.message))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl Response {
    pub fn ok(id: u64, body: Body) -> Self {
        Self {
            id,
            status: Status::Ok,
            body: Some(body),
            error: None,
        }
    }

    pub fn error(id: u64, error: &Error) -> Self {
        Self {
            id,
            status: error.kind().into(),
            body: None,
            error: Some(ErrorDescriptor::from_error(error)),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
