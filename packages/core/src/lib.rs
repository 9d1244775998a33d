//! Core mountdb: a mount-based virtual object database
//!
//! - `Path`: validated, `/`-separated namespace paths
//! - `Driver`: a backend that materializes one rooted node tree
//! - `Database`: a driver plus locking, typed-stream resolution and handles
//! - `DatabaseManager`: databases composed into one namespace by mount path
//!
//! Nodes carry any number of independently typed streams. A request for a
//! stream type is resolved through an explicit [`TypeRegistry`], so a stream
//! declared for `Text` with `allow_derived` can serve requests for `Config`.
//!
//! # Example
//!
//! ```rust
//! use mountdb_core::{path, CreateOptions, Database, NodeTree, StreamType};
//!
//! let db = Database::with_driver(NodeTree::new());
//! db.create(&path!("/a/b/c"), &StreamType::config(), CreateOptions::default())?;
//! db.write_bytes(&path!("/a/b/c"), &StreamType::config(), b"x=1")?;
//! assert_eq!(&db.read_bytes(&path!("/a/b/c"), &StreamType::config())?[..], b"x=1");
//! # Ok::<(), mountdb_core::Error>(())
//! ```

pub use bytes::Bytes;

mod database;
mod error;
mod lock;
pub mod manager;
pub mod mount_config;
mod node;
mod path;
pub mod path_map;
mod stream;
mod stream_type;
mod traits;

pub use database::{Database, DatabaseConfig};
pub use error::{Error, ErrorKind, Result};
pub use lock::{Lease, LeaseMode, LockPolicy, StreamKey};
pub use manager::{DatabaseManager, ManagerConfig, MountInfo, Resolved, UnmountPolicy};
pub use mount_config::{DriverFactory, MountConfig, MountPoint};
pub use node::{
    CreateOptions, Node, NodeInfo, NodeKind, NodeSpec, NodeTree, StreamData, StreamInfo,
    StreamOptions,
};
pub use path::{Path, PathError};
pub use path_map::PathMap;
pub use stream::{OpenMode, StreamHandle};
pub use stream_type::{StreamType, TypeRegistry};
pub use traits::Driver;
