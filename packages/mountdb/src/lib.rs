//! mountdb: a mount-based virtual object database.
//!
//! Databases backed by different drivers (in memory, a host directory, a
//! remote server) are spliced into one namespace by mounting them at paths.
//! Every node may carry several independently typed streams.
//!
//! This crate bundles the layers:
//! - [`mountdb_core`]: paths, the driver contract, databases, the mount table
//! - [`memory`]: the in-memory driver and its snapshots
//! - [`host`]: the host-filesystem driver
//! - [`remote`]: the remote proxy driver and endpoint server
//!
//! plus a [`DefaultFactory`] for all of them and [`boot`] to assemble a
//! namespace from a [`BootConfig`].
//!
//! # Example
//!
//! ```rust
//! use mountdb::{boot, path, BootConfig, CreateOptions, DefaultFactory, StreamType};
//!
//! let host_dir = tempfile::tempdir()?;
//! let manager = boot(&BootConfig::default_layout(host_dir.path()), DefaultFactory::new())?;
//!
//! manager.create(&path!("/Volumes/Host/notes.txt"), &StreamType::text(), CreateOptions::default().leaf())?;
//! manager.write_bytes(&path!("/Volumes/Host/notes.txt"), &StreamType::text(), b"hello")?;
//! assert!(host_dir.path().join("notes.txt").is_file());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod boot;
pub mod commands;
mod factory;

pub use mountdb_core::*;
pub use mountdb_host as host;
pub use mountdb_memory as memory;
pub use mountdb_remote as remote;

pub use boot::{boot, BootConfig, BootError};
pub use factory::DefaultFactory;
