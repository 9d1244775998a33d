//! Startup configuration: which databases to mount where.
//!
//! ```json
//! {
//!   "root": {"type": "memory", "snapshot": "/var/lib/mountdb/root.snap"},
//!   "mounts": [
//!     {"mount": "/Volumes/Host", "type": "host", "path": "/srv/data"},
//!     {"mount": "/Volumes/Peer", "type": "remote", "endpoint": "http://peer:7000", "timeout_ms": 2000}
//!   ],
//!   "manager": {"unmount_policy": "reject", "lock_policy": {"mode": "block", "timeout_ms": 500}}
//! }
//! ```

use std::fs;
use std::path::{Path as FsPath, PathBuf};

use serde::{Deserialize, Serialize};

use mountdb_core::{path, DatabaseManager, DriverFactory, ManagerConfig, MountConfig, MountPoint, Path};

#[derive(thiserror::Error, Debug)]
pub enum BootError {
    #[error("{0}")]
    Database(#[from] mountdb_core::Error),

    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid boot config: {0}")]
    Json(#[from] serde_json::Error),
}

/// The root database and the auxiliary mounts spliced into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    /// Mounted at `/`.
    pub root: MountConfig,
    /// Mounted in order, after the root.
    #[serde(default)]
    pub mounts: Vec<MountPoint>,
    #[serde(default)]
    pub manager: ManagerConfig,
}

impl BootConfig {
    /// An in-memory root with `host_dir` mounted at `/Volumes/Host`.
    pub fn default_layout(host_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: MountConfig::memory(),
            mounts: vec![MountPoint::new(
                path!("/Volumes/Host"),
                MountConfig::host(host_dir),
            )],
            manager: ManagerConfig::default(),
        }
    }

    pub fn load(file: impl AsRef<FsPath>) -> Result<Self, BootError> {
        let file = file.as_ref();
        let text = fs::read_to_string(file).map_err(|source| BootError::Read {
            path: file.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Build a manager and mount the root, then every auxiliary mount in order.
pub fn boot(
    config: &BootConfig,
    factory: impl DriverFactory + 'static,
) -> Result<DatabaseManager, BootError> {
    let manager = DatabaseManager::new(config.manager.clone()).with_factory(factory);
    manager.mount_config(&MountPoint::new(Path::root(), config.root.clone()))?;
    for point in &config.mounts {
        manager.mount_config(point)?;
    }
    tracing::info!(mounts = config.mounts.len() + 1, "booted");
    Ok(manager)
}
