//! Mount configuration objects.
//!
//! Mounts can be described as JSON objects like:
//! ```json
//! {"type": "memory"}
//! {"type": "memory", "capacity": 1048576, "snapshot": "/var/lib/mountdb/root.snap"}
//! {"type": "host", "path": "/srv/data"}
//! {"type": "remote", "endpoint": "http://db.example.com", "root": "/shared"}
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lock::LockPolicy;
use crate::path::Path;
use crate::traits::Driver;

/// Configuration for the driver behind a mount point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MountConfig {
    /// In-memory tree, optionally restored from a snapshot file.
    Memory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<PathBuf>,
    },
    /// Directory on the host filesystem.
    Host {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<u64>,
    },
    /// Database exposed by a remote server.
    Remote {
        endpoint: String,
        #[serde(default)]
        root: Path,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl MountConfig {
    /// An empty in-memory tree.
    pub fn memory() -> Self {
        MountConfig::Memory {
            capacity: None,
            snapshot: None,
        }
    }

    pub fn host(path: impl Into<PathBuf>) -> Self {
        MountConfig::Host {
            path: path.into(),
            capacity: None,
        }
    }

    pub fn remote(endpoint: impl Into<String>, root: Path) -> Self {
        MountConfig::Remote {
            endpoint: endpoint.into(),
            root,
            timeout_ms: None,
        }
    }

    /// The `type` tag of this configuration.
    pub fn driver_type(&self) -> &'static str {
        match self {
            MountConfig::Memory { .. } => "memory",
            MountConfig::Host { .. } => "host",
            MountConfig::Remote { .. } => "remote",
        }
    }
}

/// A mount point: where to splice a database and how to build it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Where in the namespace the database root is spliced.
    pub mount: Path,
    #[serde(flatten)]
    pub config: MountConfig,
    /// Overrides the manager's lock policy for this database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_policy: Option<LockPolicy>,
}

impl MountPoint {
    pub fn new(mount: Path, config: MountConfig) -> Self {
        Self {
            mount,
            config,
            lock_policy: None,
        }
    }
}

/// Builds drivers from mount configurations.
pub trait DriverFactory: Send + Sync {
    fn create(&self, config: &MountConfig) -> Result<Box<dyn Driver>>;
}

impl<F: DriverFactory + ?Sized> DriverFactory for &F {
    fn create(&self, config: &MountConfig) -> Result<Box<dyn Driver>> {
        (**self).create(config)
    }
}
