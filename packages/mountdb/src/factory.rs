//! Builds drivers from mount configurations.

use mountdb_core::{Driver, DriverFactory, MountConfig, Result};
use mountdb_host::{HostConfig, HostDriver};
use mountdb_memory::MemoryDriver;
use mountdb_remote::{ChannelConnection, RemoteConfig, RemoteDriver, Server};

/// The factory for every driver shipped with mountdb.
///
/// Remote mounts go over HTTP, except for endpoints registered on the
/// optional in-process [`Server`], which are reached through a channel.
#[derive(Debug, Clone, Default)]
pub struct DefaultFactory {
    local: Option<Server>,
}

impl DefaultFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve remote mounts whose endpoint is registered on `server` in
    /// process.
    #[must_use]
    pub fn with_local_server(mut self, server: Server) -> Self {
        self.local = Some(server);
        self
    }

    fn remote(&self, config: &RemoteConfig) -> Result<RemoteDriver> {
        if let Some(server) = &self.local {
            if server.endpoints()?.contains(&config.endpoint) {
                let connection = ChannelConnection::open(server, config.endpoint.clone());
                return Ok(RemoteDriver::from_config(config, connection));
            }
        }
        RemoteDriver::http(config)
    }
}

impl DriverFactory for DefaultFactory {
    fn create(&self, config: &MountConfig) -> Result<Box<dyn Driver>> {
        match config {
            MountConfig::Memory { capacity, snapshot } => {
                let mut driver = match snapshot {
                    Some(file) => MemoryDriver::open_file(file.clone())?,
                    None => MemoryDriver::new(),
                };
                if let Some(capacity) = capacity {
                    driver = driver.with_capacity(*capacity);
                }
                Ok(Box::new(driver))
            }
            MountConfig::Host { path, capacity } => {
                let driver = HostDriver::new(HostConfig {
                    root: path.clone(),
                    capacity: *capacity,
                })?;
                Ok(Box::new(driver))
            }
            MountConfig::Remote {
                endpoint,
                root,
                timeout_ms,
            } => {
                let mut remote = RemoteConfig::new(endpoint.clone());
                remote.root = root.clone();
                if let Some(timeout_ms) = timeout_ms {
                    remote.timeout_ms = *timeout_ms;
                }
                Ok(Box::new(self.remote(&remote)?))
            }
        }
    }
}
