//! The mount table: many databases composed into one namespace.
//!
//! Every absolute path is routed to the database mounted at its longest
//! segment-wise prefix, and the rest of the path is handed to that database
//! relative to its own root. Mounts may nest; deeper mounts shadow whatever
//! the enclosing database holds at the same path.

use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::database::{Database, DatabaseConfig};
use crate::error::{poisoned, Error, Result};
use crate::lock::LockPolicy;
use crate::mount_config::{DriverFactory, MountConfig, MountPoint};
use crate::node::{CreateOptions, NodeInfo, NodeKind, StreamOptions};
use crate::path::Path;
use crate::path_map::PathMap;
use crate::stream::{OpenMode, StreamHandle};
use crate::stream_type::{StreamType, TypeRegistry};
use crate::traits::Driver;

/// What `unmount` does when other mounts live below the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmountPolicy {
    /// Fail with `MountInUse`.
    #[default]
    Reject,
    /// Unmount the nested mounts too, deepest first.
    Cascade,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub unmount_policy: UnmountPolicy,
    /// Lock policy for databases the manager builds itself.
    #[serde(default)]
    pub lock_policy: LockPolicy,
}

/// One row of [`DatabaseManager::mounts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub path: Path,
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<MountConfig>,
    /// Set once a fatal driver error has poisoned the mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faulted: Option<String>,
}

/// Result of routing a namespace path to its mount.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub database: Database,
    /// Path inside `database`.
    pub relative: Path,
    /// Where `database` is mounted.
    pub mount: Path,
}

struct MountEntry {
    database: Database,
    config: Option<MountConfig>,
    fault: Mutex<Option<String>>,
}

impl MountEntry {
    fn new(database: Database, config: Option<MountConfig>) -> Arc<Self> {
        Arc::new(Self {
            database,
            config,
            fault: Mutex::new(None),
        })
    }

    fn fault(&self) -> Result<Option<String>> {
        Ok(self.fault.lock().map_err(poisoned)?.clone())
    }
}

struct Route {
    entry: Arc<MountEntry>,
    mount: Path,
    relative: Path,
}

impl Route {
    /// Run `op` against the routed database, rebasing error paths into the
    /// namespace and poisoning the mount on fatal errors.
    fn call<T>(&self, op: impl FnOnce(&Database, &Path) -> Result<T>) -> Result<T> {
        self.call_at(&self.relative, op)
    }

    /// [`Route::call`] for another path inside the same mount.
    fn call_at<T>(
        &self,
        relative: &Path,
        op: impl FnOnce(&Database, &Path) -> Result<T>,
    ) -> Result<T> {
        op(&self.entry.database, relative).map_err(|e| {
            if e.is_fatal() {
                tracing::warn!(mount = %self.mount, error = %e, "marking mount faulted");
                if let Ok(mut fault) = self.entry.fault.lock() {
                    fault.get_or_insert_with(|| e.to_string());
                }
            }
            e.with_prefix(&self.mount)
        })
    }

    fn absolute(&self, relative: &Path) -> Path {
        self.mount.join(relative)
    }
}

/// Composes databases into one logical tree by mount path.
///
/// The manager owns its mount table and type registry outright; build one per
/// process and pass it by reference.
pub struct DatabaseManager {
    config: ManagerConfig,
    registry: Arc<TypeRegistry>,
    factory: Option<Box<dyn DriverFactory>>,
    mounts: RwLock<PathMap<Arc<MountEntry>>>,
}

impl Default for DatabaseManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mounts: Vec<String> = self
            .mounts()
            .map(|m| m.into_iter().map(|m| m.path.to_string()).collect())
            .unwrap_or_default();
        f.debug_struct("DatabaseManager")
            .field("config", &self.config)
            .field("mounts", &mounts)
            .finish()
    }
}

impl DatabaseManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_registry(config, Arc::new(TypeRegistry::new()))
    }

    pub fn with_registry(config: ManagerConfig, registry: Arc<TypeRegistry>) -> Self {
        Self {
            config,
            registry,
            factory: None,
            mounts: RwLock::new(PathMap::new()),
        }
    }

    /// Install the factory used by [`mount_config`](Self::mount_config).
    #[must_use]
    pub fn with_factory(mut self, factory: impl DriverFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Wrap a driver in a database sharing this manager's registry.
    pub fn new_database(&self, name: impl Into<String>, driver: impl Driver + 'static) -> Database {
        Database::new(
            driver,
            self.registry.clone(),
            DatabaseConfig::named(name).with_lock_policy(self.config.lock_policy),
        )
    }

    /// Splice `database`'s root into the namespace at `path`.
    pub fn mount(&self, path: &Path, database: Database) -> Result<()> {
        self.insert_mount(path, MountEntry::new(database, None))
    }

    /// Build a database from configuration and mount it.
    pub fn mount_config(&self, point: &MountPoint) -> Result<Database> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| Error::not_supported("mounting from configuration without a factory"))?;
        if self.mounts.read().map_err(poisoned)?.contains(&point.mount) {
            return Err(Error::AlreadyMounted {
                path: point.mount.clone(),
            });
        }
        let driver = factory.create(&point.config)?;
        let database = Database::new(
            driver,
            self.registry.clone(),
            DatabaseConfig::named(point.mount.to_string())
                .with_lock_policy(point.lock_policy.unwrap_or(self.config.lock_policy)),
        );
        self.insert_mount(
            &point.mount,
            MountEntry::new(database.clone(), Some(point.config.clone())),
        )?;
        Ok(database)
    }

    fn insert_mount(&self, path: &Path, entry: Arc<MountEntry>) -> Result<()> {
        let mut mounts = self.mounts.write().map_err(poisoned)?;
        if mounts.contains(path) {
            return Err(Error::AlreadyMounted { path: path.clone() });
        }
        tracing::info!(
            %path,
            driver = entry.database.driver_kind(),
            name = entry.database.name(),
            "mount"
        );
        mounts.insert(path, entry);
        Ok(())
    }

    /// Remove the mount at `path`. Returns every path unmounted, deepest
    /// first. The databases themselves stay open for their other holders.
    pub fn unmount(&self, path: &Path) -> Result<Vec<Path>> {
        let mut mounts = self.mounts.write().map_err(poisoned)?;
        if !mounts.contains(path) {
            return Err(Error::NoMountPoint { path: path.clone() });
        }
        let nested = mounts.descendants(path);
        if !nested.is_empty() && self.config.unmount_policy == UnmountPolicy::Reject {
            return Err(Error::MountInUse {
                path: path.clone(),
                nested,
            });
        }

        let mut removed = nested;
        removed.push(path.clone());
        for p in &removed {
            mounts.remove(p);
            tracing::info!(path = %p, "unmount");
        }
        Ok(removed)
    }

    pub fn is_mounted(&self, path: &Path) -> Result<bool> {
        Ok(self.mounts.read().map_err(poisoned)?.contains(path))
    }

    /// Every mount, sorted by path.
    pub fn mounts(&self) -> Result<Vec<MountInfo>> {
        let mounts = self.mounts.read().map_err(poisoned)?;
        mounts
            .iter()
            .map(|(path, entry)| {
                Ok(MountInfo {
                    path: path.clone(),
                    driver: entry.database.driver_kind().to_string(),
                    config: entry.config.clone(),
                    faulted: entry.fault()?,
                })
            })
            .collect()
    }

    fn route(&self, path: &Path) -> Result<Route> {
        let mounts = self.mounts.read().map_err(poisoned)?;
        let (entry, relative) = mounts
            .longest_prefix(path)
            .ok_or_else(|| Error::NoMountPoint { path: path.clone() })?;
        let mount = path.slice(0, path.len() - relative.len());
        if let Some(message) = entry.fault()? {
            return Err(Error::Faulted { mount, message });
        }
        tracing::debug!(%path, %mount, %relative, "resolved mount");
        Ok(Route {
            entry: entry.clone(),
            mount,
            relative,
        })
    }

    /// Route a namespace path to the database that owns it.
    pub fn resolve_mount(&self, path: &Path) -> Result<Resolved> {
        let route = self.route(path)?;
        Ok(Resolved {
            database: route.entry.database.clone(),
            relative: route.relative,
            mount: route.mount,
        })
    }

    /// Names of mount points directly below `path`.
    fn mounted_children(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self.mounts.read().map_err(poisoned)?.child_names(path))
    }

    /// Mount points strictly below `path`.
    fn nested_mounts(&self, path: &Path) -> Result<Vec<Path>> {
        Ok(self.mounts.read().map_err(poisoned)?.descendants(path))
    }

    pub fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) | Err(Error::NoMountPoint { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resolve a namespace path to its node.
    ///
    /// Intermediate directories that exist only because a mount lives below
    /// them are reported as empty directories.
    pub fn stat(&self, path: &Path) -> Result<NodeInfo> {
        let virtual_dir = |children: Vec<String>| NodeInfo {
            path: path.clone(),
            kind: NodeKind::Directory,
            children: children.len(),
            streams: Vec::new(),
        };
        let mounted = self.mounted_children(path)?;
        let route = match self.route(path) {
            Ok(route) => route,
            Err(Error::NoMountPoint { .. }) if !mounted.is_empty() => {
                return Ok(virtual_dir(mounted))
            }
            Err(e) => return Err(e),
        };
        match route.call(|db, rel| db.stat(rel)) {
            Ok(mut info) => {
                info.path = route.absolute(&info.path);
                Ok(info)
            }
            Err(Error::NotFound { .. }) if !mounted.is_empty() => Ok(virtual_dir(mounted)),
            Err(e) => Err(e),
        }
    }

    pub fn find(&self, path: &Path) -> Result<NodeInfo> {
        self.stat(path)
    }

    /// Child names of `path`, including mount points directly below it.
    pub fn list(&self, path: &Path) -> Result<Vec<String>> {
        let mounted = self.mounted_children(path)?;
        let route = match self.route(path) {
            Ok(route) => route,
            Err(Error::NoMountPoint { .. }) if !mounted.is_empty() => return Ok(mounted),
            Err(e) => return Err(e),
        };
        let mut names = match route.call(|db, rel| db.list(rel)) {
            Ok(names) => names,
            Err(Error::NotFound { .. }) if !mounted.is_empty() => Vec::new(),
            Err(e) => return Err(e),
        };
        names.extend(mounted);
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn create(
        &self,
        path: &Path,
        stream_type: &StreamType,
        options: CreateOptions,
    ) -> Result<NodeInfo> {
        let route = self.route(path)?;
        let mut info = route.call(|db, rel| db.create(rel, stream_type, options))?;
        info.path = route.absolute(&info.path);
        Ok(info)
    }

    pub fn create_node(&self, path: &Path, options: CreateOptions) -> Result<NodeInfo> {
        let route = self.route(path)?;
        let mut info = route.call(|db, rel| db.create_node(rel, options))?;
        info.path = route.absolute(&info.path);
        Ok(info)
    }

    /// Create a uniquely named child of `parent`. Returns its namespace path.
    pub fn create_unique(
        &self,
        parent: &Path,
        prefix: &str,
        stream_type: Option<&StreamType>,
        options: CreateOptions,
    ) -> Result<Path> {
        let route = self.route(parent)?;
        let created = route.call(|db, rel| db.create_unique(rel, prefix, stream_type, options))?;
        Ok(route.absolute(&created))
    }

    /// Delete a subtree. Mount points and subtrees holding mount points
    /// cannot be deleted; unmount them first.
    pub fn delete(&self, path: &Path, force: bool) -> Result<()> {
        let mounts = self.mounts.read().map_err(poisoned)?;
        if mounts.contains(path) {
            return Err(Error::invalid_path(format!(
                "{} is a mount point; unmount it instead",
                path
            )));
        }
        let nested = mounts.descendants(path);
        if !nested.is_empty() {
            return Err(Error::MountInUse {
                path: path.clone(),
                nested,
            });
        }
        drop(mounts);
        let route = self.route(path)?;
        route.call(|db, rel| db.delete(rel, force))
    }

    /// Move a subtree. Within one database the move is atomic; across mounts
    /// it is a copy followed by a delete and is not atomic.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        for p in [from, to] {
            if self.is_mounted(p)? {
                return Err(Error::invalid_path(format!("{} is a mount point", p)));
            }
        }
        let nested = self.nested_mounts(from)?;
        if !nested.is_empty() {
            return Err(Error::MountInUse {
                path: from.clone(),
                nested,
            });
        }
        let source = self.route(from)?;
        let target = self.route(to)?;
        if source.entry.database.same_as(&target.entry.database) {
            return source.call(|db, rel| db.rename(rel, &target.relative));
        }
        self.move_across(&source, &target)
    }

    fn move_across(&self, source: &Route, target: &Route) -> Result<()> {
        tracing::debug!(
            from = %source.absolute(&source.relative),
            to = %target.absolute(&target.relative),
            "cross-mount move"
        );
        if source.call(|db, rel| db.has_open_streams(rel))? {
            return Err(Error::busy(
                &source.absolute(&source.relative),
                "open streams in subtree",
            ));
        }
        if target.call(|db, rel| db.exists(rel))? {
            return Err(Error::AlreadyExists {
                path: target.absolute(&target.relative),
                stream_type: None,
            });
        }

        let copied = copy_subtree(source, &source.relative, target, &target.relative);
        if let Err(e) = copied {
            // Partial destination left by the failed copy.
            if let Err(cleanup) = target.call(|db, rel| db.delete(rel, true)) {
                tracing::warn!(
                    path = %target.absolute(&target.relative),
                    error = %cleanup,
                    "could not remove partial copy"
                );
            }
            return Err(e);
        }

        source.call(|db, rel| db.delete(rel, false)).map_err(|e| {
            tracing::warn!(
                from = %source.absolute(&source.relative),
                to = %target.absolute(&target.relative),
                error = %e,
                "cross-mount move copied but could not delete the source; both copies remain"
            );
            e
        })
    }

    pub fn add_stream(
        &self,
        path: &Path,
        stream_type: &StreamType,
        options: StreamOptions,
    ) -> Result<()> {
        self.route(path)?
            .call(|db, rel| db.add_stream(rel, stream_type, options))
    }

    /// Remove one stream; see [`Database::remove_stream`] for `force`.
    pub fn remove_stream(&self, path: &Path, stream_type: &StreamType, force: bool) -> Result<bool> {
        self.route(path)?
            .call(|db, rel| db.remove_stream(rel, stream_type, force))
    }

    pub fn has_stream(&self, path: &Path, stream_type: &StreamType) -> Result<bool> {
        self.route(path)?
            .call(|db, rel| db.has_stream(rel, stream_type))
    }

    /// Open a stream. The handle reports its path relative to the owning
    /// database.
    pub fn open_stream(
        &self,
        path: &Path,
        stream_type: &StreamType,
        mode: OpenMode,
    ) -> Result<StreamHandle> {
        self.route(path)?
            .call(|db, rel| db.open_stream(rel, stream_type, mode))
    }

    pub fn open_for_writing(&self, path: &Path, stream_type: &StreamType) -> Result<StreamHandle> {
        self.open_stream(path, stream_type, OpenMode::Write)
    }

    pub fn read_bytes(&self, path: &Path, stream_type: &StreamType) -> Result<Bytes> {
        self.route(path)?
            .call(|db, rel| db.read_bytes(rel, stream_type))
    }

    pub fn write_bytes(&self, path: &Path, stream_type: &StreamType, data: &[u8]) -> Result<()> {
        self.route(path)?
            .call(|db, rel| db.write_bytes(rel, stream_type, data))
    }

    /// Advisory free space of the database owning `path`.
    pub fn free_space(&self, path: &Path) -> Result<Option<u64>> {
        self.route(path)?.call(|db, _| db.free_space())
    }

    pub fn device_storage(&self, path: &Path) -> Result<Option<u64>> {
        self.route(path)?.call(|db, _| db.device_storage())
    }

    /// Close every mounted database and empty the mount table.
    ///
    /// All databases are closed even if some fail; the first error is
    /// returned.
    pub fn close(&self) -> Result<()> {
        let mut mounts = self.mounts.write().map_err(poisoned)?;
        let entries: Vec<(Path, Arc<MountEntry>)> = mounts
            .iter()
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect();
        *mounts = PathMap::new();
        drop(mounts);

        let mut first_error = None;
        for (path, entry) in entries {
            if let Err(e) = entry.database.close() {
                tracing::warn!(%path, error = %e, "close failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Recursively copy one node (streams, options, bytes, children) into another
/// database. The destination parent must already exist.
/// Copy `from` in `src` to `to` in `dst`. Each side's errors go through its
/// own route.
fn copy_subtree(src: &Route, from: &Path, dst: &Route, to: &Path) -> Result<()> {
    let info = src.call_at(from, |db, rel| db.stat(rel))?;
    let mut streams = info.streams.iter();
    let base = CreateOptions {
        kind: info.kind,
        implicit_parents: false,
        stream: StreamOptions::default(),
    };
    match streams.next() {
        Some(first) => {
            let options = CreateOptions {
                stream: first.options,
                ..base
            };
            dst.call_at(to, |db, rel| db.create(rel, &first.stream_type, options))?;
            copy_stream(src, from, dst, to, &first.stream_type)?;
        }
        None => {
            dst.call_at(to, |db, rel| db.create_node(rel, base))?;
        }
    }
    for stream in streams {
        dst.call_at(to, |db, rel| db.add_stream(rel, &stream.stream_type, stream.options))?;
        copy_stream(src, from, dst, to, &stream.stream_type)?;
    }

    if info.kind == NodeKind::Directory {
        for name in src.call_at(from, |db, rel| db.list(rel))? {
            copy_subtree(src, &from.child(&name)?, dst, &to.child(&name)?)?;
        }
    }
    Ok(())
}

fn copy_stream(
    src: &Route,
    from: &Path,
    dst: &Route,
    to: &Path,
    stream_type: &StreamType,
) -> Result<()> {
    let data = src.call_at(from, |db, rel| db.read_bytes(rel, stream_type))?;
    dst.call_at(to, |db, rel| db.write_bytes(rel, stream_type, &data))
}
