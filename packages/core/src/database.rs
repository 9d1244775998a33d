//! A database: one rooted node tree served by one driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{poisoned, Error, Result};
use crate::lock::{Lease, LockPolicy, LockTable, StreamKey, TryAcquire};
use crate::node::{CreateOptions, NodeInfo, StreamOptions};
use crate::path::Path;
use crate::stream::{OpenMode, StreamHandle};
use crate::stream_type::{StreamType, TypeRegistry};
use crate::traits::Driver;

/// Per-database settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Name used in logs and errors.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lock_policy: LockPolicy,
}

impl DatabaseConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_lock_policy(mut self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }
}

pub(crate) struct DatabaseInner {
    config: DatabaseConfig,
    kind: &'static str,
    driver: RwLock<Box<dyn Driver>>,
    locks: Arc<LockTable>,
    registry: Arc<TypeRegistry>,
    closed: AtomicBool,
}

impl DatabaseInner {
    /// Publish a writer's staged bytes.
    pub(crate) fn commit(&self, lease: &Lease, data: Bytes) -> Result<()> {
        let mut driver = self.driver.write().map_err(poisoned)?;
        // Revocation happens under the driver write lock, so a live lease
        // here cannot be invalidated before the write lands.
        if !lease.is_live() {
            return Err(Error::StreamClosed);
        }
        let key = lease.key();
        tracing::debug!(
            database = %self.config.name,
            path = %key.path,
            stream_type = %key.stream_type,
            len = data.len(),
            "commit stream"
        );
        driver.write_stream(&key.path, &key.stream_type, data)
    }
}

/// A rooted node tree plus the driver that materializes it.
///
/// Cloning is cheap and yields another handle on the same database. Tree
/// mutations (create, delete, rename, stream add/remove, commits) are
/// serialized by a single reader/writer lock, so no reader ever observes a
/// half-applied change; reads proceed concurrently.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.config.name)
            .field("driver", &self.inner.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Database {
    pub fn new(
        driver: impl Driver + 'static,
        registry: Arc<TypeRegistry>,
        config: DatabaseConfig,
    ) -> Self {
        let kind = driver.kind();
        tracing::info!(name = %config.name, driver = kind, "open database");
        Self {
            inner: Arc::new(DatabaseInner {
                config,
                kind,
                driver: RwLock::new(Box::new(driver)),
                locks: LockTable::new(),
                registry,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A database with the built-in type registry and default settings.
    pub fn with_driver(driver: impl Driver + 'static) -> Self {
        Self::new(driver, Arc::new(TypeRegistry::new()), DatabaseConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn driver_kind(&self) -> &'static str {
        self.inner.kind
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether two handles refer to the same database.
    pub fn same_as(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::DatabaseClosed {
                name: self.inner.config.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Box<dyn Driver>>> {
        self.ensure_open()?;
        self.inner.driver.read().map_err(poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Box<dyn Driver>>> {
        self.ensure_open()?;
        self.inner.driver.write().map_err(poisoned)
    }

    pub fn exists(&self, path: &Path) -> Result<bool> {
        match self.read()?.stat(path) {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resolve a path to its node.
    pub fn stat(&self, path: &Path) -> Result<NodeInfo> {
        self.read()?.stat(path)
    }

    pub fn list(&self, path: &Path) -> Result<Vec<String>> {
        self.read()?.list(path)
    }

    /// Create a node carrying a stream of `stream_type`.
    ///
    /// If the node already exists without that stream, the stream is added
    /// to it; if the stream exists too, the call fails with `AlreadyExists`.
    pub fn create(
        &self,
        path: &Path,
        stream_type: &StreamType,
        options: CreateOptions,
    ) -> Result<NodeInfo> {
        self.create_inner(path, Some(stream_type), options, true)
    }

    /// Create a node without any stream.
    pub fn create_node(&self, path: &Path, options: CreateOptions) -> Result<NodeInfo> {
        self.create_inner(path, None, options, true)
    }

    /// Create a node that must not exist yet.
    ///
    /// Unlike [`Database::create`], an existing node is `AlreadyExists` even
    /// when it lacks `stream_type`. The check and the creation happen under
    /// one lock, so of several racing callers exactly one succeeds.
    pub fn create_new(
        &self,
        path: &Path,
        stream_type: Option<&StreamType>,
        options: CreateOptions,
    ) -> Result<NodeInfo> {
        self.create_inner(path, stream_type, options, false)
    }

    fn create_inner(
        &self,
        path: &Path,
        stream_type: Option<&StreamType>,
        options: CreateOptions,
        merge: bool,
    ) -> Result<NodeInfo> {
        let mut driver = self.write()?;
        tracing::debug!(database = %self.name(), %path, merge, "create");
        match driver.stat(path) {
            Ok(info) => match stream_type {
                Some(t) if merge && info.stream(t).is_none() => {
                    driver.add_stream(path, t, options.stream)?;
                    driver.stat(path)
                }
                _ => Err(Error::AlreadyExists {
                    path: path.clone(),
                    stream_type: stream_type.cloned(),
                }),
            },
            Err(Error::NotFound { .. }) => {
                driver.create(path, &options.spec(stream_type))?;
                driver.stat(path)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a child of `parent` under a freshly generated name.
    ///
    /// Every call mints a new node, so this must never be retried blindly.
    pub fn create_unique(
        &self,
        parent: &Path,
        prefix: &str,
        stream_type: Option<&StreamType>,
        options: CreateOptions,
    ) -> Result<Path> {
        let mut driver = self.write()?;
        let path = driver.create_unique(parent, prefix, &options.spec(stream_type))?;
        tracing::debug!(database = %self.name(), %path, "create unique");
        Ok(path)
    }

    /// Delete a node and its subtree.
    ///
    /// Fails with `ResourceBusy` if any stream in the subtree is open, unless
    /// `force` is set, in which case those handles are invalidated.
    pub fn delete(&self, path: &Path, force: bool) -> Result<()> {
        if path.is_root() {
            return Err(Error::invalid_path("the root node cannot be deleted"));
        }
        let mut driver = self.write()?;
        driver.stat(path)?;
        let busy = self.inner.locks.is_busy_under(path)?;
        if busy && !force {
            return Err(Error::busy(path, "open streams in subtree"));
        }
        tracing::debug!(database = %self.name(), %path, force, "delete");
        driver.delete(path)?;
        if busy {
            let revoked = self.inner.locks.revoke_under(path)?;
            tracing::debug!(database = %self.name(), %path, revoked, "invalidated handles");
        }
        Ok(())
    }

    /// Move a node and its subtree to `to`.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut driver = self.write()?;
        if self.inner.locks.is_busy_under(from)? {
            return Err(Error::busy(from, "open streams in subtree"));
        }
        tracing::debug!(database = %self.name(), %from, %to, "rename");
        driver.rename(from, to)
    }

    pub fn add_stream(
        &self,
        path: &Path,
        stream_type: &StreamType,
        options: StreamOptions,
    ) -> Result<()> {
        self.write()?.add_stream(path, stream_type, options)
    }

    /// Remove the stream registered under exactly `stream_type`.
    ///
    /// An open stream is `ResourceBusy` unless `force` is set, in which case
    /// its handles are invalidated.
    pub fn remove_stream(&self, path: &Path, stream_type: &StreamType, force: bool) -> Result<bool> {
        let mut driver = self.write()?;
        let key = StreamKey {
            path: path.clone(),
            stream_type: stream_type.clone(),
        };
        let busy = self.inner.locks.is_busy(&key)?;
        if busy && !force {
            return Err(Error::busy(path, format!("stream {} is open", stream_type)));
        }
        tracing::debug!(database = %self.name(), %path, %stream_type, force, "remove stream");
        let removed = driver.remove_stream(path, stream_type)?;
        if busy {
            let revoked = self.inner.locks.revoke(&key)?;
            tracing::debug!(database = %self.name(), %path, %stream_type, revoked, "invalidated handles");
        }
        Ok(removed)
    }

    /// Which registered stream a request for `stream_type` resolves to.
    pub fn resolve_stream(&self, path: &Path, stream_type: &StreamType) -> Result<StreamType> {
        let info = self.read()?.stat(path)?;
        self.inner.registry.resolve(path, stream_type, &info.streams)
    }

    pub fn has_stream(&self, path: &Path, stream_type: &StreamType) -> Result<bool> {
        match self.resolve_stream(path, stream_type) {
            Ok(_) => Ok(true),
            Err(Error::StreamNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a stream, honoring at-most-one-writer per (node, type).
    pub fn open_stream(
        &self,
        path: &Path,
        stream_type: &StreamType,
        mode: OpenMode,
    ) -> Result<StreamHandle> {
        let deadline = match self.inner.config.lock_policy {
            LockPolicy::FailFast => None,
            LockPolicy::Block { timeout_ms } => {
                Some(Instant::now() + Duration::from_millis(timeout_ms))
            }
        };

        loop {
            // The driver lock is dropped before waiting so the current holder
            // can still commit.
            let generation = {
                let driver = self.read()?;
                let info = driver.stat(path)?;
                let resolved = self.inner.registry.resolve(path, stream_type, &info.streams)?;
                let key = StreamKey {
                    path: path.clone(),
                    stream_type: resolved,
                };
                match self.inner.locks.try_acquire(&key, mode.lease_mode())? {
                    TryAcquire::Acquired(lease) => {
                        let initial = match mode {
                            OpenMode::Read | OpenMode::Append => {
                                driver.read_stream(path, &key.stream_type)?
                            }
                            OpenMode::Write => Bytes::new(),
                        };
                        tracing::debug!(
                            database = %self.name(),
                            %path,
                            stream_type = %key.stream_type,
                            ?mode,
                            "open stream"
                        );
                        return Ok(StreamHandle::new(self.inner.clone(), lease, mode, initial));
                    }
                    TryAcquire::Busy(generation) => generation,
                }
            };

            let busy = || {
                Error::busy(
                    path,
                    match mode {
                        OpenMode::Read => "stream has an active writer",
                        _ => "stream is open",
                    },
                )
            };
            let Some(deadline) = deadline else {
                return Err(busy());
            };
            if !self.inner.locks.wait_for_release(generation, deadline)? {
                return Err(busy());
            }
        }
    }

    pub fn open_for_writing(&self, path: &Path, stream_type: &StreamType) -> Result<StreamHandle> {
        self.open_stream(path, stream_type, OpenMode::Write)
    }

    /// Read a whole stream.
    pub fn read_bytes(&self, path: &Path, stream_type: &StreamType) -> Result<Bytes> {
        self.open_stream(path, stream_type, OpenMode::Read)?.contents()
    }

    /// Replace a whole stream.
    pub fn write_bytes(&self, path: &Path, stream_type: &StreamType, data: &[u8]) -> Result<()> {
        let mut handle = self.open_stream(path, stream_type, OpenMode::Write)?;
        handle.set_contents(data)?;
        handle.close()
    }

    /// Whether any stream at or below `path` is open.
    pub fn has_open_streams(&self, path: &Path) -> Result<bool> {
        self.inner.locks.is_busy_under(path)
    }

    pub fn free_space(&self) -> Result<Option<u64>> {
        Ok(self.read()?.free_space())
    }

    pub fn device_storage(&self) -> Result<Option<u64>> {
        Ok(self.read()?.device_storage())
    }

    /// Serialize the whole tree, if the driver supports it.
    pub fn snapshot(&self) -> Result<Bytes> {
        self.read()?.snapshot()
    }

    /// Close the database: invalidate every open handle and flush the driver.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut driver = self.inner.driver.write().map_err(poisoned)?;
        let revoked = self.inner.locks.revoke_under(&Path::root())?;
        tracing::info!(name = %self.name(), revoked, "close database");
        driver.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, NodeTree};
    use crate::path;
    use std::thread;

    fn db() -> Database {
        Database::with_driver(NodeTree::new())
    }

    fn config() -> StreamType {
        StreamType::config()
    }

    #[test]
    fn end_to_end_scenario() {
        let db = db();
        db.create(&path!("/a/b/c"), &config(), CreateOptions::default())
            .unwrap();

        let mut writer = db.open_for_writing(&path!("/a/b/c"), &config()).unwrap();
        writer.write_bytes(b"x=1").unwrap();
        writer.close().unwrap();

        let reader = db
            .open_stream(&path!("/a/b/c"), &config(), OpenMode::Read)
            .unwrap();
        assert_eq!(reader.contents().unwrap(), Bytes::from_static(b"x=1"));
        drop(reader);

        db.delete(&path!("/a"), false).unwrap();
        assert!(matches!(
            db.stat(&path!("/a/b/c")),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn create_adds_missing_stream_to_existing_node() {
        let db = db();
        db.create(&path!("/n"), &StreamType::xml(), CreateOptions::default())
            .unwrap();
        let info = db
            .create(&path!("/n"), &StreamType::binary(), CreateOptions::default())
            .unwrap();
        assert_eq!(info.streams.len(), 2);

        assert!(matches!(
            db.create(&path!("/n"), &StreamType::xml(), CreateOptions::default()),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(matches!(
            db.create_node(&path!("/n"), CreateOptions::default()),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn create_unique_mints_distinct_children() {
        let db = db();
        let a = db
            .create_unique(&Path::root(), "job", Some(&config()), CreateOptions::default())
            .unwrap();
        let b = db
            .create_unique(&Path::root(), "job", Some(&config()), CreateOptions::default())
            .unwrap();
        assert_ne!(a, b);
        assert!(a.name().unwrap().starts_with("job-"));
        assert_eq!(db.list(&Path::root()).unwrap().len(), 2);
    }

    #[test]
    fn second_writer_is_busy_until_release() {
        let db = db();
        db.create(&path!("/s"), &config(), CreateOptions::default())
            .unwrap();

        let first = db.open_for_writing(&path!("/s"), &config()).unwrap();
        assert!(matches!(
            db.open_for_writing(&path!("/s"), &config()),
            Err(Error::ResourceBusy { .. })
        ));
        assert!(matches!(
            db.open_stream(&path!("/s"), &config(), OpenMode::Read),
            Err(Error::ResourceBusy { .. })
        ));
        drop(first);
        db.open_for_writing(&path!("/s"), &config()).unwrap();
    }

    #[test]
    fn readers_are_concurrent() {
        let db = db();
        db.create(&path!("/s"), &config(), CreateOptions::default())
            .unwrap();
        let _r1 = db.open_stream(&path!("/s"), &config(), OpenMode::Read).unwrap();
        let _r2 = db.open_stream(&path!("/s"), &config(), OpenMode::Read).unwrap();
    }

    #[test]
    fn blocking_policy_waits_for_release() {
        let db = Database::new(
            NodeTree::new(),
            Arc::new(TypeRegistry::new()),
            DatabaseConfig::named("blocking").with_lock_policy(LockPolicy::block(
                Duration::from_secs(5),
            )),
        );
        db.create(&path!("/s"), &config(), CreateOptions::default())
            .unwrap();

        let mut first = db.open_for_writing(&path!("/s"), &config()).unwrap();
        first.write_bytes(b"first").unwrap();

        let second = {
            let db = db.clone();
            thread::spawn(move || {
                let mut w = db.open_for_writing(&path!("/s"), &config()).unwrap();
                w.write_bytes(b"second").unwrap();
                w.close().unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        first.close().unwrap();
        second.join().unwrap();

        assert_eq!(
            db.read_bytes(&path!("/s"), &config()).unwrap(),
            Bytes::from_static(b"second")
        );
    }

    #[test]
    fn blocking_policy_times_out_as_busy() {
        let db = Database::new(
            NodeTree::new(),
            Arc::new(TypeRegistry::new()),
            DatabaseConfig::default().with_lock_policy(LockPolicy::block(Duration::from_millis(20))),
        );
        db.create(&path!("/s"), &config(), CreateOptions::default())
            .unwrap();
        let _held = db.open_for_writing(&path!("/s"), &config()).unwrap();
        assert!(matches!(
            db.open_for_writing(&path!("/s"), &config()),
            Err(Error::ResourceBusy { .. })
        ));
    }

    #[test]
    fn dropped_writer_rolls_back() {
        let db = db();
        db.create(&path!("/s"), &config(), CreateOptions::default())
            .unwrap();
        db.write_bytes(&path!("/s"), &config(), b"kept").unwrap();

        {
            let mut w = db.open_for_writing(&path!("/s"), &config()).unwrap();
            w.write_bytes(b"lost").unwrap();
        }

        assert_eq!(
            db.read_bytes(&path!("/s"), &config()).unwrap(),
            Bytes::from_static(b"kept")
        );
        // The lock did not outlive the handle.
        db.open_for_writing(&path!("/s"), &config()).unwrap();
    }

    #[test]
    fn append_mode_starts_from_current_contents() {
        let db = db();
        db.create(&path!("/log"), &StreamType::text(), CreateOptions::default())
            .unwrap();
        db.write_bytes(&path!("/log"), &StreamType::text(), b"one\n")
            .unwrap();

        let mut w = db
            .open_stream(&path!("/log"), &StreamType::text(), OpenMode::Append)
            .unwrap();
        w.write_bytes(b"two\n").unwrap();
        w.rollback();
        w.write_bytes(b"three\n").unwrap();
        w.close().unwrap();

        assert_eq!(
            db.read_bytes(&path!("/log"), &StreamType::text()).unwrap(),
            Bytes::from_static(b"one\nthree\n")
        );
    }

    #[test]
    fn write_handles_start_clean_and_truncate_on_commit() {
        let db = db();
        db.create(&path!("/log"), &StreamType::text(), CreateOptions::default())
            .unwrap();
        db.write_bytes(&path!("/log"), &StreamType::text(), b"kept")
            .unwrap();

        // Dropped untouched: nothing was written, nothing is discarded.
        let untouched = db.open_for_writing(&path!("/log"), &StreamType::text()).unwrap();
        assert!(!untouched.has_uncommitted_writes());
        drop(untouched);
        assert_eq!(
            db.read_bytes(&path!("/log"), &StreamType::text()).unwrap(),
            Bytes::from_static(b"kept")
        );

        let mut writer = db.open_for_writing(&path!("/log"), &StreamType::text()).unwrap();
        writer.write_bytes(b"new").unwrap();
        assert!(writer.has_uncommitted_writes());
        writer.commit().unwrap();
        assert!(!writer.has_uncommitted_writes());
        drop(writer);
        assert_eq!(
            db.read_bytes(&path!("/log"), &StreamType::text()).unwrap(),
            Bytes::from_static(b"new")
        );

        // Closing a write-mode handle without writing still truncates.
        db.open_for_writing(&path!("/log"), &StreamType::text())
            .unwrap()
            .close()
            .unwrap();
        assert!(db
            .read_bytes(&path!("/log"), &StreamType::text())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_with_open_stream_needs_force() {
        let db = db();
        db.create(&path!("/a/b"), &config(), CreateOptions::default())
            .unwrap();
        let mut handle = db.open_for_writing(&path!("/a/b"), &config()).unwrap();

        assert!(matches!(
            db.delete(&path!("/a"), false),
            Err(Error::ResourceBusy { .. })
        ));
        assert!(db.exists(&path!("/a/b")).unwrap());

        db.delete(&path!("/a"), true).unwrap();
        assert!(!handle.is_open());
        assert!(matches!(
            handle.write_bytes(b"late"),
            Err(Error::StreamClosed)
        ));
        assert!(matches!(handle.commit(), Err(Error::StreamClosed)));
    }

    #[test]
    fn rename_with_open_stream_is_busy() {
        let db = db();
        db.create(&path!("/a/b"), &config(), CreateOptions::default())
            .unwrap();
        let _h = db
            .open_stream(&path!("/a/b"), &config(), OpenMode::Read)
            .unwrap();
        assert!(matches!(
            db.rename(&path!("/a"), &path!("/z")),
            Err(Error::ResourceBusy { .. })
        ));
    }

    #[test]
    fn remove_open_stream_is_busy() {
        let db = db();
        db.create(&path!("/n"), &config(), CreateOptions::default())
            .unwrap();
        let h = db.open_for_writing(&path!("/n"), &config()).unwrap();
        assert!(matches!(
            db.remove_stream(&path!("/n"), &config(), false),
            Err(Error::ResourceBusy { .. })
        ));
        drop(h);
        assert!(db.remove_stream(&path!("/n"), &config(), false).unwrap());
        assert!(!db.has_stream(&path!("/n"), &config()).unwrap());
    }

    #[test]
    fn create_new_never_merges() {
        let db = db();
        db.create_node(&path!("/n"), CreateOptions::default()).unwrap();
        assert!(matches!(
            db.create_new(&path!("/n"), Some(&config()), CreateOptions::default()),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(db.stat(&path!("/n")).unwrap().streams.is_empty());
        db.create_new(&path!("/m"), Some(&config()), CreateOptions::default())
            .unwrap();
        assert!(db.has_stream(&path!("/m"), &config()).unwrap());
    }

    #[test]
    fn racing_create_new_has_one_winner() {
        let db = db();
        let winners = std::thread::scope(|scope| {
            let racers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        db.create_new(&path!("/race"), Some(&config()), CreateOptions::default())
                    })
                })
                .collect();
            racers
                .into_iter()
                .map(|racer| racer.join().unwrap())
                .filter(|outcome| match outcome {
                    Ok(_) => true,
                    Err(Error::AlreadyExists { .. }) => false,
                    Err(e) => panic!("unexpected {:?}", e),
                })
                .count()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn forced_stream_removal_closes_its_handles() {
        let db = db();
        db.create(&path!("/n"), &config(), CreateOptions::default())
            .unwrap();
        db.add_stream(&path!("/n"), &StreamType::text(), StreamOptions::default())
            .unwrap();
        let mut writer = db.open_for_writing(&path!("/n"), &config()).unwrap();
        let mut reader = db
            .open_stream(&path!("/n"), &StreamType::text(), OpenMode::Read)
            .unwrap();

        assert!(db.remove_stream(&path!("/n"), &config(), true).unwrap());
        assert!(!db.has_stream(&path!("/n"), &config()).unwrap());
        assert!(!writer.is_open());
        assert!(matches!(
            writer.write_bytes(b"late"),
            Err(Error::StreamClosed)
        ));
        assert!(matches!(writer.commit(), Err(Error::StreamClosed)));

        // Handles on the node's other streams are untouched.
        assert!(reader.is_open());
        reader.read_to_end().unwrap();

        // The stream is free again once removed.
        db.add_stream(&path!("/n"), &config(), StreamOptions::default())
            .unwrap();
        db.open_for_writing(&path!("/n"), &config()).unwrap();
    }

    #[test]
    fn derived_stream_lookup_goes_through_registry() {
        let db = db();
        db.create(
            &path!("/settings"),
            &StreamType::text(),
            CreateOptions::default().allow_derived(),
        )
        .unwrap();
        db.write_bytes(&path!("/settings"), &StreamType::config(), b"k=v")
            .unwrap();

        assert!(db.has_stream(&path!("/settings"), &StreamType::config()).unwrap());
        assert_eq!(
            db.resolve_stream(&path!("/settings"), &StreamType::config())
                .unwrap(),
            StreamType::text()
        );
        assert_eq!(
            db.read_bytes(&path!("/settings"), &StreamType::text()).unwrap(),
            Bytes::from_static(b"k=v")
        );
        // Binary is a supertype, not a subtype, of Text.
        assert!(!db.has_stream(&path!("/settings"), &StreamType::binary()).unwrap());
    }

    #[test]
    fn close_invalidates_handles() {
        let db = db();
        db.create(&path!("/n"), &config(), CreateOptions::default())
            .unwrap();
        let handle = db
            .open_stream(&path!("/n"), &config(), OpenMode::Read)
            .unwrap();

        db.close().unwrap();
        assert!(matches!(handle.contents(), Err(Error::StreamClosed)));
        assert!(matches!(
            db.stat(&path!("/n")),
            Err(Error::DatabaseClosed { .. })
        ));
        db.close().unwrap();
    }

    #[test]
    fn concurrent_readers_never_see_half_renamed_tree() {
        let db = db();
        for p in ["/src/a", "/src/b", "/src/c"] {
            db.create(&path!(p), &config(), CreateOptions::default())
                .unwrap();
        }
        db.create_node(&path!("/dst"), CreateOptions::default())
            .unwrap();

        let reader = {
            let db = db.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let under_src = ["/src/a", "/src/b", "/src/c"]
                        .iter()
                        .filter(|p| db.exists(&path!(*p)).unwrap())
                        .count();
                    assert!(under_src == 0 || under_src == 3 || db.exists(&path!("/dst/moved")).unwrap());
                }
            })
        };
        db.rename(&path!("/src"), &path!("/dst/moved")).unwrap();
        reader.join().unwrap();

        assert_eq!(db.stat(&path!("/dst/moved")).unwrap().kind, NodeKind::Directory);
        assert_eq!(db.list(&path!("/dst/moved")).unwrap().len(), 3);
    }
}
