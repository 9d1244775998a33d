//! The client side: a [`Driver`] whose every operation is a remote call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use mountdb_core::{
    Driver, Error, NodeInfo, NodeSpec, Path, Result, StreamOptions, StreamType,
};

use crate::connection::{CancelToken, Connection, HttpConnection, TransportError};
use crate::protocol::{Body, Op, Request, Response, Status};

/// Lifecycle of the link between a proxy and its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The server broke the protocol; calls fail until `connect()`.
    Faulted,
}

/// Caller opt-in retry of idempotent operations after transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// One attempt; transient errors go straight back to the caller.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn attempts(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff_ms: backoff.as_millis() as u64,
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Where a remote mount points and how calls to it behave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub endpoint: String,
    /// Path inside the served database that the proxy's root maps to.
    #[serde(default)]
    pub root: Path,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            root: Path::root(),
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::none(),
        }
    }
}

/// A node on another server: never owns it, only names it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteNodeRef {
    pub endpoint: String,
    pub path: Path,
}

impl std::fmt::Display for RemoteNodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.endpoint, self.path)
    }
}

/// Aborts the calls a proxy has in flight.
///
/// Cancelling affects exactly the calls waiting at that moment; calls made
/// afterwards run normally.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    current: Arc<Mutex<CancelToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.cancel();
        *current = CancelToken::new();
    }

    fn token(&self) -> CancelToken {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
struct Link {
    state: ConnectionState,
    fault: Option<String>,
}

/// Driver forwarding every node operation to a database exposed by a
/// [`Server`](crate::Server).
///
/// Paths are translated between the proxy's root and `root` on the server,
/// so the remote subtree looks like any local database. The connection is
/// opened lazily by the first call.
pub struct RemoteDriver {
    connection: Box<dyn Connection>,
    root: Path,
    timeout: Duration,
    retry: RetryPolicy,
    link: Mutex<Link>,
    next_id: AtomicU64,
    cancel: CancelHandle,
}

impl std::fmt::Debug for RemoteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDriver")
            .field("endpoint", &self.connection.endpoint())
            .field("root", &self.root)
            .field("state", &self.state())
            .finish()
    }
}

impl RemoteDriver {
    pub fn new(connection: impl Connection + 'static) -> Self {
        Self {
            connection: Box::new(connection),
            root: Path::root(),
            timeout: Duration::from_millis(default_timeout_ms()),
            retry: RetryPolicy::none(),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                fault: None,
            }),
            next_id: AtomicU64::new(1),
            cancel: CancelHandle::default(),
        }
    }

    pub fn from_config(config: &RemoteConfig, connection: impl Connection + 'static) -> Self {
        Self::new(connection)
            .with_root(config.root.clone())
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_retry(config.retry)
    }

    /// A proxy speaking HTTP to `config.endpoint`.
    pub fn http(config: &RemoteConfig) -> Result<Self> {
        let connection = HttpConnection::new(&config.endpoint)
            .map_err(|e| e.into_error(&config.endpoint, "connect"))?;
        Ok(Self::from_config(config, connection))
    }

    #[must_use]
    pub fn with_root(mut self, root: Path) -> Self {
        self.root = root;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        self.connection.endpoint()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    /// A handle that can abort this proxy's in-flight calls from another
    /// thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Reference to the remote node behind a proxy-relative path.
    pub fn node_ref(&self, path: &Path) -> RemoteNodeRef {
        RemoteNodeRef {
            endpoint: self.endpoint().to_string(),
            path: self.root.join(path),
        }
    }

    /// Handshake with the server, clearing any earlier fault.
    pub fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        self.exchange(&Path::root(), &Op::Ping).map(|_| ())
    }

    pub fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut link = self.link();
        if link.state != state {
            tracing::debug!(endpoint = %self.endpoint(), from = ?link.state, to = ?state, "remote state");
        }
        link.state = state;
        if state != ConnectionState::Faulted {
            link.fault = None;
        }
    }

    fn fault(&self, message: String) -> Error {
        tracing::warn!(endpoint = %self.endpoint(), %message, "remote protocol violation");
        let mut link = self.link();
        link.state = ConnectionState::Faulted;
        link.fault = Some(message.clone());
        Error::Faulted {
            mount: Path::root(),
            message,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        let (state, fault) = {
            let link = self.link();
            (link.state, link.fault.clone())
        };
        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Faulted => Err(Error::Faulted {
                mount: Path::root(),
                message: fault.unwrap_or_else(|| "protocol violation".to_string()),
            }),
            ConnectionState::Disconnected | ConnectionState::Connecting => self.connect(),
        }
    }

    /// Issue `op` on `path`, retrying only where the policy and the
    /// operation both allow it.
    fn call(&self, path: &Path, op: Op) -> Result<Body> {
        self.ensure_connected()?;
        let attempts = if op.is_idempotent() {
            self.retry.max_attempts.max(1)
        } else {
            1
        };
        let mut attempt = 1;
        loop {
            match self.exchange(path, &op) {
                Err(e) if attempt < attempts && e.is_transient() && !matches!(e, Error::Cancelled) => {
                    tracing::debug!(endpoint = %self.endpoint(), op = op.code(), attempt, error = %e, "retrying");
                    attempt += 1;
                    if self.retry.backoff_ms > 0 {
                        thread::sleep(Duration::from_millis(self.retry.backoff_ms));
                    }
                }
                result => return result,
            }
        }
    }

    /// One request/response round trip.
    fn exchange(&self, path: &Path, op: &Op) -> Result<Body> {
        let request = Request {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            path: self.root.join(path),
            op: op.clone(),
        };
        tracing::debug!(endpoint = %self.endpoint(), id = request.id, op = op.code(), path = %request.path, "remote request");

        let token = self.cancel.token();
        match self.connection.call(&request, self.timeout, &token) {
            Ok(response) => self.accept(request.id, response),
            Err(TransportError::Codec(e)) => Err(self.fault(format!("undecodable response: {}", e))),
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e.into_error(self.endpoint(), op.code()))
            }
        }
    }

    fn accept(&self, id: u64, response: Response) -> Result<Body> {
        if response.id != id {
            return Err(self.fault(format!(
                "response id {} does not match request {}",
                response.id, id
            )));
        }
        self.set_state(ConnectionState::Connected);
        match (response.status, response.body, response.error) {
            (Status::Ok, Some(body), _) => Ok(body),
            (Status::Ok, None, _) => Err(self.fault("success without a body".to_string())),
            (_, _, Some(error)) => Err(error.into_error(|p| self.local_path(p))),
            (status, _, None) => Err(self.fault(format!("{:?} without an error descriptor", status))),
        }
    }

    fn local_path(&self, remote: Path) -> Path {
        remote.strip_prefix(&self.root).unwrap_or(remote)
    }

    fn unexpected(&self, op: &str, body: Body) -> Error {
        self.fault(format!("unexpected {:?} reply to {}", body, op))
    }

    fn expect_unit(&self, op: &str, body: Body) -> Result<()> {
        match body {
            Body::Unit => Ok(()),
            other => Err(self.unexpected(op, other)),
        }
    }

    fn capacity(&self) -> Result<(Option<u64>, Option<u64>)> {
        match self.call(&Path::root(), Op::Capacity)? {
            Body::Capacity { free, total } => Ok((free, total)),
            other => Err(self.unexpected("capacity", other)),
        }
    }
}

impl Driver for RemoteDriver {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn stat(&self, path: &Path) -> Result<NodeInfo> {
        match self.call(path, Op::Stat)? {
            Body::Node { mut info } => {
                info.path = self.local_path(info.path);
                Ok(info)
            }
            other => Err(self.unexpected("stat", other)),
        }
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        match self.call(path, Op::List)? {
            Body::Names { names } => Ok(names),
            other => Err(self.unexpected("list", other)),
        }
    }

    fn create(&mut self, path: &Path, spec: &NodeSpec) -> Result<()> {
        let (stream_type, options) = split_stream(spec);
        let body = self.call(
            path,
            Op::Create {
                kind: spec.kind,
                stream_type,
                options,
                implicit_parents: spec.implicit_parents,
            },
        )?;
        self.expect_unit("create", body)
    }

    fn create_unique(&mut self, parent: &Path, prefix: &str, spec: &NodeSpec) -> Result<Path> {
        let (stream_type, options) = split_stream(spec);
        let body = self.call(
            parent,
            Op::CreateUnique {
                prefix: prefix.to_string(),
                kind: spec.kind,
                stream_type,
                options,
                implicit_parents: spec.implicit_parents,
            },
        )?;
        match body {
            Body::Path { path } => Ok(self.local_path(path)),
            other => Err(self.unexpected("create_unique", other)),
        }
    }

    fn delete(&mut self, path: &Path) -> Result<()> {
        let body = self.call(path, Op::Delete)?;
        self.expect_unit("delete", body)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        let to = self.root.join(to);
        let body = self.call(from, Op::Rename { to })?;
        self.expect_unit("rename", body)
    }

    fn add_stream(
        &mut self,
        path: &Path,
        stream_type: &StreamType,
        options: StreamOptions,
    ) -> Result<()> {
        let body = self.call(
            path,
            Op::AddStream {
                stream_type: stream_type.clone(),
                options,
            },
        )?;
        self.expect_unit("add_stream", body)
    }

    fn remove_stream(&mut self, path: &Path, stream_type: &StreamType) -> Result<bool> {
        let op = Op::RemoveStream {
            stream_type: stream_type.clone(),
        };
        match self.call(path, op)? {
            Body::Flag { value } => Ok(value),
            other => Err(self.unexpected("remove_stream", other)),
        }
    }

    fn read_stream(&self, path: &Path, stream_type: &StreamType) -> Result<Bytes> {
        let op = Op::ReadStream {
            stream_type: stream_type.clone(),
        };
        match self.call(path, op)? {
            Body::Bytes { data } => Ok(data),
            other => Err(self.unexpected("read_stream", other)),
        }
    }

    fn write_stream(&mut self, path: &Path, stream_type: &StreamType, data: Bytes) -> Result<()> {
        let op = Op::WriteStream {
            stream_type: stream_type.clone(),
            data,
        };
        let body = self.call(path, op)?;
        self.expect_unit("write_stream", body)
    }

    fn free_space(&self) -> Option<u64> {
        match self.capacity() {
            Ok((free, _)) => free,
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint(), error = %e, "capacity unavailable");
                None
            }
        }
    }

    fn device_storage(&self) -> Option<u64> {
        match self.capacity() {
            Ok((_, total)) => total,
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint(), error = %e, "capacity unavailable");
                None
            }
        }
    }

    /// Only a proxy rooted at the served database's root can snapshot it.
    fn snapshot(&self) -> Result<Bytes> {
        if !self.root.is_root() {
            return Err(Error::not_supported(format!(
                "snapshot of remote subtree {}",
                self.root
            )));
        }
        match self.call(&Path::root(), Op::Snapshot)? {
            Body::Bytes { data } => Ok(data),
            other => Err(self.unexpected("snapshot", other)),
        }
    }
}

fn split_stream(spec: &NodeSpec) -> (Option<StreamType>, StreamOptions) {
    match &spec.stream {
        Some((stream_type, options)) => (Some(stream_type.clone()), *options),
        None => (None, StreamOptions::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;
    use crate::server::Server;
    use mountdb_core::{path, CreateOptions, Database, DatabaseManager, NodeTree};
    use std::sync::atomic::AtomicUsize;

    fn served() -> (Server, Database) {
        let db = Database::with_driver(NodeTree::new());
        db.create(&path!("/export/etc/app"), &StreamType::config(), CreateOptions::default())
            .unwrap();
        db.write_bytes(&path!("/export/etc/app"), &StreamType::config(), b"x=1")
            .unwrap();
        let server = Server::new();
        server.register("db", db.clone()).unwrap();
        (server, db)
    }

    #[test]
    fn connects_lazily() {
        let (server, _) = served();
        let proxy = RemoteDriver::new(ChannelConnection::open(&server, "db"));
        assert_eq!(proxy.state(), ConnectionState::Disconnected);
        assert!(proxy.stat(&path!("/export")).is_ok());
        assert_eq!(proxy.state(), ConnectionState::Connected);
    }

    #[test]
    fn paths_are_relative_to_root() {
        let (server, _) = served();
        let proxy =
            RemoteDriver::new(ChannelConnection::open(&server, "db")).with_root(path!("/export"));

        let info = proxy.stat(&path!("/etc/app")).unwrap();
        assert_eq!(info.path, path!("/etc/app"));
        assert_eq!(
            &proxy.read_stream(&path!("/etc/app"), &StreamType::config()).unwrap()[..],
            b"x=1"
        );

        match proxy.stat(&path!("/missing")) {
            Err(Error::NotFound { path }) => assert_eq!(path, path!("/missing")),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            proxy.node_ref(&path!("/etc")),
            RemoteNodeRef {
                endpoint: "db".into(),
                path: path!("/export/etc"),
            }
        );
    }

    #[test]
    fn create_unique_returns_local_path() {
        let (server, db) = served();
        let mut proxy =
            RemoteDriver::new(ChannelConnection::open(&server, "db")).with_root(path!("/export"));
        let spec = CreateOptions::default().spec(Some(&StreamType::text()));
        let created = proxy.create_unique(&path!("/etc"), "job", &spec).unwrap();
        assert_eq!(created.parent(), Some(path!("/etc")));
        assert!(created.name().unwrap().starts_with("job-"));
        assert!(db.exists(&path!("/export").join(&created)).unwrap());
    }

    #[test]
    fn severed_connection_disconnects() {
        let (server, _) = served();
        let connection = Arc::new(ChannelConnection::open(&server, "db"));
        let proxy = RemoteDriver::new(Shared(Arc::clone(&connection)));
        proxy.connect().unwrap();

        connection.sever();
        assert!(matches!(
            proxy.list(&path!("/")),
            Err(Error::Disconnected { .. })
        ));
        assert_eq!(proxy.state(), ConnectionState::Disconnected);
    }

    /// Shares one connection between the test and the proxy.
    struct Shared<C>(Arc<C>);

    impl<C: Connection> Connection for Shared<C> {
        fn endpoint(&self) -> &str {
            self.0.endpoint()
        }

        fn call(
            &self,
            request: &Request,
            timeout: Duration,
            cancel: &CancelToken,
        ) -> std::result::Result<Response, TransportError> {
            self.0.call(request, timeout, cancel)
        }
    }

    /// Answers every request with a response for another id.
    struct Confused;

    impl Connection for Confused {
        fn endpoint(&self) -> &str {
            "confused"
        }

        fn call(
            &self,
            request: &Request,
            _: Duration,
            _: &CancelToken,
        ) -> std::result::Result<Response, TransportError> {
            Ok(Response::ok(request.id + 100, Body::Unit))
        }
    }

    #[test]
    fn mismatched_id_faults() {
        let proxy = RemoteDriver::new(Confused);
        assert!(matches!(proxy.connect(), Err(Error::Faulted { .. })));
        assert_eq!(proxy.state(), ConnectionState::Faulted);
        assert!(matches!(
            proxy.stat(&path!("/")),
            Err(Error::Faulted { .. })
        ));
    }

    #[test]
    fn faults_name_the_mount_point() {
        let manager = DatabaseManager::default();
        manager
            .mount(&path!("/"), manager.new_database("root", NodeTree::new()))
            .unwrap();
        manager
            .mount(
                &path!("/Volumes/Net"),
                manager.new_database("net", RemoteDriver::new(Confused)),
            )
            .unwrap();

        match manager.list(&path!("/Volumes/Net/x")) {
            Err(Error::Faulted { mount, .. }) => assert_eq!(mount, path!("/Volumes/Net")),
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Fails the first `failures` calls with a closed transport.
    struct Flaky<C> {
        inner: C,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl<C: Connection> Connection for Flaky<C> {
        fn endpoint(&self) -> &str {
            self.inner.endpoint()
        }

        fn call(
            &self,
            request: &Request,
            timeout: Duration,
            cancel: &CancelToken,
        ) -> std::result::Result<Response, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::Closed);
            }
            self.inner.call(request, timeout, cancel)
        }
    }

    #[test]
    fn retries_are_opt_in() {
        let (server, _) = served();
        let flaky = Arc::new(Flaky {
            inner: ChannelConnection::open(&server, "db"),
            failures: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
        });
        let proxy = RemoteDriver::new(Shared(Arc::clone(&flaky)));
        assert!(matches!(
            proxy.stat(&path!("/")),
            Err(Error::Disconnected { .. })
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_covers_idempotent_operations_only() {
        let (server, db) = served();
        let flaky = Arc::new(Flaky {
            inner: ChannelConnection::open(&server, "db"),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let mut proxy = RemoteDriver::new(Shared(Arc::clone(&flaky)))
            .with_retry(RetryPolicy::attempts(3, Duration::ZERO));
        proxy.connect().unwrap();

        flaky.failures.store(2, Ordering::SeqCst);
        assert_eq!(proxy.list(&path!("/export")).unwrap(), vec!["etc"]);

        flaky.failures.store(1, Ordering::SeqCst);
        let before = flaky.calls.load(Ordering::SeqCst);
        let spec = CreateOptions::default().spec(None);
        assert!(matches!(
            proxy.create_unique(&path!("/export"), "n", &spec),
            Err(Error::Disconnected { .. })
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), before + 1);
        assert_eq!(db.list(&path!("/export")).unwrap(), vec!["etc"]);
    }

    #[test]
    fn timeout_leaves_proxy_disconnected() {
        let (server, _) = served();
        let proxy = RemoteDriver::new(ChannelConnection::with_latency(
            &server,
            "db",
            Duration::from_millis(200),
        ))
        .with_timeout(Duration::from_millis(20));
        assert!(matches!(
            proxy.stat(&path!("/")),
            Err(Error::Timeout { .. })
        ));
        assert_eq!(proxy.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn cancel_aborts_in_flight_call() {
        let (server, _) = served();
        let proxy = Arc::new(RemoteDriver::new(ChannelConnection::with_latency(
            &server,
            "db",
            Duration::from_millis(50),
        )));
        proxy.connect().unwrap();

        let slow = Arc::new(RemoteDriver::new(ChannelConnection::with_latency(
            &server,
            "db",
            Duration::from_secs(2),
        )));
        let cancel = slow.cancel_handle();
        let caller = {
            let slow = Arc::clone(&slow);
            thread::spawn(move || slow.stat(&path!("/export")))
        };
        thread::sleep(Duration::from_millis(150));
        cancel.cancel();

        assert!(matches!(caller.join().unwrap(), Err(Error::Cancelled)));
        assert_eq!(slow.state(), ConnectionState::Disconnected);
        // Other proxies are unaffected.
        assert!(proxy.stat(&path!("/export")).is_ok());
    }
}
