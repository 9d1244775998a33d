//! Transports carrying protocol messages to a server.
//!
//! A [`Connection`] performs one request/response exchange at a time per
//! call; it holds no per-session state, so any exchange may be repeated on
//! the same or a fresh connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use url::Url;

use mountdb_core::Error;

use crate::protocol::{Request, Response};
use crate::server::Server;

/// Interval at which a waiting call checks its cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP status {0}")]
    Status(http::StatusCode),

    /// The peer sent something that is not a protocol message.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl TransportError {
    /// The caller-facing error for a failed exchange of `operation`.
    pub fn into_error(self, endpoint: &str, operation: &str) -> Error {
        match self {
            TransportError::Timeout(_) => Error::Timeout {
                operation: format!("{} on {}", operation, endpoint),
            },
            TransportError::Http(e) if e.is_timeout() => Error::Timeout {
                operation: format!("{} on {}", operation, endpoint),
            },
            TransportError::Cancelled => Error::Cancelled,
            TransportError::Url(e) => Error::invalid_path(format!("endpoint {}: {}", endpoint, e)),
            TransportError::Codec(e) => Error::internal(format!("{}: {}", endpoint, e)),
            TransportError::Closed | TransportError::Http(_) | TransportError::Status(_) => {
                Error::Disconnected {
                    endpoint: endpoint.to_string(),
                }
            }
        }
    }
}

/// Cooperative cancellation flag shared between a caller and a waiting call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A channel to one server endpoint.
pub trait Connection: Send + Sync {
    /// Address of the endpoint, for diagnostics and node references.
    fn endpoint(&self) -> &str;

    /// Send `request` and wait for its response, at most `timeout`, giving up
    /// early once `cancel` is set.
    fn call(
        &self,
        request: &Request,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Response, TransportError>;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }

    fn call(
        &self,
        request: &Request,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Response, TransportError> {
        (**self).call(request, timeout, cancel)
    }
}

/// Wait on a reply channel until a result arrives, the deadline passes, or
/// the call is cancelled.
fn wait<T>(
    replies: &mpsc::Receiver<Result<T, TransportError>>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<T, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TransportError::Timeout(timeout));
        }
        match replies.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
        }
    }
}

type Job = (String, mpsc::Sender<Result<String, TransportError>>);

/// In-process connection to a [`Server`].
///
/// Requests are serialized to JSON and handed to a worker thread that owns
/// a handle to the server, so the full wire format is exercised without a
/// network.
pub struct ChannelConnection {
    endpoint: String,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
}

impl ChannelConnection {
    pub fn open(server: &Server, endpoint: impl Into<String>) -> Self {
        Self::with_latency(server, endpoint, Duration::ZERO)
    }

    /// Like [`open`](Self::open), with the worker sleeping `latency` before
    /// serving each request.
    pub fn with_latency(server: &Server, endpoint: impl Into<String>, latency: Duration) -> Self {
        let endpoint = endpoint.into();
        let (jobs, queue) = mpsc::channel::<Job>();
        let server = server.clone();
        let served = endpoint.clone();
        thread::spawn(move || {
            for (request, reply) in queue {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                let response = server
                    .handle_json(&served, &request)
                    .map_err(TransportError::from);
                // The caller may have stopped waiting.
                let _ = reply.send(response);
            }
        });
        Self {
            endpoint,
            jobs: Mutex::new(Some(jobs)),
        }
    }

    /// Drop the link to the worker; every later call fails with `Closed`.
    pub fn sever(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
    }
}

impl Connection for ChannelConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn call(
        &self,
        request: &Request,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Response, TransportError> {
        let body = serde_json::to_string(request)?;
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| TransportError::Closed)?
            .clone()
            .ok_or(TransportError::Closed)?;
        let (reply, replies) = mpsc::channel();
        jobs.send((body, reply))
            .map_err(|_| TransportError::Closed)?;
        let raw = wait(&replies, timeout, cancel)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Connection to a server reachable over HTTP: every request is a
/// `POST {endpoint}/rpc` carrying the JSON message.
pub struct HttpConnection {
    endpoint: String,
    url: Url,
    client: Client,
}

impl HttpConnection {
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        Self::with_client(Client::new(), endpoint)
    }

    /// Use a preconfigured reqwest client (proxies, TLS, default headers).
    pub fn with_client(client: Client, endpoint: &str) -> Result<Self, TransportError> {
        let mut base = Url::parse(endpoint)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            url: base.join("rpc")?,
            client,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn exchange(
        client: &Client,
        url: Url,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let response = client.post(url).timeout(timeout).json(request).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }
        let text = response.text()?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl Connection for HttpConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn call(
        &self,
        request: &Request,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Response, TransportError> {
        // The blocking client cannot be interrupted, so the exchange runs on
        // its own thread and the caller waits on the reply.
        let client = self.client.clone();
        let url = self.url.clone();
        let request = request.clone();
        let (reply, replies) = mpsc::channel();
        thread::spawn(move || {
            let _ = reply.send(Self::exchange(&client, url, &request, timeout));
        });
        wait(&replies, timeout, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Body, Op, Status};
    use mountdb_core::{path, Database, NodeTree};
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn served() -> Server {
        let server = Server::new();
        server
            .register("db", Database::with_driver(NodeTree::new()))
            .unwrap();
        server
    }

    fn ping(id: u64) -> Request {
        Request {
            id,
            path: path!("/"),
            op: Op::Ping,
        }
    }

    #[test]
    fn channel_round_trip() {
        let connection = ChannelConnection::open(&served(), "db");
        let response = connection
            .call(&ping(3), Duration::from_secs(5), &CancelToken::new())
            .unwrap();
        assert_eq!(response.id, 3);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.body, Some(Body::Unit));
    }

    #[test]
    fn severed_channel_is_closed() {
        let connection = ChannelConnection::open(&served(), "db");
        connection.sever();
        assert!(matches!(
            connection.call(&ping(1), Duration::from_secs(5), &CancelToken::new()),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn slow_channel_times_out() {
        let connection =
            ChannelConnection::with_latency(&served(), "db", Duration::from_millis(300));
        let started = Instant::now();
        let result = connection.call(&ping(1), Duration::from_millis(30), &CancelToken::new());
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn cancelled_before_reply() {
        let connection =
            ChannelConnection::with_latency(&served(), "db", Duration::from_millis(300));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            connection.call(&ping(1), Duration::from_secs(5), &cancel),
            Err(TransportError::Cancelled)
        ));
    }

    #[test]
    fn transport_errors_map_to_node_errors() {
        assert!(matches!(
            TransportError::Closed.into_error("db", "stat"),
            Error::Disconnected { .. }
        ));
        assert!(TransportError::Timeout(Duration::from_millis(1))
            .into_error("db", "stat")
            .is_transient());
        assert!(matches!(
            TransportError::Cancelled.into_error("db", "stat"),
            Error::Cancelled
        ));
    }

    #[test]
    fn http_endpoint_url() {
        let connection = HttpConnection::new("http://localhost:7000/api").unwrap();
        assert_eq!(connection.url().as_str(), "http://localhost:7000/api/rpc");
        let connection = HttpConnection::new("http://localhost:7000").unwrap();
        assert_eq!(connection.url().as_str(), "http://localhost:7000/rpc");
        assert!(matches!(
            HttpConnection::new("not a url"),
            Err(TransportError::Url(_))
        ));
    }

    #[tokio::test]
    async fn http_posts_to_rpc() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(url_path("/rpc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(Response::ok(9, Body::Flag { value: true })),
            )
            .mount(&mock)
            .await;

        let uri = mock.uri();
        let response = tokio::task::spawn_blocking(move || {
            let connection = HttpConnection::new(&uri).unwrap();
            connection.call(&ping(9), Duration::from_secs(5), &CancelToken::new())
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.body, Some(Body::Flag { value: true }));
    }

    #[tokio::test]
    async fn http_error_status_is_transport_failure() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(url_path("/rpc"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock)
            .await;

        let uri = mock.uri();
        let result = tokio::task::spawn_blocking(move || {
            let connection = HttpConnection::new(&uri).unwrap();
            connection.call(&ping(1), Duration::from_secs(5), &CancelToken::new())
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(TransportError::Status(s)) if s.as_u16() == 503));
    }

    #[tokio::test]
    async fn http_garbage_is_codec_error() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(url_path("/rpc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&mock)
            .await;

        let uri = mock.uri();
        let result = tokio::task::spawn_blocking(move || {
            let connection = HttpConnection::new(&uri).unwrap();
            connection.call(&ping(1), Duration::from_secs(5), &CancelToken::new())
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(TransportError::Codec(_))));
    }
}
