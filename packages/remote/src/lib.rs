//! Remote databases for mountdb.
//!
//! A [`Server`] exposes local databases under endpoint names. A
//! [`RemoteDriver`] is an ordinary [`Driver`](mountdb_core::Driver) whose
//! operations are request/response messages (see [`protocol`]) sent over a
//! [`Connection`], so a remote database mounts like any other. Over HTTP,
//! [`serve`] answers the requests an [`HttpConnection`] sends.
//!
//! # Example
//!
//! ```rust
//! use mountdb_core::{path, CreateOptions, Database, NodeTree, StreamType};
//! use mountdb_remote::{ChannelConnection, RemoteDriver, Server};
//!
//! let exported = Database::with_driver(NodeTree::new());
//! let server = Server::new();
//! server.register("config", exported.clone())?;
//!
//! let remote = Database::with_driver(RemoteDriver::new(ChannelConnection::open(&server, "config")));
//! remote.create(&path!("/app"), &StreamType::text(), CreateOptions::default())?;
//! remote.write_bytes(&path!("/app"), &StreamType::text(), b"hello")?;
//!
//! assert_eq!(&exported.read_bytes(&path!("/app"), &StreamType::text())?[..], b"hello");
//! # Ok::<(), mountdb_core::Error>(())
//! ```
//!
//! # Retries
//!
//! The proxy never retries on its own. With a [`RetryPolicy`] it repeats
//! calls after `Disconnected` or `Timeout`, but only for operations that
//! [`Op::is_idempotent`](protocol::Op::is_idempotent) allows.

pub mod connection;
pub mod http_server;
pub mod protocol;
mod proxy;
mod server;

pub use connection::{CancelToken, ChannelConnection, Connection, HttpConnection, TransportError};
pub use proxy::{
    CancelHandle, ConnectionState, RemoteConfig, RemoteDriver, RemoteNodeRef, RetryPolicy,
};
pub use http_server::{serve, HttpServerError};
pub use server::{Server, ServerOptions};
