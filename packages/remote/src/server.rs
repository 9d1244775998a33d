//! Server side: databases exposed under endpoint names.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use mountdb_core::{CreateOptions, Database, Error, Path, Result};

use crate::protocol::{Body, Op, Request, Response};

/// Per-endpoint serving options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Reject every mutating operation with `PermissionDenied`.
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone)]
struct Exposed {
    database: Database,
    options: ServerOptions,
}

/// Registry of exposed databases, one per endpoint, and the request
/// dispatcher serving them.
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct Server {
    endpoints: Arc<RwLock<BTreeMap<String, Exposed>>>,
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::internal("server registry lock poisoned")
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `database` under `endpoint`.
    pub fn register(&self, endpoint: impl Into<String>, database: Database) -> Result<()> {
        self.register_with(endpoint, database, ServerOptions::default())
    }

    pub fn register_with(
        &self,
        endpoint: impl Into<String>,
        database: Database,
        options: ServerOptions,
    ) -> Result<()> {
        let endpoint = endpoint.into();
        let mut endpoints = self.endpoints.write().map_err(poisoned)?;
        if endpoints.contains_key(&endpoint) {
            return Err(Error::EndpointInUse { endpoint });
        }
        tracing::info!(%endpoint, database = %database.name(), read_only = options.read_only, "registered endpoint");
        endpoints.insert(endpoint, Exposed { database, options });
        Ok(())
    }

    /// Stop serving `endpoint`, returning the database it exposed.
    pub fn unregister(&self, endpoint: &str) -> Result<Option<Database>> {
        let removed = self.endpoints.write().map_err(poisoned)?.remove(endpoint);
        if removed.is_some() {
            tracing::info!(%endpoint, "unregistered endpoint");
        }
        Ok(removed.map(|exposed| exposed.database))
    }

    pub fn endpoints(&self) -> Result<Vec<String>> {
        Ok(self.endpoints.read().map_err(poisoned)?.keys().cloned().collect())
    }

    /// Serve one request addressed to `endpoint`.
    pub fn handle(&self, endpoint: &str, request: Request) -> Response {
        let exposed = match self.endpoints.read() {
            Ok(endpoints) => endpoints.get(endpoint).cloned(),
            Err(e) => return Response::error(request.id, &poisoned(e)),
        };
        let Some(exposed) = exposed else {
            return Response::error(
                request.id,
                &Error::Disconnected {
                    endpoint: endpoint.to_string(),
                },
            );
        };

        tracing::debug!(%endpoint, id = request.id, op = request.op.code(), path = %request.path, "serve");
        if exposed.options.read_only && request.op.is_mutation() {
            return Response::error(request.id, &Error::PermissionDenied { path: request.path });
        }
        match dispatch(&exposed.database, &request.path, request.op) {
            Ok(body) => Response::ok(request.id, body),
            Err(e) => {
                tracing::debug!(%endpoint, id = request.id, error = %e, "request failed");
                Response::error(request.id, &e)
            }
        }
    }

    /// Serve one JSON-encoded request and encode the response.
    pub fn handle_json(&self, endpoint: &str, body: &str) -> serde_json::Result<String> {
        let request: Request = serde_json::from_str(body)?;
        serde_json::to_string(&self.handle(endpoint, request))
    }
}

fn dispatch(db: &Database, path: &Path, op: Op) -> Result<Body> {
    Ok(match op {
        Op::Ping => {
            db.stat(path)?;
            Body::Unit
        }
        Op::Stat => Body::Node {
            info: db.stat(path)?,
        },
        Op::List => Body::Names {
            names: db.list(path)?,
        },
        Op::Create {
            kind,
            stream_type,
            options,
            implicit_parents,
        } => {
            // Driver-level create is strict: an existing node is a conflict
            // even when the stream type is new to it.
            let options = CreateOptions {
                kind,
                implicit_parents,
                stream: options,
            };
            db.create_new(path, stream_type.as_ref(), options)?;
            Body::Unit
        }
        Op::CreateUnique {
            prefix,
            kind,
            stream_type,
            options,
            implicit_parents,
        } => {
            let options = CreateOptions {
                kind,
                implicit_parents,
                stream: options,
            };
            Body::Path {
                path: db.create_unique(path, &prefix, stream_type.as_ref(), options)?,
            }
        }
        Op::Delete => {
            db.delete(path, false)?;
            Body::Unit
        }
        Op::Rename { to } => {
            db.rename(path, &to)?;
            Body::Unit
        }
        Op::AddStream {
            stream_type,
            options,
        } => {
            db.add_stream(path, &stream_type, options)?;
            Body::Unit
        }
        Op::RemoveStream { stream_type } => Body::Flag {
            value: db.remove_stream(path, &stream_type, false)?,
        },
        Op::ReadStream { stream_type } => Body::Bytes {
            data: db.read_bytes(path, &stream_type)?,
        },
        Op::WriteStream { stream_type, data } => {
            db.write_bytes(path, &stream_type, &data)?;
            Body::Unit
        }
        Op::Capacity => Body::Capacity {
            free: db.free_space()?,
            total: db.device_storage()?,
        },
        Op::Snapshot => Body::Bytes {
            data: db.snapshot()?,
        },
    })
}
