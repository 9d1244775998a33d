//! HTTP listener for a [`Server`].
//!
//! Each endpoint answers `POST /<endpoint>/rpc` with a JSON [`Request`] body,
//! so an [`HttpConnection`](crate::HttpConnection) built from
//! `http://<listen addr>/<endpoint>` reaches the database registered under
//! that name.
//!
//! [`Request`]: crate::protocol::Request

use std::future::Future;

use axum::extract::{DefaultBodyLimit, Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::Server;

/// Largest request body accepted, which bounds a single stream write.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}

/// Routes for every endpoint registered on `server`, now or later.
pub fn router(server: Server) -> Router {
    Router::new()
        .route("/:endpoint/rpc", post(rpc))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(server)
        .layer(TraceLayer::new_for_http())
}

async fn rpc(
    State(server): State<Server>,
    UrlPath(endpoint): UrlPath<String>,
    body: String,
) -> Response {
    // Database calls block on driver locks and host I/O.
    let served = tokio::task::spawn_blocking(move || server.handle_json(&endpoint, &body)).await;
    match served {
        Ok(Ok(reply)) => ([(header::CONTENT_TYPE, "application/json")], reply).into_response(),
        Ok(Err(e)) => (StatusCode::BAD_REQUEST, format!("malformed request: {}", e)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "request handler panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve `server` on `listener` until `shutdown` resolves.
pub async fn serve(
    server: Server,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), HttpServerError> {
    tracing::info!(addr = ?listener.local_addr()?, endpoints = ?server.endpoints().unwrap_or_default(), "HTTP server listening");
    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("HTTP server stopped");
    Ok(())
}
