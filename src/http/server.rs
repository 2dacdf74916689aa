//! HTTP server hosting the admission filter.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{middleware, Json, Router};
use serde_json::json;
use tracing::{error, info};

use super::filter::admission_filter;
use crate::admission::Gatekeeper;
use crate::error::Result;

/// HTTP server with the admission filter mounted ahead of routing.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission filter instance
    gatekeeper: Arc<Gatekeeper>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { addr, gatekeeper }
    }

    /// Build the router: the admission layer wraps everything, and the
    /// fallback stands in for the routing/proxy stage the surrounding
    /// gateway provides.
    fn router(&self) -> Router {
        Router::new()
            .fallback(unrouted)
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self.gatekeeper),
                admission_filter,
            ))
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(
            addr = %self.addr,
            "Starting HTTP server for the admission filter"
        );

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

/// Placeholder for the downstream routing stage, which is outside this
/// service. Requests only reach it after passing admission.
async fn unrouted() -> impl IntoResponse {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": "no_upstream_route" })),
    )
}
