//! HTTP server wiring the admission middleware in front of the service routes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admission, identity_from_headers};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::PolicyRegistry;

/// HTTP server fronted by the admission pipeline.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Registry deciding every request
    registry: Arc<PolicyRegistry>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, registry: Arc<PolicyRegistry>) -> Self {
        Self { addr, registry }
    }

    /// Routes with identity and admission layers applied.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/api/status", get(status))
            .route("/api/auth/login", post(login))
            .with_state(Arc::clone(&self.registry))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self.registry),
                admission,
            ))
            .layer(middleware::from_fn(identity_from_headers))
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            policies = ?self.registry.policy_names(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Io(e)
        })
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(registry): State<Arc<PolicyRegistry>>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "mode": registry.mode(),
        "policies": registry.policy_names(),
        "trackedKeys": registry.record_count(),
    }))
}

/// Accepts any request carrying credentials. Failed attempts count against
/// the auth policy, successful ones are given back.
async fn login(headers: HeaderMap) -> impl IntoResponse {
    if headers.contains_key("authorization") {
        (StatusCode::OK, Json(json!({ "success": true })))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "message": "Invalid credentials" })),
        )
    }
}
