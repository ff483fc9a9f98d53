//! Health endpoint.
//!
//! - `GET /health` answers `{healthy, uptimeSec, connected, pluginCount}`
//!   with `200` when the session is connected and the store breaker is not
//!   open, `503` otherwise.
//! - `GET /plugins` lists `{name, version, enabled, executions, errors}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chorus_framework::{BreakerState, PluginRegistry};

use crate::error::{RuntimeError, RuntimeResult};

/// Shared state for the health routes.
#[derive(Clone)]
pub struct HealthState {
    registry: Arc<PluginRegistry>,
    started: Instant,
}

impl HealthState {
    /// Creates state reporting uptime from now.
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    healthy: bool,
    uptime_sec: u64,
    connected: bool,
    plugin_count: usize,
}

#[derive(Debug, Serialize)]
struct PluginRow {
    name: String,
    version: String,
    enabled: bool,
    executions: u64,
    errors: u64,
}

/// Builds the router.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/plugins", get(plugins))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let services = state.registry.services();
    let connected = services.gate.state().is_healthy();
    let healthy = connected && services.gateway.breaker_state() != BreakerState::Open;
    let body = HealthBody {
        healthy,
        uptime_sec: state.started.elapsed().as_secs(),
        connected,
        plugin_count: state.registry.snapshot().len(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn plugins(State(state): State<HealthState>) -> Json<Vec<PluginRow>> {
    let rows = state
        .registry
        .reports()
        .into_iter()
        .map(|r| PluginRow {
            name: r.name,
            version: r.version,
            enabled: r.enabled,
            executions: r.stats.executions,
            errors: r.stats.errors,
        })
        .collect();
    Json(rows)
}

/// Binds `addr` and serves until `cancel` fires.
///
/// Returns the bound address once listening.
pub async fn serve(
    addr: SocketAddr,
    state: HealthState,
    cancel: CancellationToken,
) -> RuntimeResult<SocketAddr> {
    let listener = TcpListener::bind(addr).await.map_err(RuntimeError::Health)?;
    let local = listener.local_addr().map_err(RuntimeError::Health)?;
    info!(addr = %local, "Health endpoint listening");

    tokio::spawn(async move {
        let result = axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Health endpoint failed");
        }
    });
    Ok(local)
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use chorus_core::{ChatClient, Jid, MemoryChatClient};
    use chorus_framework::{InlineSource, PluginCatalog, PluginFile};

    use super::*;
    use crate::testing::{ECHO, services_with_client};

    async fn state() -> HealthState {
        let client = Arc::new(MemoryChatClient::new(Jid::parse("2348000000000").unwrap()));
        client.connect().await.unwrap();
        let registry = Arc::new(PluginRegistry::new(
            PluginCatalog::new().with(&ECHO),
            Arc::new(InlineSource::new(vec![PluginFile::new("echo.toml", "echo")])),
            services_with_client(client),
        ));
        registry.load_all().await.unwrap();
        HealthState::new(registry)
    }

    async fn get_json(state: HealthState, uri: &str) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_connected_host() {
        let (status, body) = get_json(state().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["connected"], true);
        assert_eq!(body["pluginCount"], 1);
        assert!(body["uptimeSec"].is_u64());
    }

    #[tokio::test]
    async fn test_plugins_lists_counters() {
        let (status, body) = get_json(state().await, "/plugins").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "echo");
        assert_eq!(rows[0]["version"], "1.0.0");
        assert_eq!(rows[0]["enabled"], true);
        assert_eq!(rows[0]["executions"], 0);
    }

    #[tokio::test]
    async fn test_serve_binds_and_stops() {
        let cancel = CancellationToken::new();
        let addr = serve("127.0.0.1:0".parse().unwrap(), state().await, cancel.clone())
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        cancel.cancel();
    }
}
