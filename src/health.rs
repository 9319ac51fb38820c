//! Liveness, readiness, and status HTTP surface
//!
//! `GET /health` always answers 200 while the process lives;
//! `GET /ready` aggregates registered checks and fails with the names
//! of whatever is failing; `GET /status` exposes uptime, breaker
//! states, and each component's stats snapshot. Runs as a daemon task
//! that never keeps the process alive past shutdown.

use crate::breaker::BreakerRegistry;
use crate::correlation;
use crate::error::Result;
use crate::shutdown::ShutdownCoordinator;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

type Check = Box<dyn Fn() -> bool + Send + Sync>;
type StatsProvider = Box<dyn Fn() -> Value + Send + Sync>;

/// Shared state behind the health routes.
pub struct HealthState {
    started_at: Instant,
    breakers: Arc<BreakerRegistry>,
    checks: Vec<(String, Check)>,
    stats: Vec<(String, StatsProvider)>,
}

/// Builder for the health surface.
pub struct HealthServer {
    state: HealthState,
}

impl HealthServer {
    #[must_use]
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            state: HealthState {
                started_at: Instant::now(),
                breakers,
                checks: Vec::new(),
                stats: Vec::new(),
            },
        }
    }

    /// Register a readiness check; all must pass for `/ready` = 200.
    #[must_use]
    pub fn check(
        mut self,
        name: &str,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.state.checks.push((name.to_string(), Box::new(check)));
        self
    }

    /// Register a component stats snapshot for `/status`.
    #[must_use]
    pub fn stats(
        mut self,
        name: &str,
        provider: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.state
            .stats
            .push((name.to_string(), Box::new(provider)));
        self
    }

    /// Serve until shutdown.
    pub async fn serve(self, port: u16, shutdown: Arc<ShutdownCoordinator>) -> Result<()> {
        let state = Arc::new(self.state);
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/status", get(status_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "health endpoint listening");

        let wait = async move { shutdown.wait().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(wait)
            .await
        {
            warn!("health server exited: {e}");
        }
        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn ready_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    let failing: Vec<&str> = state
        .checks
        .iter()
        .filter(|(_, check)| !check())
        .map(|(name, _)| name.as_str())
        .collect();

    if failing.is_empty() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unready", "failing": failing })),
        )
    }
}

async fn status_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    let breakers: Value = state
        .breakers
        .snapshot()
        .into_iter()
        .map(|(name, breaker_state)| (name, Value::from(breaker_state.as_str())))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let components: Value = state
        .stats
        .iter()
        .map(|(name, provider)| (name.clone(), provider()))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "circuit_breakers": breakers,
        "components": components,
        "correlation_ids_issued": correlation::issued(),
    }))
}
