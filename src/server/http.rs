use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::connection::{ConnectionManager, ConnectionState};

#[derive(Serialize)]
struct HealthResponse {
  status: &'static str,
  store: ConnectionState,
}

#[derive(Serialize)]
struct ReadyResponse {
  ready: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  latency_ms: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
}

/// Health endpoints; no /api prefix so orchestrator probes can reach them directly
pub fn router(conn: Arc<ConnectionManager>) -> Router {
  Router::new()
    .route("/health", get(health_check))
    .route("/ready", get(readiness_check))
    .with_state(conn)
}

/// Liveness probe - the process is up; a store outage only degrades it
async fn health_check(State(conn): State<Arc<ConnectionManager>>) -> Json<HealthResponse> {
  let store = conn.state();
  let status = if store == ConnectionState::Ready {
    "ok"
  } else {
    "degraded"
  };
  Json(HealthResponse { status, store })
}

/// Readiness probe - 200 only when the store answers a ping
async fn readiness_check(
  State(conn): State<Arc<ConnectionManager>>,
) -> (StatusCode, Json<ReadyResponse>) {
  match conn.ping().await {
    Ok(latency) => (
      StatusCode::OK,
      Json(ReadyResponse {
        ready: true,
        latency_ms: Some(latency.as_secs_f64() * 1000.0),
        error: None,
      }),
    ),
    Err(e) => (
      StatusCode::SERVICE_UNAVAILABLE,
      Json(ReadyResponse {
        ready: false,
        latency_ms: None,
        error: Some(e.to_string()),
      }),
    ),
  }
}
