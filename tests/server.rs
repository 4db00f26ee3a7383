//! Lifecycle coordinator tests - health endpoints, startup gating, ordered teardown
#![cfg(feature = "server")]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cachebus::server::{router, Daemon, ServiceConfig};
use cachebus::{ConnectionManager, ConnectionState, MemoryStore, StoreConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn get_json(conn: Arc<ConnectionManager>, uri: &str) -> (StatusCode, Value) {
  let response = router(conn)
    .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
    .await
    .unwrap();
  let status = response.status();
  let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap();
  (status, serde_json::from_slice(&bytes).unwrap())
}

fn offline_store() -> Arc<MemoryStore> {
  let store = Arc::new(MemoryStore::new());
  store.set_available(false);
  store
}

fn service_config(require_store: bool) -> ServiceConfig {
  let mut config = ServiceConfig::default();
  config.store = StoreConfig::memory();
  config.startup.ready_timeout_ms = 200;
  config.startup.require_store = require_store;
  config.shutdown.drain_timeout_ms = 500;
  config
}

// =============================================================================
// Health Endpoints
// =============================================================================

#[tokio::test]
async fn test_health_and_ready_when_store_up() {
  let conn = ConnectionManager::with_backend(StoreConfig::memory(), Arc::new(MemoryStore::new()));
  conn
    .wait_until_ready(Duration::from_secs(2))
    .await
    .unwrap();

  let (status, body) = get_json(conn.clone(), "/health").await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["status"], "ok");
  assert_eq!(body["store"], "ready");

  let (status, body) = get_json(conn, "/ready").await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["ready"], true);
  assert!(body["latency_ms"].is_number());
}

#[tokio::test]
async fn test_health_degraded_and_not_ready_when_store_down() {
  let conn = ConnectionManager::with_backend(StoreConfig::memory(), offline_store());

  let (status, body) = get_json(conn.clone(), "/health").await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["status"], "degraded");

  let (status, body) = get_json(conn, "/ready").await;
  assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
  assert_eq!(body["ready"], false);
  assert!(body["error"].is_string());
}

// =============================================================================
// Startup Gating
// =============================================================================

#[tokio::test]
async fn test_startup_runs_degraded_when_store_optional() {
  let conn = ConnectionManager::with_backend(StoreConfig::memory(), offline_store());
  let daemon = Daemon::with_connection(service_config(false), conn);
  tokio_test::assert_ok!(daemon.startup().await);
}

#[tokio::test]
async fn test_startup_fails_when_store_required() {
  let conn = ConnectionManager::with_backend(StoreConfig::memory(), offline_store());
  let daemon = Daemon::with_connection(service_config(true), conn);
  tokio_test::assert_err!(daemon.startup().await);
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_teardown_unsubscribes_then_disconnects() {
  let store = Arc::new(MemoryStore::new());
  let conn = ConnectionManager::with_backend(StoreConfig::memory(), store.clone());
  let daemon = Daemon::with_connection(service_config(true), conn);
  daemon.startup().await.unwrap();

  daemon.pubsub().subscribe_receiver("events").await.unwrap();
  daemon.cache().set("k", &1, None).await.unwrap();
  assert!(store.is_subscribed("events"));

  daemon.teardown().await.unwrap();
  assert_eq!(store.command_count("UNSUBSCRIBE"), 1);
  assert_eq!(store.command_count("QUIT"), 1);
  assert_eq!(daemon.connection().state(), ConnectionState::Closed);
  assert!(daemon.pubsub().subscribed_channels().is_empty());
}

#[tokio::test]
async fn test_run_serves_until_shutdown() {
  let mut config = service_config(false);
  config.server.host = "127.0.0.1".into();
  config.server.port = 0;
  let daemon = Arc::new(Daemon::new(config).unwrap());

  let running = tokio::spawn({
    let daemon = daemon.clone();
    async move { daemon.run().await }
  });
  tokio::time::sleep(Duration::from_millis(300)).await;
  daemon.shutdown();

  let result = tokio::time::timeout(Duration::from_secs(3), running)
    .await
    .unwrap()
    .unwrap();
  assert!(result.is_ok());
  assert_eq!(daemon.connection().state(), ConnectionState::Closed);
}
