use std::sync::Arc;
use tokio::sync::broadcast;

use super::{http, ServiceConfig};
use crate::cache::Cache;
use crate::connection::ConnectionManager;
use crate::error::ShutdownError;
use crate::list::Lists;
use crate::pubsub::PubSub;

/// Owns the store connection and the HTTP listener for the life of the process
pub struct Daemon {
  config: ServiceConfig,
  conn: Arc<ConnectionManager>,
  pubsub: Arc<PubSub>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
  /// Open the configured store; connecting continues in the background
  pub fn new(config: ServiceConfig) -> Result<Self, anyhow::Error> {
    let conn = ConnectionManager::connect(config.store.clone())?;
    Ok(Self::with_connection(config, conn))
  }

  pub fn with_connection(config: ServiceConfig, conn: Arc<ConnectionManager>) -> Self {
    let (shutdown_tx, _) = broadcast::channel(1);
    let pubsub = Arc::new(PubSub::new(conn.clone()));
    Self {
      config,
      conn,
      pubsub,
      shutdown_tx,
    }
  }

  pub fn connection(&self) -> &Arc<ConnectionManager> {
    &self.conn
  }

  pub fn cache(&self) -> Cache {
    Cache::new(self.conn.clone())
  }

  pub fn lists(&self) -> Lists {
    Lists::new(self.conn.clone())
  }

  pub fn pubsub(&self) -> &Arc<PubSub> {
    &self.pubsub
  }

  /// Trigger graceful shutdown
  pub fn shutdown(&self) {
    tracing::info!("Initiating graceful shutdown...");
    let _ = self.shutdown_tx.send(());
  }

  /// Wait for the store; fails only when the store is required and not ready in time
  pub async fn startup(&self) -> Result<(), anyhow::Error> {
    let timeout = self.config.ready_timeout();
    match self.conn.wait_until_ready(timeout).await {
      Ok(()) => {
        tracing::info!("Store ready at {}", self.config.store.redacted_url());
        Ok(())
      }
      Err(e) if self.config.startup.require_store => {
        tracing::error!("Store not ready within {:?}: {}", timeout, e);
        Err(anyhow::anyhow!("store not ready: {}", e))
      }
      Err(e) => {
        tracing::warn!("Store not ready ({}), starting degraded", e);
        Ok(())
      }
    }
  }

  /// Unsubscribe pub/sub channels, then drain and close the store connection
  pub async fn teardown(&self) -> Result<(), ShutdownError> {
    if let Err(e) = self.pubsub.shutdown().await {
      tracing::warn!("Pubsub shutdown incomplete: {}", e);
    }
    self.conn.disconnect(self.config.drain_timeout()).await
  }

  pub async fn run(&self) -> Result<(), anyhow::Error> {
    let mut shutdown_rx = self.shutdown_tx.subscribe();
    self.startup().await?;

    let addr = self.config.address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("cachebus listening on http://{}", addr);

    axum::serve(listener, http::router(self.conn.clone()).into_make_service())
      .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
        tracing::info!("HTTP server shutting down");
      })
      .await?;

    self.teardown().await?;
    tracing::info!("Shutdown complete");
    Ok(())
  }
}
