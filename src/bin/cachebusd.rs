use cachebus::server::{Daemon, ServiceConfig};
use cachebus::StoreMode;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "cachebusd", about = "cachebus store service", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long, env = "CACHEBUS_STORE_MODE")]
  store_mode: Option<StoreMode>,
  #[arg(long, env = "CACHEBUS_STORE_HOST")]
  store_host: Option<String>,
  #[arg(long, env = "CACHEBUS_STORE_PORT")]
  store_port: Option<u16>,
  #[arg(long, env = "CACHEBUS_STORE_PASSWORD", hide_env_values = true)]
  store_password: Option<String>,
  #[arg(long, env = "CACHEBUS_STORE_DB")]
  store_db: Option<u8>,
  #[arg(long, env = "CACHEBUS_STORE_TLS")]
  store_tls: Option<bool>,
  #[arg(long, env = "CACHEBUS_CONNECT_TIMEOUT_MS")]
  connect_timeout_ms: Option<u64>,
  #[arg(long, env = "CACHEBUS_MAX_RETRIES_PER_REQUEST")]
  max_retries_per_request: Option<u32>,
  #[arg(long, env = "CACHEBUS_OFFLINE_QUEUE")]
  offline_queue: Option<bool>,
  #[arg(long, env = "CACHEBUS_READY_CHECK")]
  ready_check: Option<bool>,
  #[arg(long, env = "CACHEBUS_REQUIRE_STORE")]
  require_store: Option<bool>,
  #[arg(short, long, env = "CACHEBUS_PORT")]
  port: Option<u16>,
  #[arg(long, env = "CACHEBUS_HOST")]
  host: Option<String>,
  #[arg(long, env = "CACHEBUS_LOG_LEVEL")]
  log_level: Option<String>,
}

impl Args {
  fn apply(self, config: &mut ServiceConfig) {
    let store = &mut config.store;
    if let Some(mode) = self.store_mode {
      store.mode = mode;
    }
    if let Some(host) = self.store_host {
      store.host = host;
    }
    if let Some(port) = self.store_port {
      store.port = port;
    }
    if let Some(password) = self.store_password {
      store.password = Some(password);
    }
    if let Some(db) = self.store_db {
      store.database = db;
    }
    if let Some(tls) = self.store_tls {
      store.tls_enabled = tls;
    }
    if let Some(ms) = self.connect_timeout_ms {
      store.connect_timeout_ms = ms;
    }
    if let Some(retries) = self.max_retries_per_request {
      store.max_retries_per_request = Some(retries);
    }
    if let Some(enabled) = self.offline_queue {
      store.offline_queue = enabled;
    }
    if let Some(enabled) = self.ready_check {
      store.ready_check = enabled;
    }
    if let Some(required) = self.require_store {
      config.startup.require_store = required;
    }
    if let Some(port) = self.port {
      config.server.port = port;
    }
    if let Some(host) = self.host {
      config.server.host = host;
    }
    if let Some(level) = self.log_level {
      config.logging.level = level;
    }
  }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    ServiceConfig::from_file(path)?
  } else {
    ServiceConfig::find_and_load()?.unwrap_or_default()
  };
  args.apply(&mut config);

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  tracing::info!(
    "Starting cachebusd ({} store at {})",
    config.store.mode,
    config.store.redacted_url()
  );

  let daemon = Arc::new(Daemon::new(config)?);
  let daemon_clone = daemon.clone();

  // Handle shutdown signals (SIGINT, SIGTERM)
  tokio::spawn(async move {
    shutdown_signal().await;
    daemon_clone.shutdown();
  });

  daemon.run().await
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("Failed to listen for Ctrl+C: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        tracing::error!("Failed to install SIGTERM handler: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}
