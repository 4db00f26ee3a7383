//! Store connection configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which backend serves the store commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
  /// External Redis-protocol server (default)
  #[default]
  Redis,
  /// In-process store, for local development and tests
  Memory,
}

impl std::fmt::Display for StoreMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StoreMode::Redis => write!(f, "redis"),
      StoreMode::Memory => write!(f, "memory"),
    }
  }
}

impl std::str::FromStr for StoreMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "redis" | "external" | "proxy" => Ok(StoreMode::Redis),
      "memory" | "inmemory" | "builtin" => Ok(StoreMode::Memory),
      _ => Err(format!("Unknown store mode: {}", s)),
    }
  }
}

/// Reconnect backoff: `min(attempt * step, max_delay)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
  #[serde(default = "default_retry_step_ms")]
  pub step_ms: u64,

  #[serde(default = "default_retry_max_delay_ms")]
  pub max_delay_ms: u64,

  /// Give up reconnecting after this many attempts (unset = never give up)
  #[serde(default)]
  pub max_attempts: Option<u32>,
}

fn default_retry_step_ms() -> u64 {
  50
}

fn default_retry_max_delay_ms() -> u64 {
  2000
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      step_ms: default_retry_step_ms(),
      max_delay_ms: default_retry_max_delay_ms(),
      max_attempts: None,
    }
  }
}

/// Connection settings for the backing store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
  #[serde(default)]
  pub mode: StoreMode,

  #[serde(default = "default_host")]
  pub host: String,

  #[serde(default = "default_port")]
  pub port: u16,

  #[serde(default)]
  pub password: Option<String>,

  /// Logical database index
  #[serde(default)]
  pub database: u8,

  #[serde(default)]
  pub tls_enabled: bool,

  /// Bound on opening the transport and on health probes
  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  #[serde(default)]
  pub retry: RetryConfig,

  /// How many reconnects a single command may ride through (unset = unbounded)
  #[serde(default = "default_max_retries_per_request")]
  pub max_retries_per_request: Option<u32>,

  /// Hold commands issued while disconnected until the connection is ready again
  #[serde(default = "default_true")]
  pub offline_queue: bool,

  /// Require a successful PING before reporting the connection ready
  #[serde(default = "default_true")]
  pub ready_check: bool,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_port() -> u16 {
  6379
}

fn default_connect_timeout_ms() -> u64 {
  10_000
}

fn default_max_retries_per_request() -> Option<u32> {
  Some(3)
}

fn default_true() -> bool {
  true
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      mode: StoreMode::default(),
      host: default_host(),
      port: default_port(),
      password: None,
      database: 0,
      tls_enabled: false,
      connect_timeout_ms: default_connect_timeout_ms(),
      retry: RetryConfig::default(),
      max_retries_per_request: default_max_retries_per_request(),
      offline_queue: true,
      ready_check: true,
    }
  }
}

impl StoreConfig {
  /// Configuration for an in-process store
  pub fn memory() -> Self {
    Self {
      mode: StoreMode::Memory,
      ..Self::default()
    }
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  /// Generate the store connection URL
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", pwd),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }

  /// Connection URL with the credential masked, for logs
  pub fn redacted_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => ":***@",
      _ => "",
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }
}
