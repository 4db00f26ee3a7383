use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::StoreConfig;

/// Replace `${NAME}` and `$NAME` with the value of the environment variable
/// (empty when unset). A `${` without a closing brace is left as is.
pub fn expand_env_vars(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(pos) = rest.find('$') {
    out.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];

    if let Some(braced) = after.strip_prefix('{') {
      match braced.find('}') {
        Some(end) => {
          out.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
          rest = &braced[end + 1..];
        }
        None => {
          out.push_str(&rest[pos..]);
          rest = "";
        }
      }
      continue;
    }

    let name_len = after
      .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
      .unwrap_or(after.len());
    if name_len == 0 {
      out.push('$');
    } else {
      out.push_str(&std::env::var(&after[..name_len]).unwrap_or_default());
    }
    rest = &after[name_len..];
  }

  out.push_str(rest);
  out
}

/// Daemon configuration, loaded from `cachebus.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
  #[serde(default)]
  pub server: ServerSection,
  #[serde(default)]
  pub logging: LoggingSection,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub shutdown: ShutdownSection,
  #[serde(default)]
  pub startup: StartupSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
  #[serde(default = "default_host")]
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,
}

fn default_host() -> String {
  "0.0.0.0".into()
}

fn default_port() -> u16 {
  8080
}

impl Default for ServerSection {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}

fn default_level() -> String {
  "info".into()
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSection {
  /// How long `disconnect` waits for in-flight store commands
  #[serde(default = "default_drain_timeout_ms")]
  pub drain_timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
  5000
}

impl Default for ShutdownSection {
  fn default() -> Self {
    Self {
      drain_timeout_ms: default_drain_timeout_ms(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupSection {
  /// How long startup waits for the store before deciding
  #[serde(default = "default_ready_timeout_ms")]
  pub ready_timeout_ms: u64,

  /// Refuse to start when the store is not ready in time (otherwise run degraded)
  #[serde(default)]
  pub require_store: bool,
}

fn default_ready_timeout_ms() -> u64 {
  10_000
}

impl Default for StartupSection {
  fn default() -> Self {
    Self {
      ready_timeout_ms: default_ready_timeout_ms(),
      require_store: false,
    }
  }
}

impl ServiceConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  /// Load the first config file found in `dir`, if any
  pub fn find_in(dir: impl AsRef<Path>) -> Result<Option<Self>, anyhow::Error> {
    for name in ["cachebus.yaml", "cachebus.yml"] {
      let path = dir.as_ref().join(name);
      if path.exists() {
        tracing::info!("Loading config from {}", path.display());
        return Ok(Some(Self::from_file(&path)?));
      }
    }
    Ok(None)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    Self::find_in(".")
  }

  pub fn address(&self) -> String {
    format!("{}:{}", self.server.host, self.server.port)
  }

  pub fn drain_timeout(&self) -> Duration {
    Duration::from_millis(self.shutdown.drain_timeout_ms)
  }

  pub fn ready_timeout(&self) -> Duration {
    Duration::from_millis(self.startup.ready_timeout_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expand_braced_and_bare() {
    std::env::set_var("CACHEBUS_TEST_EXPAND_HOST", "cache.internal");
    std::env::set_var("CACHEBUS_TEST_EXPAND_PORT", "6380");
    let out = expand_env_vars("host: ${CACHEBUS_TEST_EXPAND_HOST}\nport: $CACHEBUS_TEST_EXPAND_PORT\n");
    assert_eq!(out, "host: cache.internal\nport: 6380\n");
  }

  #[test]
  fn test_expand_leaves_odd_input_alone() {
    assert_eq!(expand_env_vars("cost: $5"), "cost: ");
    assert_eq!(expand_env_vars("price $ only"), "price $ only");
    assert_eq!(expand_env_vars("open ${NOT_CLOSED"), "open ${NOT_CLOSED");
    assert_eq!(expand_env_vars("${CACHEBUS_TEST_SURELY_UNSET}x"), "x");
  }

  #[test]
  fn test_defaults() {
    let config = ServiceConfig::default();
    assert_eq!(config.address(), "0.0.0.0:8080");
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.drain_timeout(), Duration::from_secs(5));
    assert_eq!(config.ready_timeout(), Duration::from_secs(10));
    assert!(!config.startup.require_store);
  }
}
