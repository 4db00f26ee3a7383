//! Backing store seam
//!
//! `StoreBackend` is the set of remote primitives the helpers are built on. Every
//! payload crossing this trait is already-encoded text; the codec lives above it.

mod glob;
mod memory;
mod remote;

pub use glob::glob_match;
pub use memory::MemoryStore;
pub use remote::RedisStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::{StoreConfig, StoreMode};
use crate::error::BackendError;

/// A message delivered by the store for a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
  pub channel: String,
  pub payload: String,
}

/// Remote key/value, pub/sub and list primitives
#[async_trait]
pub trait StoreBackend: Send + Sync {
  /// Short backend name for logs
  fn name(&self) -> &'static str;

  /// Open the transport (and any auxiliary sessions) and restore channel subscriptions
  async fn establish(&self) -> Result<(), BackendError>;
  async fn ping(&self) -> Result<(), BackendError>;
  async fn close(&self) -> Result<(), BackendError>;

  /// Messages for every channel this session is subscribed to
  fn deliveries(&self) -> broadcast::Receiver<Delivery>;

  async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;
  /// `SET`, with `EX` when `ttl_secs` is given
  async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), BackendError>;
  async fn del(&self, keys: &[String]) -> Result<u64, BackendError>;
  async fn exists(&self, key: &str) -> Result<bool, BackendError>;
  /// Seconds remaining, -1 without expiry, -2 when absent
  async fn ttl(&self, key: &str) -> Result<i64, BackendError>;
  async fn expire(&self, key: &str, secs: u64) -> Result<bool, BackendError>;
  async fn persist(&self, key: &str) -> Result<bool, BackendError>;
  async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BackendError>;
  async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError>;
  async fn mset(&self, pairs: &[(String, String)]) -> Result<(), BackendError>;
  async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError>;

  async fn subscribe(&self, channel: &str) -> Result<(), BackendError>;
  async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError>;
  /// Number of receivers the store delivered to
  async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackendError>;

  async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, BackendError>;
  async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, BackendError>;
  async fn rpop(&self, key: &str) -> Result<Option<String>, BackendError>;
  async fn lpop(&self, key: &str) -> Result<Option<String>, BackendError>;
  async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BackendError>;
  async fn llen(&self, key: &str) -> Result<u64, BackendError>;
  async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, BackendError>;
  async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), BackendError>;
  async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, BackendError>;
  async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), BackendError>;
  /// Blocking pop from the tail of the first non-empty list; zero timeout waits forever
  async fn brpop(
    &self,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError>;
  async fn blpop(
    &self,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError>;
}

/// Build the backend selected by `config.mode`
pub fn open_backend(config: &StoreConfig) -> Result<Arc<dyn StoreBackend>, BackendError> {
  match config.mode {
    StoreMode::Redis => Ok(Arc::new(RedisStore::new(config.clone())?)),
    StoreMode::Memory => Ok(Arc::new(MemoryStore::new())),
  }
}
