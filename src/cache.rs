//! Key/value cache operations
//!
//! Values are JSON-encoded before they reach the store; counters are native store
//! integers and bypass the codec. `get` distinguishes a missing key (`None`) from a
//! key holding JSON `null` (`Some(Value::Null)`).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use crate::codec;
use crate::connection::ConnectionManager;
use crate::error::{BackendError, CacheError, CodecError};

/// Cache helper bound to a shared connection
#[derive(Clone)]
pub struct Cache {
  conn: Arc<ConnectionManager>,
}

impl Cache {
  pub fn new(conn: Arc<ConnectionManager>) -> Self {
    Self { conn }
  }

  fn failed(operation: &'static str, keys: &[&str], source: BackendError) -> CacheError {
    tracing::error!(operation, ?keys, "Cache operation failed: {}", source);
    CacheError::Operation {
      operation,
      keys: keys.iter().map(|k| k.to_string()).collect(),
      source,
    }
  }

  fn codec_failed(operation: &'static str, key: &str, source: CodecError) -> CacheError {
    tracing::error!(operation, key, "Cache value conversion failed: {}", source);
    CacheError::Codec {
      operation,
      key: key.to_string(),
      source,
    }
  }

  /// Store `value` under `key`, expiring after `ttl_secs` when given (zero is rejected by the store)
  pub async fn set<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    ttl_secs: Option<u64>,
  ) -> Result<(), CacheError> {
    let text = codec::encode(value).map_err(|e| Self::codec_failed("set", key, e))?;
    self
      .conn
      .execute("set", |store| store.set(key, &text, ttl_secs))
      .await
      .map_err(|e| Self::failed("set", &[key], e))
  }

  /// Fetch and decode `key`; `None` when the key does not exist
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
    let text = self
      .conn
      .execute("get", |store| store.get(key))
      .await
      .map_err(|e| Self::failed("get", &[key], e))?;

    match text {
      Some(text) => codec::decode(&text)
        .map(Some)
        .map_err(|e| Self::codec_failed("get", key, e)),
      None => Ok(None),
    }
  }

  /// Delete keys, returning how many existed; an empty list never reaches the store
  pub async fn delete(&self, keys: &[&str]) -> Result<u64, CacheError> {
    if keys.is_empty() {
      return Ok(0);
    }
    let owned: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    let owned = &owned;
    self
      .conn
      .execute("delete", |store| store.del(owned))
      .await
      .map_err(|e| Self::failed("delete", keys, e))
  }

  /// Delete every key matching a glob pattern
  ///
  /// Runs in two steps (enumerate, then delete), so keys created in between are left
  /// alone. Fine for invalidation; do not rely on it where a stray key is a bug.
  pub async fn clear_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
    let keys = self
      .conn
      .execute("clear_pattern", |store| store.keys(pattern))
      .await
      .map_err(|e| Self::failed("clear_pattern", &[pattern], e))?;

    if keys.is_empty() {
      return Ok(0);
    }
    tracing::debug!(pattern, count = keys.len(), "Clearing cache keys");

    let keys = &keys;
    self
      .conn
      .execute("clear_pattern", |store| store.del(keys))
      .await
      .map_err(|e| Self::failed("clear_pattern", &[pattern], e))
  }

  pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
    self
      .conn
      .execute("exists", |store| store.exists(key))
      .await
      .map_err(|e| Self::failed("exists", &[key], e))
  }

  /// Seconds remaining; -1 when the key never expires, -2 when it does not exist
  pub async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
    self
      .conn
      .execute("ttl", |store| store.ttl(key))
      .await
      .map_err(|e| Self::failed("ttl", &[key], e))
  }

  /// Set a timeout on an existing key; `false` when the key does not exist
  pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, CacheError> {
    self
      .conn
      .execute("expire", |store| store.expire(key, ttl_secs))
      .await
      .map_err(|e| Self::failed("expire", &[key], e))
  }

  /// Drop the timeout on a key; `false` when it had none or does not exist
  pub async fn persist(&self, key: &str) -> Result<bool, CacheError> {
    self
      .conn
      .execute("persist", |store| store.persist(key))
      .await
      .map_err(|e| Self::failed("persist", &[key], e))
  }

  /// Add `delta` to the counter at `key` (missing keys start at 0)
  pub async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
    self
      .conn
      .execute("increment", |store| store.incr_by(key, delta))
      .await
      .map_err(|e| Self::failed("increment", &[key], e))
  }

  /// Subtract `delta`; `i64::MIN` cannot be negated and fails without a store call
  pub async fn decrement(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
    let Some(delta) = delta.checked_neg() else {
      return Err(Self::failed(
        "decrement",
        &[key],
        BackendError::Command("ERR decrement would overflow".into()),
      ));
    };
    self
      .conn
      .execute("decrement", |store| store.incr_by(key, delta))
      .await
      .map_err(|e| Self::failed("decrement", &[key], e))
  }

  /// Fetch several keys at once; results line up with `keys`, `None` for misses
  pub async fn get_many<T: DeserializeOwned>(
    &self,
    keys: &[&str],
  ) -> Result<Vec<Option<T>>, CacheError> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    let owned: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    let owned = &owned;
    let texts = self
      .conn
      .execute("get_many", |store| store.mget(owned))
      .await
      .map_err(|e| Self::failed("get_many", keys, e))?;

    keys
      .iter()
      .zip(texts)
      .map(|(key, text)| match text {
        Some(text) => codec::decode(&text)
          .map(Some)
          .map_err(|e| Self::codec_failed("get_many", key, e)),
        None => Ok(None),
      })
      .collect()
  }

  /// Store several values at once; each value is encoded on its own
  pub async fn set_many<K, V, I>(&self, entries: I) -> Result<(), CacheError>
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Serialize,
  {
    let mut pairs = Vec::new();
    for (key, value) in entries {
      let key = key.into();
      let text = codec::encode(&value).map_err(|e| Self::codec_failed("set_many", &key, e))?;
      pairs.push((key, text));
    }
    if pairs.is_empty() {
      return Ok(());
    }

    let pairs = &pairs;
    self
      .conn
      .execute("set_many", |store| store.mset(pairs))
      .await
      .map_err(|e| {
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        Self::failed("set_many", &keys, e)
      })
  }

  /// Return the cached value, or compute it with `load`, cache it and return it
  pub async fn get_or_set<T, F, Fut>(
    &self,
    key: &str,
    ttl_secs: Option<u64>,
    load: F,
  ) -> Result<T, CacheError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    if let Some(hit) = self.get::<T>(key).await? {
      return Ok(hit);
    }
    let value = load().await;
    self.set(key, &value, ttl_secs).await?;
    Ok(value)
  }
}
