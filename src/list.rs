//! List and queue operations
//!
//! Every element is JSON-encoded before it is pushed and decoded after it is read.
//! Indices follow the store's conventions: negative values count from the tail.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::codec;
use crate::connection::ConnectionManager;
use crate::error::{BackendError, CodecError, ListError};

/// Outcome of a blocking pop
#[derive(Debug, Clone, PartialEq)]
pub enum BlockingPop<T> {
  /// A value arrived on `key`
  Popped { key: String, value: T },
  /// The wait window elapsed with every list still empty
  TimedOut,
}

impl<T> BlockingPop<T> {
  pub fn is_timed_out(&self) -> bool {
    matches!(self, BlockingPop::TimedOut)
  }

  pub fn into_value(self) -> Option<T> {
    match self {
      BlockingPop::Popped { value, .. } => Some(value),
      BlockingPop::TimedOut => None,
    }
  }
}

#[derive(Clone, Copy)]
enum End {
  Head,
  Tail,
}

/// List helper bound to a shared connection
#[derive(Clone)]
pub struct Lists {
  conn: Arc<ConnectionManager>,
}

impl Lists {
  pub fn new(conn: Arc<ConnectionManager>) -> Self {
    Self { conn }
  }

  fn failed(operation: &'static str, key: &str, source: BackendError) -> ListError {
    tracing::error!(operation, key, "List operation failed: {}", source);
    ListError::Operation {
      operation,
      key: key.to_string(),
      source,
    }
  }

  fn codec_failed(operation: &'static str, key: &str, source: CodecError) -> ListError {
    tracing::error!(operation, key, "List value conversion failed: {}", source);
    ListError::Codec {
      operation,
      key: key.to_string(),
      source,
    }
  }

  fn decode_one<T: DeserializeOwned>(
    operation: &'static str,
    key: &str,
    text: Option<String>,
  ) -> Result<Option<T>, ListError> {
    match text {
      Some(text) => codec::decode(&text)
        .map(Some)
        .map_err(|e| Self::codec_failed(operation, key, e)),
      None => Ok(None),
    }
  }

  async fn push<T: Serialize>(
    &self,
    operation: &'static str,
    key: &str,
    values: &[T],
    end: End,
  ) -> Result<u64, ListError> {
    if values.is_empty() {
      return Err(ListError::EmptyPush {
        operation,
        key: key.to_string(),
      });
    }
    let encoded = codec::encode_all(values).map_err(|e| Self::codec_failed(operation, key, e))?;
    let encoded = &encoded;

    self
      .conn
      .execute(operation, |store| match end {
        End::Head => store.lpush(key, encoded),
        End::Tail => store.rpush(key, encoded),
      })
      .await
      .map_err(|e| Self::failed(operation, key, e))
  }

  /// Append values to the tail; returns the new length
  pub async fn push_right<T: Serialize>(&self, key: &str, values: &[T]) -> Result<u64, ListError> {
    self.push("push_right", key, values, End::Tail).await
  }

  /// Prepend values to the head, one at a time, so the last value ends up first
  pub async fn push_left<T: Serialize>(&self, key: &str, values: &[T]) -> Result<u64, ListError> {
    self.push("push_left", key, values, End::Head).await
  }

  pub async fn pop_right<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ListError> {
    let text = self
      .conn
      .execute("pop_right", |store| store.rpop(key))
      .await
      .map_err(|e| Self::failed("pop_right", key, e))?;
    Self::decode_one("pop_right", key, text)
  }

  pub async fn pop_left<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ListError> {
    let text = self
      .conn
      .execute("pop_left", |store| store.lpop(key))
      .await
      .map_err(|e| Self::failed("pop_left", key, e))?;
    Self::decode_one("pop_left", key, text)
  }

  /// Elements between `start` and `stop`, both inclusive
  pub async fn range<T: DeserializeOwned>(
    &self,
    key: &str,
    start: i64,
    stop: i64,
  ) -> Result<Vec<T>, ListError> {
    let texts = self
      .conn
      .execute("range", |store| store.lrange(key, start, stop))
      .await
      .map_err(|e| Self::failed("range", key, e))?;

    texts
      .iter()
      .map(|text| codec::decode(text).map_err(|e| Self::codec_failed("range", key, e)))
      .collect()
  }

  /// The whole list
  pub async fn range_all<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, ListError> {
    self.range(key, 0, -1).await
  }

  pub async fn length(&self, key: &str) -> Result<u64, ListError> {
    self
      .conn
      .execute("length", |store| store.llen(key))
      .await
      .map_err(|e| Self::failed("length", key, e))
  }

  pub async fn index_get<T: DeserializeOwned>(
    &self,
    key: &str,
    index: i64,
  ) -> Result<Option<T>, ListError> {
    let text = self
      .conn
      .execute("index_get", |store| store.lindex(key, index))
      .await
      .map_err(|e| Self::failed("index_get", key, e))?;
    Self::decode_one("index_get", key, text)
  }

  /// Overwrite the element at `index`; fails when the key or index does not exist
  pub async fn index_set<T: Serialize + ?Sized>(
    &self,
    key: &str,
    index: i64,
    value: &T,
  ) -> Result<(), ListError> {
    let text = codec::encode(value).map_err(|e| Self::codec_failed("index_set", key, e))?;
    self
      .conn
      .execute("index_set", |store| store.lset(key, index, &text))
      .await
      .map_err(|e| Self::failed("index_set", key, e))
  }

  /// Remove elements equal to `value`
  ///
  /// `count` = 0 removes every match, `count` > 0 removes that many from the head,
  /// `count` < 0 removes that many from the tail.
  pub async fn remove_matching<T: Serialize + ?Sized>(
    &self,
    key: &str,
    count: i64,
    value: &T,
  ) -> Result<u64, ListError> {
    let text = codec::encode(value).map_err(|e| Self::codec_failed("remove_matching", key, e))?;
    self
      .conn
      .execute("remove_matching", |store| store.lrem(key, count, &text))
      .await
      .map_err(|e| Self::failed("remove_matching", key, e))
  }

  /// Keep only the elements between `start` and `stop`
  pub async fn trim(&self, key: &str, start: i64, stop: i64) -> Result<(), ListError> {
    self
      .conn
      .execute("trim", |store| store.ltrim(key, start, stop))
      .await
      .map_err(|e| Self::failed("trim", key, e))
  }

  /// Remove the whole list; `true` when it existed
  pub async fn clear(&self, key: &str) -> Result<bool, ListError> {
    let keys = [key.to_string()];
    let keys = &keys;
    let removed = self
      .conn
      .execute("clear", |store| store.del(keys))
      .await
      .map_err(|e| Self::failed("clear", key, e))?;
    Ok(removed > 0)
  }

  /// Pop from the tail, waiting up to `timeout` for a value (`Duration::ZERO` waits forever)
  pub async fn blocking_pop_right<T: DeserializeOwned>(
    &self,
    key: &str,
    timeout: Duration,
  ) -> Result<BlockingPop<T>, ListError> {
    self
      .blocking_pop("blocking_pop_right", &[key], timeout, End::Tail)
      .await
  }

  /// Pop from the head, waiting up to `timeout` for a value (`Duration::ZERO` waits forever)
  pub async fn blocking_pop_left<T: DeserializeOwned>(
    &self,
    key: &str,
    timeout: Duration,
  ) -> Result<BlockingPop<T>, ListError> {
    self
      .blocking_pop("blocking_pop_left", &[key], timeout, End::Head)
      .await
  }

  /// Pop from the tail of the first non-empty list among `keys`
  pub async fn blocking_pop_right_any<T: DeserializeOwned>(
    &self,
    keys: &[&str],
    timeout: Duration,
  ) -> Result<BlockingPop<T>, ListError> {
    self
      .blocking_pop("blocking_pop_right", keys, timeout, End::Tail)
      .await
  }

  /// Pop from the head of the first non-empty list among `keys`
  pub async fn blocking_pop_left_any<T: DeserializeOwned>(
    &self,
    keys: &[&str],
    timeout: Duration,
  ) -> Result<BlockingPop<T>, ListError> {
    self
      .blocking_pop("blocking_pop_left", keys, timeout, End::Head)
      .await
  }

  async fn blocking_pop<T: DeserializeOwned>(
    &self,
    operation: &'static str,
    keys: &[&str],
    timeout: Duration,
    end: End,
  ) -> Result<BlockingPop<T>, ListError> {
    let label = keys.join(",");
    if keys.is_empty() {
      return Ok(BlockingPop::TimedOut);
    }
    let owned: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    let owned = &owned;

    let popped = self
      .conn
      .execute(operation, |store| match end {
        End::Head => store.blpop(owned, timeout),
        End::Tail => store.brpop(owned, timeout),
      })
      .await
      .map_err(|e| Self::failed(operation, &label, e))?;

    match popped {
      Some((key, text)) => {
        let value = codec::decode(&text).map_err(|e| Self::codec_failed(operation, &key, e))?;
        Ok(BlockingPop::Popped { key, value })
      }
      None => {
        tracing::debug!(operation, keys = %label, "Blocking pop timed out after {:?}", timeout);
        Ok(BlockingPop::TimedOut)
      }
    }
  }
}
