//! In-process store with the same command semantics as the remote server

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};

use super::glob::glob_match;
use super::{Delivery, StoreBackend};
use crate::error::{BackendError, TransportError};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
  Text(String),
  List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
  value: Value,
  expires_at: Option<Instant>,
}

impl Entry {
  fn new(value: Value) -> Self {
    Self {
      value,
      expires_at: None,
    }
  }

  fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() >= exp)
      .unwrap_or(false)
  }
}

#[derive(Default)]
struct Keyspace {
  entries: HashMap<String, Entry>,
}

impl Keyspace {
  /// Look up a live entry, dropping it first if it has expired
  fn live(&mut self, key: &str) -> Option<&mut Entry> {
    if self.entries.get(key).is_some_and(Entry::is_expired) {
      self.entries.remove(key);
    }
    self.entries.get_mut(key)
  }

  fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>, BackendError> {
    match self.live(key) {
      None => Ok(None),
      Some(Entry {
        value: Value::List(list),
        ..
      }) => Ok(Some(list)),
      Some(_) => Err(BackendError::Command(WRONGTYPE.into())),
    }
  }

  fn list_or_create(&mut self, key: &str) -> Result<&mut VecDeque<String>, BackendError> {
    if self.live(key).is_none() {
      self
        .entries
        .insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
    }
    match self.entries.get_mut(key) {
      Some(Entry {
        value: Value::List(list),
        ..
      }) => Ok(list),
      _ => Err(BackendError::Command(WRONGTYPE.into())),
    }
  }

  /// Remove a list key once it holds no elements
  fn drop_if_empty(&mut self, key: &str) {
    if matches!(self.entries.get(key), Some(Entry { value: Value::List(l), .. }) if l.is_empty()) {
      self.entries.remove(key);
    }
  }
}

/// Resolve `start..=stop` with negative offsets against a list of `len` items
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
  let len = len as i64;
  let start = if start < 0 { (len + start).max(0) } else { start };
  let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
  if start > stop || start >= len {
    None
  } else {
    Some((start as usize, stop as usize))
  }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
  let len = len as i64;
  let index = if index < 0 { len + index } else { index };
  (0..len).contains(&index).then_some(index as usize)
}

#[derive(Clone, Copy)]
enum End {
  Head,
  Tail,
}

/// In-memory store
///
/// Holds one keyspace plus this session's channel subscriptions. Expiration is lazy:
/// an expired key is dropped the next time it is touched.
pub struct MemoryStore {
  keyspace: Mutex<Keyspace>,
  channels: Mutex<HashSet<String>>,
  commands: Mutex<HashMap<&'static str, u64>>,
  available: AtomicBool,
  pushed: Notify,
  delivery_tx: broadcast::Sender<Delivery>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    let (delivery_tx, _) = broadcast::channel(4096);
    Self {
      keyspace: Mutex::new(Keyspace::default()),
      channels: Mutex::new(HashSet::new()),
      commands: Mutex::new(HashMap::new()),
      available: AtomicBool::new(true),
      pushed: Notify::new(),
      delivery_tx,
    }
  }

  /// Simulate an outage (`false`) or recovery (`true`)
  pub fn set_available(&self, available: bool) {
    self.available.store(available, Ordering::SeqCst);
  }

  /// How many times `command` reached the store (including refused attempts)
  pub fn command_count(&self, command: &str) -> u64 {
    self.commands.lock().get(command).copied().unwrap_or(0)
  }

  pub fn is_subscribed(&self, channel: &str) -> bool {
    self.channels.lock().contains(channel)
  }

  /// Count the command and fail it while the store is marked unavailable
  fn enter(&self, command: &'static str) -> Result<(), BackendError> {
    *self.commands.lock().entry(command).or_insert(0) += 1;
    if self.available.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(TransportError::Unavailable.into())
    }
  }

  fn push(&self, key: &str, values: &[String], end: End) -> Result<u64, BackendError> {
    let len = {
      let mut keyspace = self.keyspace.lock();
      let list = keyspace.list_or_create(key)?;
      for value in values {
        match end {
          End::Head => list.push_front(value.clone()),
          End::Tail => list.push_back(value.clone()),
        }
      }
      list.len() as u64
    };
    self.pushed.notify_waiters();
    Ok(len)
  }

  fn pop(&self, key: &str, end: End) -> Result<Option<String>, BackendError> {
    let mut keyspace = self.keyspace.lock();
    let value = match keyspace.list(key)? {
      Some(list) => match end {
        End::Head => list.pop_front(),
        End::Tail => list.pop_back(),
      },
      None => None,
    };
    keyspace.drop_if_empty(key);
    Ok(value)
  }

  fn pop_first(&self, keys: &[String], end: End) -> Result<Option<(String, String)>, BackendError> {
    for key in keys {
      if let Some(value) = self.pop(key, end)? {
        return Ok(Some((key.clone(), value)));
      }
    }
    Ok(None)
  }

  async fn blocking_pop(
    &self,
    keys: &[String],
    timeout: Duration,
    end: End,
  ) -> Result<Option<(String, String)>, BackendError> {
    let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);

    loop {
      // Register for wakeups before checking so a concurrent push is never missed
      let mut notified = pin!(self.pushed.notified());
      notified.as_mut().enable();

      if let Some(popped) = self.pop_first(keys, end)? {
        return Ok(Some(popped));
      }

      match deadline {
        Some(deadline) => {
          if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return Ok(None);
          }
        }
        None => notified.await,
      }

      if !self.available.load(Ordering::SeqCst) {
        return Err(TransportError::Unavailable.into());
      }
    }
  }
}

#[async_trait]
impl StoreBackend for MemoryStore {
  fn name(&self) -> &'static str {
    "memory"
  }

  async fn establish(&self) -> Result<(), BackendError> {
    self.enter("CONNECT")
  }

  async fn ping(&self) -> Result<(), BackendError> {
    self.enter("PING")
  }

  async fn close(&self) -> Result<(), BackendError> {
    self.enter("QUIT")?;
    self.channels.lock().clear();
    Ok(())
  }

  fn deliveries(&self) -> broadcast::Receiver<Delivery> {
    self.delivery_tx.subscribe()
  }

  async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
    self.enter("GET")?;
    match self.keyspace.lock().live(key) {
      None => Ok(None),
      Some(Entry {
        value: Value::Text(text),
        ..
      }) => Ok(Some(text.clone())),
      Some(_) => Err(BackendError::Command(WRONGTYPE.into())),
    }
  }

  async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), BackendError> {
    self.enter("SET")?;
    if ttl_secs == Some(0) {
      return Err(BackendError::Command("ERR invalid expire time in 'set' command".into()));
    }
    let mut entry = Entry::new(Value::Text(value.to_string()));
    entry.expires_at = ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    self.keyspace.lock().entries.insert(key.to_string(), entry);
    Ok(())
  }

  async fn del(&self, keys: &[String]) -> Result<u64, BackendError> {
    self.enter("DEL")?;
    let mut keyspace = self.keyspace.lock();
    let mut removed = 0;
    for key in keys {
      if keyspace.live(key).is_some() {
        keyspace.entries.remove(key);
        removed += 1;
      }
    }
    Ok(removed)
  }

  async fn exists(&self, key: &str) -> Result<bool, BackendError> {
    self.enter("EXISTS")?;
    Ok(self.keyspace.lock().live(key).is_some())
  }

  async fn ttl(&self, key: &str) -> Result<i64, BackendError> {
    self.enter("TTL")?;
    let mut keyspace = self.keyspace.lock();
    Ok(match keyspace.live(key) {
      None => -2,
      Some(Entry {
        expires_at: None, ..
      }) => -1,
      Some(Entry {
        expires_at: Some(exp),
        ..
      }) => {
        let remaining = exp.saturating_duration_since(Instant::now()).as_millis() as i64;
        (remaining + 500) / 1000
      }
    })
  }

  async fn expire(&self, key: &str, secs: u64) -> Result<bool, BackendError> {
    self.enter("EXPIRE")?;
    let mut keyspace = self.keyspace.lock();
    if keyspace.live(key).is_none() {
      return Ok(false);
    }
    if secs == 0 {
      keyspace.entries.remove(key);
    } else if let Some(entry) = keyspace.entries.get_mut(key) {
      entry.expires_at = Some(Instant::now() + Duration::from_secs(secs));
    }
    Ok(true)
  }

  async fn persist(&self, key: &str) -> Result<bool, BackendError> {
    self.enter("PERSIST")?;
    Ok(match self.keyspace.lock().live(key) {
      Some(entry) => entry.expires_at.take().is_some(),
      None => false,
    })
  }

  async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BackendError> {
    self.enter("INCRBY")?;
    let mut keyspace = self.keyspace.lock();
    let current = match keyspace.live(key) {
      None => 0,
      Some(Entry {
        value: Value::Text(text),
        ..
      }) => text.parse::<i64>().map_err(|_| {
        BackendError::Command("ERR value is not an integer or out of range".into())
      })?,
      Some(_) => return Err(BackendError::Command(WRONGTYPE.into())),
    };
    let next = current
      .checked_add(delta)
      .ok_or_else(|| BackendError::Command("ERR increment or decrement would overflow".into()))?;

    match keyspace.entries.get_mut(key) {
      // INCRBY keeps an existing expiry
      Some(entry) => entry.value = Value::Text(next.to_string()),
      None => {
        keyspace
          .entries
          .insert(key.to_string(), Entry::new(Value::Text(next.to_string())));
      }
    }
    Ok(next)
  }

  async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
    self.enter("MGET")?;
    let mut keyspace = self.keyspace.lock();
    Ok(
      keys
        .iter()
        .map(|key| match keyspace.live(key) {
          Some(Entry {
            value: Value::Text(text),
            ..
          }) => Some(text.clone()),
          _ => None,
        })
        .collect(),
    )
  }

  async fn mset(&self, pairs: &[(String, String)]) -> Result<(), BackendError> {
    self.enter("MSET")?;
    let mut keyspace = self.keyspace.lock();
    for (key, value) in pairs {
      keyspace
        .entries
        .insert(key.clone(), Entry::new(Value::Text(value.clone())));
    }
    Ok(())
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
    self.enter("KEYS")?;
    let mut keyspace = self.keyspace.lock();
    keyspace.entries.retain(|_, entry| !entry.is_expired());
    Ok(
      keyspace
        .entries
        .keys()
        .filter(|key| glob_match(pattern, key))
        .cloned()
        .collect(),
    )
  }

  async fn subscribe(&self, channel: &str) -> Result<(), BackendError> {
    self.enter("SUBSCRIBE")?;
    self.channels.lock().insert(channel.to_string());
    Ok(())
  }

  async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError> {
    self.enter("UNSUBSCRIBE")?;
    self.channels.lock().remove(channel);
    Ok(())
  }

  async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackendError> {
    self.enter("PUBLISH")?;
    if !self.channels.lock().contains(channel) {
      return Ok(0);
    }
    let _ = self.delivery_tx.send(Delivery {
      channel: channel.to_string(),
      payload: payload.to_string(),
    });
    Ok(1)
  }

  async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, BackendError> {
    self.enter("RPUSH")?;
    self.push(key, values, End::Tail)
  }

  async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, BackendError> {
    self.enter("LPUSH")?;
    self.push(key, values, End::Head)
  }

  async fn rpop(&self, key: &str) -> Result<Option<String>, BackendError> {
    self.enter("RPOP")?;
    self.pop(key, End::Tail)
  }

  async fn lpop(&self, key: &str) -> Result<Option<String>, BackendError> {
    self.enter("LPOP")?;
    self.pop(key, End::Head)
  }

  async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BackendError> {
    self.enter("LRANGE")?;
    let mut keyspace = self.keyspace.lock();
    let Some(list) = keyspace.list(key)? else {
      return Ok(Vec::new());
    };
    Ok(match normalize_range(start, stop, list.len()) {
      Some((start, stop)) => list.range(start..=stop).cloned().collect(),
      None => Vec::new(),
    })
  }

  async fn llen(&self, key: &str) -> Result<u64, BackendError> {
    self.enter("LLEN")?;
    let mut keyspace = self.keyspace.lock();
    Ok(keyspace.list(key)?.map(|l| l.len() as u64).unwrap_or(0))
  }

  async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, BackendError> {
    self.enter("LINDEX")?;
    let mut keyspace = self.keyspace.lock();
    let Some(list) = keyspace.list(key)? else {
      return Ok(None);
    };
    Ok(normalize_index(index, list.len()).and_then(|i| list.get(i).cloned()))
  }

  async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), BackendError> {
    self.enter("LSET")?;
    let mut keyspace = self.keyspace.lock();
    let list = keyspace
      .list(key)?
      .ok_or_else(|| BackendError::Command("ERR no such key".into()))?;
    let slot = normalize_index(index, list.len())
      .and_then(|i| list.get_mut(i))
      .ok_or_else(|| BackendError::Command("ERR index out of range".into()))?;
    *slot = value.to_string();
    Ok(())
  }

  async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, BackendError> {
    self.enter("LREM")?;
    let mut keyspace = self.keyspace.lock();
    let Some(list) = keyspace.list(key)? else {
      return Ok(0);
    };

    let limit = if count == 0 {
      usize::MAX
    } else {
      count.unsigned_abs() as usize
    };
    let mut removed = 0usize;

    if count >= 0 {
      let mut i = 0;
      while i < list.len() && removed < limit {
        if list[i] == value {
          list.remove(i);
          removed += 1;
        } else {
          i += 1;
        }
      }
    } else {
      let mut i = list.len();
      while i > 0 && removed < limit {
        i -= 1;
        if list[i] == value {
          list.remove(i);
          removed += 1;
        }
      }
    }

    keyspace.drop_if_empty(key);
    Ok(removed as u64)
  }

  async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), BackendError> {
    self.enter("LTRIM")?;
    let mut keyspace = self.keyspace.lock();
    let Some(list) = keyspace.list(key)? else {
      return Ok(());
    };
    match normalize_range(start, stop, list.len()) {
      Some((start, stop)) => {
        list.truncate(stop + 1);
        list.drain(..start);
      }
      None => list.clear(),
    }
    keyspace.drop_if_empty(key);
    Ok(())
  }

  async fn brpop(
    &self,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError> {
    self.enter("BRPOP")?;
    self.blocking_pop(keys, timeout, End::Tail).await
  }

  async fn blpop(
    &self,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError> {
    self.enter("BLPOP")?;
    self.blocking_pop(keys, timeout, End::Head).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_normalize_range() {
    assert_eq!(normalize_range(0, -1, 5), Some((0, 4)));
    assert_eq!(normalize_range(1, 2, 5), Some((1, 2)));
    assert_eq!(normalize_range(-2, -1, 5), Some((3, 4)));
    assert_eq!(normalize_range(0, 100, 3), Some((0, 2)));
    assert_eq!(normalize_range(-100, 0, 3), Some((0, 0)));
    assert_eq!(normalize_range(3, 1, 5), None);
    assert_eq!(normalize_range(5, 10, 5), None);
    assert_eq!(normalize_range(0, -1, 0), None);
  }

  #[test]
  fn test_normalize_index() {
    assert_eq!(normalize_index(0, 3), Some(0));
    assert_eq!(normalize_index(-1, 3), Some(2));
    assert_eq!(normalize_index(3, 3), None);
    assert_eq!(normalize_index(-4, 3), None);
  }

  #[tokio::test]
  async fn test_wrong_kind_is_rejected() {
    let store = MemoryStore::new();
    store.set("greeting", "\"hi\"", None).await.unwrap();

    let err = store.rpush("greeting", &["1".into()]).await.unwrap_err();
    assert!(matches!(err, BackendError::Command(ref msg) if msg.starts_with("WRONGTYPE")));

    store.rpush("queue", &["1".into()]).await.unwrap();
    assert!(store.get("queue").await.is_err());
  }

  #[tokio::test]
  async fn test_zero_ttl_is_rejected() {
    let store = MemoryStore::new();
    let err = store.set("flash", "1", Some(0)).await.unwrap_err();
    assert!(matches!(err, BackendError::Command(ref msg) if msg.contains("invalid expire time")));
    assert!(!store.exists("flash").await.unwrap());
  }

  #[tokio::test]
  async fn test_unavailable_store_fails_with_transport_error() {
    let store = MemoryStore::new();
    store.set_available(false);

    let err = store.get("key").await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(store.command_count("GET"), 1);

    store.set_available(true);
    assert_eq!(store.get("key").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_expired_keys_vanish_lazily() {
    let store = MemoryStore::new();
    store.set("short", "1", Some(1)).await.unwrap();
    {
      let mut keyspace = store.keyspace.lock();
      let entry = keyspace.entries.get_mut("short").unwrap();
      entry.expires_at = Some(Instant::now() - Duration::from_millis(1));
    }

    assert!(!store.exists("short").await.unwrap());
    assert_eq!(store.ttl("short").await.unwrap(), -2);
  }

  #[tokio::test]
  async fn test_lpush_reverses_argument_order() {
    let store = MemoryStore::new();
    let len = store
      .lpush("l", &["a".into(), "b".into(), "c".into()])
      .await
      .unwrap();
    assert_eq!(len, 3);
    assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["c", "b", "a"]);
  }

  #[tokio::test]
  async fn test_publish_without_subscription_reaches_nobody() {
    let store = MemoryStore::new();
    assert_eq!(store.publish("news", "1").await.unwrap(), 0);

    store.subscribe("news").await.unwrap();
    let mut rx = store.deliveries();
    assert_eq!(store.publish("news", "1").await.unwrap(), 1);
    assert_eq!(
      rx.recv().await.unwrap(),
      Delivery {
        channel: "news".into(),
        payload: "1".into()
      }
    );
  }
}
