//! Cache operation tests - miss vs null, TTLs, counters, bulk operations, pattern clears

use async_trait::async_trait;
use cachebus::store::Delivery;
use cachebus::{
  BackendError, Cache, CacheError, ConnectionManager, MemoryStore, StoreBackend, StoreConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn setup() -> (Arc<MemoryStore>, Cache) {
  let store = Arc::new(MemoryStore::new());
  let conn = ConnectionManager::with_backend(StoreConfig::memory(), store.clone());
  conn
    .wait_until_ready(Duration::from_secs(2))
    .await
    .unwrap();
  (store, Cache::new(conn))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
  user: String,
  roles: Vec<String>,
}

// =============================================================================
// Get / Set
// =============================================================================

#[tokio::test]
async fn test_set_and_get_struct() {
  let (_, cache) = setup().await;
  let session = Session {
    user: "alice".into(),
    roles: vec!["admin".into()],
  };

  tokio_test::assert_ok!(cache.set("session:1", &session, None).await);
  let loaded: Option<Session> = cache.get("session:1").await.unwrap();
  assert_eq!(loaded, Some(session));
}

#[tokio::test]
async fn test_miss_is_distinct_from_stored_null() {
  let (_, cache) = setup().await;
  cache.set("holds-null", &Value::Null, None).await.unwrap();

  let missing: Option<Value> = cache.get("missing-key").await.unwrap();
  let null: Option<Value> = cache.get("holds-null").await.unwrap();

  assert_eq!(missing, None);
  assert_eq!(null, Some(Value::Null));
}

#[tokio::test]
async fn test_get_malformed_value_is_codec_error() {
  let (store, cache) = setup().await;
  store.set("raw", "{not json", None).await.unwrap();

  let err = cache.get::<Value>("raw").await.unwrap_err();
  match err {
    CacheError::Codec { operation, key, .. } => {
      assert_eq!(operation, "get");
      assert_eq!(key, "raw");
    }
    other => panic!("expected codec error, got {:?}", other),
  }
}

#[tokio::test]
async fn test_get_list_key_is_operation_error() {
  let (store, cache) = setup().await;
  store.rpush("queue", &["1".to_string()]).await.unwrap();

  let err = cache.get::<Value>("queue").await.unwrap_err();
  assert!(matches!(
    err,
    CacheError::Operation {
      operation: "get",
      source: BackendError::Command(_),
      ..
    }
  ));
}

// =============================================================================
// Expiry
// =============================================================================

#[tokio::test]
async fn test_ttl_semantics() {
  let (_, cache) = setup().await;
  cache.set("short", &json!("v"), Some(5)).await.unwrap();
  cache.set("forever", &json!("v"), None).await.unwrap();

  let ttl = cache.ttl("short").await.unwrap();
  assert!(ttl > 0 && ttl <= 5, "ttl was {}", ttl);
  assert_eq!(cache.ttl("forever").await.unwrap(), -1);
  assert_eq!(cache.ttl("absent").await.unwrap(), -2);
}

#[tokio::test]
async fn test_expire_and_persist() {
  let (_, cache) = setup().await;
  cache.set("k", &1, None).await.unwrap();

  assert!(cache.expire("k", 30).await.unwrap());
  assert!(cache.ttl("k").await.unwrap() > 0);
  assert!(cache.persist("k").await.unwrap());
  assert_eq!(cache.ttl("k").await.unwrap(), -1);
  assert!(!cache.persist("k").await.unwrap());
  assert!(!cache.expire("nope", 30).await.unwrap());
}

#[tokio::test]
async fn test_expired_key_is_gone() {
  let (_, cache) = setup().await;
  cache.set("blink", &"v", Some(1)).await.unwrap();
  assert!(cache.exists("blink").await.unwrap());

  tokio::time::sleep(Duration::from_millis(1100)).await;
  assert!(!cache.exists("blink").await.unwrap());
  assert_eq!(cache.get::<String>("blink").await.unwrap(), None);
}

// =============================================================================
// Delete / Counters
// =============================================================================

#[tokio::test]
async fn test_delete_counts_existing_keys() {
  let (_, cache) = setup().await;
  cache.set("a", &1, None).await.unwrap();
  cache.set("b", &2, None).await.unwrap();

  assert_eq!(cache.delete(&["a", "b", "c"]).await.unwrap(), 2);
  assert!(!cache.exists("a").await.unwrap());
}

#[tokio::test]
async fn test_delete_empty_list_skips_store() {
  let (store, cache) = setup().await;
  assert_eq!(cache.delete(&[]).await.unwrap(), 0);
  assert_eq!(store.command_count("DEL"), 0);
}

#[tokio::test]
async fn test_counters_are_native_integers() {
  let (store, cache) = setup().await;
  assert_eq!(cache.increment("hits", 1).await.unwrap(), 1);
  assert_eq!(cache.increment("hits", 10).await.unwrap(), 11);
  assert_eq!(cache.decrement("hits", 3).await.unwrap(), 8);

  // Stored as a plain integer, which also happens to be valid JSON
  assert_eq!(store.get("hits").await.unwrap().as_deref(), Some("8"));
  assert_eq!(cache.get::<i64>("hits").await.unwrap(), Some(8));
}

#[tokio::test]
async fn test_increment_non_integer_fails() {
  let (_, cache) = setup().await;
  cache.set("name", &"alice", None).await.unwrap();
  let err = cache.increment("name", 1).await.unwrap_err();
  assert!(matches!(err, CacheError::Operation { operation: "increment", .. }));
}

#[tokio::test]
async fn test_decrement_by_min_overflows_without_store_call() {
  let (store, cache) = setup().await;
  cache.increment("balance", 5).await.unwrap();

  let err = cache.decrement("balance", i64::MIN).await.unwrap_err();
  assert!(matches!(
    err,
    CacheError::Operation {
      operation: "decrement",
      source: BackendError::Command(_),
      ..
    }
  ));
  assert_eq!(store.command_count("INCRBY"), 1);
  assert_eq!(cache.get::<i64>("balance").await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_zero_ttl_is_rejected() {
  let (_, cache) = setup().await;
  let err = cache.set("flash", &1, Some(0)).await.unwrap_err();
  assert!(matches!(
    err,
    CacheError::Operation {
      operation: "set",
      source: BackendError::Command(_),
      ..
    }
  ));
  assert!(!cache.exists("flash").await.unwrap());
}

// =============================================================================
// Bulk Operations
// =============================================================================

#[tokio::test]
async fn test_get_many_empty_skips_store() {
  let (store, cache) = setup().await;
  let values: Vec<Option<Value>> = cache.get_many(&[]).await.unwrap();
  assert!(values.is_empty());
  assert_eq!(store.command_count("MGET"), 0);
}

#[tokio::test]
async fn test_set_many_then_get_many_in_order() {
  let (_, cache) = setup().await;
  cache.set_many([("k1", 1), ("k2", 2)]).await.unwrap();

  let values: Vec<Option<i64>> = cache.get_many(&["k1", "k2"]).await.unwrap();
  assert_eq!(values, vec![Some(1), Some(2)]);

  let values: Vec<Option<i64>> = cache.get_many(&["k2", "missing", "k1"]).await.unwrap();
  assert_eq!(values, vec![Some(2), None, Some(1)]);
}

#[tokio::test]
async fn test_set_many_mixed_shapes() {
  let (store, cache) = setup().await;
  let settings = vec![
    ("feature.flags".to_string(), json!({"beta": true})),
    ("feature.limit".to_string(), json!(25)),
    ("feature.tags".to_string(), json!(["a", "b"])),
  ];
  cache.set_many(settings).await.unwrap();
  assert_eq!(store.command_count("MSET"), 1);

  let flags: Option<Value> = cache.get("feature.flags").await.unwrap();
  assert_eq!(flags, Some(json!({"beta": true})));
}

#[tokio::test]
async fn test_set_many_empty_skips_store() {
  let (store, cache) = setup().await;
  cache
    .set_many(Vec::<(String, Value)>::new())
    .await
    .unwrap();
  assert_eq!(store.command_count("MSET"), 0);
}

#[tokio::test]
async fn test_get_or_set_loads_once() {
  let (_, cache) = setup().await;
  let first: String = cache
    .get_or_set("greeting", Some(60), || async { "hello".to_string() })
    .await
    .unwrap();
  let second: String = cache
    .get_or_set("greeting", Some(60), || async { "replaced".to_string() })
    .await
    .unwrap();

  assert_eq!(first, "hello");
  assert_eq!(second, "hello");
}

// =============================================================================
// Pattern Clear
// =============================================================================

#[tokio::test]
async fn test_clear_pattern_removes_matches_only() {
  let (_, cache) = setup().await;
  cache.set("x:1", &1, None).await.unwrap();
  cache.set("x:2", &2, None).await.unwrap();
  cache.set("y:1", &3, None).await.unwrap();

  assert_eq!(cache.clear_pattern("x:*").await.unwrap(), 2);
  assert!(!cache.exists("x:1").await.unwrap());
  assert!(cache.exists("y:1").await.unwrap());
  assert_eq!(cache.clear_pattern("x:*").await.unwrap(), 0);
}

/// Memory store that writes another matching key right after `KEYS` enumerates,
/// standing in for a concurrent writer
struct RacingStore {
  inner: MemoryStore,
  late_key: String,
}

#[async_trait]
impl StoreBackend for RacingStore {
  fn name(&self) -> &'static str {
    "racing"
  }
  async fn establish(&self) -> Result<(), BackendError> {
    self.inner.establish().await
  }
  async fn ping(&self) -> Result<(), BackendError> {
    self.inner.ping().await
  }
  async fn close(&self) -> Result<(), BackendError> {
    self.inner.close().await
  }
  fn deliveries(&self) -> broadcast::Receiver<Delivery> {
    self.inner.deliveries()
  }
  async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
    self.inner.get(key).await
  }
  async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), BackendError> {
    self.inner.set(key, value, ttl_secs).await
  }
  async fn del(&self, keys: &[String]) -> Result<u64, BackendError> {
    self.inner.del(keys).await
  }
  async fn exists(&self, key: &str) -> Result<bool, BackendError> {
    self.inner.exists(key).await
  }
  async fn ttl(&self, key: &str) -> Result<i64, BackendError> {
    self.inner.ttl(key).await
  }
  async fn expire(&self, key: &str, secs: u64) -> Result<bool, BackendError> {
    self.inner.expire(key, secs).await
  }
  async fn persist(&self, key: &str) -> Result<bool, BackendError> {
    self.inner.persist(key).await
  }
  async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BackendError> {
    self.inner.incr_by(key, delta).await
  }
  async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
    self.inner.mget(keys).await
  }
  async fn mset(&self, pairs: &[(String, String)]) -> Result<(), BackendError> {
    self.inner.mset(pairs).await
  }
  async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
    let keys = self.inner.keys(pattern).await?;
    self.inner.set(&self.late_key, "\"late\"", None).await?;
    Ok(keys)
  }
  async fn subscribe(&self, channel: &str) -> Result<(), BackendError> {
    self.inner.subscribe(channel).await
  }
  async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError> {
    self.inner.unsubscribe(channel).await
  }
  async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackendError> {
    self.inner.publish(channel, payload).await
  }
  async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, BackendError> {
    self.inner.rpush(key, values).await
  }
  async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, BackendError> {
    self.inner.lpush(key, values).await
  }
  async fn rpop(&self, key: &str) -> Result<Option<String>, BackendError> {
    self.inner.rpop(key).await
  }
  async fn lpop(&self, key: &str) -> Result<Option<String>, BackendError> {
    self.inner.lpop(key).await
  }
  async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BackendError> {
    self.inner.lrange(key, start, stop).await
  }
  async fn llen(&self, key: &str) -> Result<u64, BackendError> {
    self.inner.llen(key).await
  }
  async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, BackendError> {
    self.inner.lindex(key, index).await
  }
  async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), BackendError> {
    self.inner.lset(key, index, value).await
  }
  async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, BackendError> {
    self.inner.lrem(key, count, value).await
  }
  async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), BackendError> {
    self.inner.ltrim(key, start, stop).await
  }
  async fn brpop(
    &self,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError> {
    self.inner.brpop(keys, timeout).await
  }
  async fn blpop(
    &self,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError> {
    self.inner.blpop(keys, timeout).await
  }
}

#[tokio::test]
async fn test_clear_pattern_misses_keys_written_after_enumeration() {
  let store = Arc::new(RacingStore {
    inner: MemoryStore::new(),
    late_key: "x:late".into(),
  });
  let conn = ConnectionManager::with_backend(StoreConfig::memory(), store.clone());
  let cache = Cache::new(conn);

  cache.set("x:1", &1, None).await.unwrap();
  cache.set("x:2", &2, None).await.unwrap();

  // Only the keys seen by the enumeration step are deleted
  assert_eq!(cache.clear_pattern("x:*").await.unwrap(), 2);
  assert!(cache.exists("x:late").await.unwrap());
  assert_eq!(cache.get::<String>("x:late").await.unwrap().as_deref(), Some("late"));
}
