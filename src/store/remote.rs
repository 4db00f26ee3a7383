//! Redis-protocol backend

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Client, RedisError};
use std::collections::HashSet;
use std::pin::pin;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{Delivery, StoreBackend};
use crate::config::StoreConfig;
use crate::error::{BackendError, TransportError};

/// Map a client error onto transport vs. command failure
fn classify(err: RedisError) -> BackendError {
  if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
  {
    TransportError::Io(err.to_string()).into()
  } else {
    BackendError::Command(err.to_string())
  }
}

enum PubSubCommand {
  Subscribe(String, oneshot::Sender<Result<(), BackendError>>),
  Unsubscribe(String, oneshot::Sender<Result<(), BackendError>>),
}

enum PumpStep {
  Message(Option<redis::Msg>),
  Command(Option<PubSubCommand>),
}

/// Owns the subscriber connection: applies (un)subscribe requests and forwards messages
async fn run_pubsub_pump(
  mut pubsub: PubSub,
  mut commands: mpsc::UnboundedReceiver<PubSubCommand>,
  delivery_tx: broadcast::Sender<Delivery>,
) {
  loop {
    let step = {
      let mut messages = pin!(pubsub.on_message());
      tokio::select! {
        msg = messages.next() => PumpStep::Message(msg),
        cmd = commands.recv() => PumpStep::Command(cmd),
      }
    };

    match step {
      PumpStep::Message(Some(msg)) => {
        let channel = msg.get_channel_name().to_string();
        match msg.get_payload::<String>() {
          Ok(payload) => {
            let _ = delivery_tx.send(Delivery { channel, payload });
          }
          Err(e) => tracing::warn!(%channel, "Dropping non-text pubsub payload: {}", e),
        }
      }
      PumpStep::Message(None) => {
        tracing::warn!("Pubsub connection closed by the store");
        break;
      }
      PumpStep::Command(Some(PubSubCommand::Subscribe(channel, reply))) => {
        let _ = reply.send(pubsub.subscribe(&channel).await.map_err(classify));
      }
      PumpStep::Command(Some(PubSubCommand::Unsubscribe(channel, reply))) => {
        let _ = reply.send(pubsub.unsubscribe(&channel).await.map_err(classify));
      }
      PumpStep::Command(None) => break,
    }
  }
}

/// Backend talking to an external Redis-protocol server
///
/// Regular commands share one multiplexed connection, so they reach the server in
/// issue order. Subscriptions live on a second connection driven by a pump task, and
/// each blocking pop opens its own connection for the length of the wait.
pub struct RedisStore {
  client: Client,
  config: StoreConfig,
  connection: RwLock<Option<MultiplexedConnection>>,
  pubsub_tx: Mutex<Option<mpsc::UnboundedSender<PubSubCommand>>>,
  channels: Mutex<HashSet<String>>,
  delivery_tx: broadcast::Sender<Delivery>,
}

impl RedisStore {
  /// Create the backend; no connection is opened until `establish`
  pub fn new(config: StoreConfig) -> Result<Self, BackendError> {
    let client = Client::open(config.connection_url()).map_err(classify)?;
    let (delivery_tx, _) = broadcast::channel(4096);
    Ok(Self {
      client,
      config,
      connection: RwLock::new(None),
      pubsub_tx: Mutex::new(None),
      channels: Mutex::new(HashSet::new()),
      delivery_tx,
    })
  }

  fn connection(&self) -> Result<MultiplexedConnection, BackendError> {
    self
      .connection
      .read()
      .clone()
      .ok_or_else(|| TransportError::Io("no open connection".into()).into())
  }

  async fn open_connection(&self) -> Result<MultiplexedConnection, BackendError> {
    let timeout = self.config.connect_timeout();
    match tokio::time::timeout(timeout, self.client.get_multiplexed_async_connection()).await {
      Ok(result) => result.map_err(classify),
      Err(_) => Err(TransportError::Timeout(timeout).into()),
    }
  }

  async fn open_pubsub(&self) -> Result<PubSub, BackendError> {
    let timeout = self.config.connect_timeout();
    match tokio::time::timeout(timeout, self.client.get_async_pubsub()).await {
      Ok(result) => result.map_err(classify),
      Err(_) => Err(TransportError::Timeout(timeout).into()),
    }
  }

  async fn pubsub_request(
    &self,
    build: impl FnOnce(oneshot::Sender<Result<(), BackendError>>) -> PubSubCommand,
  ) -> Result<(), BackendError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let sent = match self.pubsub_tx.lock().as_ref() {
      Some(tx) => tx.send(build(reply_tx)).is_ok(),
      None => false,
    };
    if !sent {
      return Err(TransportError::Io("pubsub connection is not open".into()).into());
    }
    reply_rx
      .await
      .map_err(|_| TransportError::Io("pubsub connection lost".into()))?
  }

  async fn blocking_pop(
    &self,
    command: &str,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError> {
    // A dedicated connection keeps the wait from stalling the shared pipeline
    let mut conn = self.open_connection().await?;
    redis::cmd(command)
      .arg(keys)
      .arg(timeout.as_secs_f64())
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }
}

#[async_trait]
impl StoreBackend for RedisStore {
  fn name(&self) -> &'static str {
    "redis"
  }

  async fn establish(&self) -> Result<(), BackendError> {
    let conn = self.open_connection().await?;
    *self.connection.write() = Some(conn);

    let mut pubsub = self.open_pubsub().await?;
    let channels: Vec<String> = self.channels.lock().iter().cloned().collect();
    for channel in &channels {
      pubsub.subscribe(channel).await.map_err(classify)?;
    }
    if !channels.is_empty() {
      tracing::info!("Restored {} channel subscriptions", channels.len());
    }

    let (tx, rx) = mpsc::unbounded_channel();
    // Replacing the sender ends any previous pump
    *self.pubsub_tx.lock() = Some(tx);
    tokio::spawn(run_pubsub_pump(pubsub, rx, self.delivery_tx.clone()));
    Ok(())
  }

  async fn ping(&self) -> Result<(), BackendError> {
    let pump_alive = self
      .pubsub_tx
      .lock()
      .as_ref()
      .is_some_and(|tx| !tx.is_closed());
    if !pump_alive {
      return Err(TransportError::Io("pubsub connection lost".into()).into());
    }
    let mut conn = self.connection()?;
    redis::cmd("PING")
      .query_async::<()>(&mut conn)
      .await
      .map_err(classify)
  }

  async fn close(&self) -> Result<(), BackendError> {
    self.pubsub_tx.lock().take();
    let conn = self.connection.write().take();
    let Some(mut conn) = conn else {
      return Ok(());
    };
    match redis::cmd("QUIT").query_async::<()>(&mut conn).await {
      Ok(()) => Ok(()),
      // The server may hang up before the reply is read
      Err(e) if e.is_connection_dropped() || e.is_io_error() => Ok(()),
      Err(e) => Err(classify(e)),
    }
  }

  fn deliveries(&self) -> broadcast::Receiver<Delivery> {
    self.delivery_tx.subscribe()
  }

  async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("GET")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), BackendError> {
    let mut conn = self.connection()?;
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(secs) = ttl_secs {
      cmd.arg("EX").arg(secs);
    }
    cmd.query_async::<()>(&mut conn).await.map_err(classify)
  }

  async fn del(&self, keys: &[String]) -> Result<u64, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("DEL")
      .arg(keys)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn exists(&self, key: &str) -> Result<bool, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("EXISTS")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn ttl(&self, key: &str) -> Result<i64, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("TTL")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn expire(&self, key: &str, secs: u64) -> Result<bool, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("EXPIRE")
      .arg(key)
      .arg(secs)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn persist(&self, key: &str) -> Result<bool, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("PERSIST")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("INCRBY")
      .arg(key)
      .arg(delta)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("MGET")
      .arg(keys)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn mset(&self, pairs: &[(String, String)]) -> Result<(), BackendError> {
    let mut conn = self.connection()?;
    let mut cmd = redis::cmd("MSET");
    for (key, value) in pairs {
      cmd.arg(key).arg(value);
    }
    cmd.query_async::<()>(&mut conn).await.map_err(classify)
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("KEYS")
      .arg(pattern)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn subscribe(&self, channel: &str) -> Result<(), BackendError> {
    let name = channel.to_string();
    self
      .pubsub_request(|reply| PubSubCommand::Subscribe(name, reply))
      .await?;
    self.channels.lock().insert(channel.to_string());
    Ok(())
  }

  async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError> {
    self.channels.lock().remove(channel);
    let name = channel.to_string();
    self
      .pubsub_request(|reply| PubSubCommand::Unsubscribe(name, reply))
      .await
  }

  async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("PUBLISH")
      .arg(channel)
      .arg(payload)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("RPUSH")
      .arg(key)
      .arg(values)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("LPUSH")
      .arg(key)
      .arg(values)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn rpop(&self, key: &str) -> Result<Option<String>, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("RPOP")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn lpop(&self, key: &str) -> Result<Option<String>, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("LPOP")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("LRANGE")
      .arg(key)
      .arg(start)
      .arg(stop)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn llen(&self, key: &str) -> Result<u64, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("LLEN")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("LINDEX")
      .arg(key)
      .arg(index)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("LSET")
      .arg(key)
      .arg(index)
      .arg(value)
      .query_async::<()>(&mut conn)
      .await
      .map_err(classify)
  }

  async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("LREM")
      .arg(key)
      .arg(count)
      .arg(value)
      .query_async(&mut conn)
      .await
      .map_err(classify)
  }

  async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), BackendError> {
    let mut conn = self.connection()?;
    redis::cmd("LTRIM")
      .arg(key)
      .arg(start)
      .arg(stop)
      .query_async::<()>(&mut conn)
      .await
      .map_err(classify)
  }

  async fn brpop(
    &self,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError> {
    self.blocking_pop("BRPOP", keys, timeout).await
  }

  async fn blpop(
    &self,
    keys: &[String],
    timeout: Duration,
  ) -> Result<Option<(String, String)>, BackendError> {
    self.blocking_pop("BLPOP", keys, timeout).await
  }
}
