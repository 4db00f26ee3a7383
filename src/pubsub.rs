//! Pub/sub registry
//!
//! Keeps one store-level subscription per channel no matter how many local handlers
//! listen on it. A router task reads store deliveries and forwards each message to a
//! per-channel dispatcher task, which runs the channel's handlers in registration order.
//! Handlers therefore never run on the connection's I/O task, and one failing (or
//! panicking) handler does not stop the others.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::{self, StoreValue};
use crate::connection::ConnectionManager;
use crate::error::{BackendError, PubSubError};
use crate::store::Delivery;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A decoded message received on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
  pub channel: String,
  pub payload: StoreValue,
}

/// Identifies one registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
  fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl std::fmt::Display for HandlerId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Receives messages for the channels it is registered on
pub trait MessageHandler: Send + Sync + 'static {
  fn handle(&self, message: &ChannelMessage) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
  F: Fn(&ChannelMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
{
  fn handle(&self, message: &ChannelMessage) -> Result<(), HandlerError> {
    self(message)
  }
}

/// Forward messages into a channel, for consumers that prefer to `recv().await`
impl MessageHandler for mpsc::UnboundedSender<ChannelMessage> {
  fn handle(&self, message: &ChannelMessage) -> Result<(), HandlerError> {
    self
      .send(message.clone())
      .map_err(|_| "message receiver dropped".into())
  }
}

type HandlerList = Arc<RwLock<Vec<(HandlerId, Arc<dyn MessageHandler>)>>>;

struct ChannelRecord {
  handlers: HandlerList,
  tx: mpsc::UnboundedSender<ChannelMessage>,
}

/// Runs every handler of one channel, in registration order, for each message
async fn dispatch_channel(
  channel: String,
  handlers: HandlerList,
  mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
) {
  while let Some(message) = rx.recv().await {
    let snapshot: Vec<_> = handlers.read().iter().cloned().collect();
    for (id, handler) in snapshot {
      match catch_unwind(AssertUnwindSafe(|| handler.handle(&message))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(%channel, handler = %id, "Message handler failed: {}", e),
        Err(_) => tracing::error!(%channel, handler = %id, "Message handler panicked"),
      }
    }
  }
  tracing::debug!(%channel, "Channel dispatcher stopped");
}

/// Reads store deliveries and hands each one to its channel's dispatcher
async fn route_deliveries(
  mut deliveries: broadcast::Receiver<Delivery>,
  channels: Arc<RwLock<HashMap<String, ChannelRecord>>>,
) {
  loop {
    let delivery = match deliveries.recv().await {
      Ok(delivery) => delivery,
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        tracing::warn!("Pubsub router fell behind, {} messages skipped", skipped);
        continue;
      }
      Err(broadcast::error::RecvError::Closed) => break,
    };

    let payload = match codec::decode::<StoreValue>(&delivery.payload) {
      Ok(payload) => payload,
      Err(e) => {
        tracing::warn!(channel = %delivery.channel, "Dropping undecodable message: {}", e);
        continue;
      }
    };

    let routes = channels.read();
    match routes.get(&delivery.channel) {
      Some(record) => {
        let _ = record.tx.send(ChannelMessage {
          channel: delivery.channel,
          payload,
        });
      }
      None => tracing::debug!(channel = %delivery.channel, "Message for channel without handlers"),
    }
  }
}

/// Channel subscription bookkeeping plus message fan-out
pub struct PubSub {
  conn: Arc<ConnectionManager>,
  channels: Arc<RwLock<HashMap<String, ChannelRecord>>>,
  /// Serializes subscribe/unsubscribe so a channel is never subscribed twice
  ops: Mutex<()>,
  router: JoinHandle<()>,
}

impl PubSub {
  /// Create the registry and start routing deliveries; must be called inside a Tokio runtime
  pub fn new(conn: Arc<ConnectionManager>) -> Self {
    let channels = Arc::new(RwLock::new(HashMap::new()));
    let router = tokio::spawn(route_deliveries(
      conn.backend().deliveries(),
      channels.clone(),
    ));
    Self {
      conn,
      channels,
      ops: Mutex::new(()),
      router,
    }
  }

  fn failed(operation: &'static str, channel: &str, source: BackendError) -> PubSubError {
    tracing::error!(operation, channel, "Pubsub operation failed: {}", source);
    PubSubError::Operation {
      operation,
      channel: channel.to_string(),
      source,
    }
  }

  /// Register `handler` on `channel`
  ///
  /// The first handler for a channel creates the store-level subscription; later ones
  /// only join the local list. Registering the same handler twice runs it twice.
  pub async fn subscribe<H: MessageHandler>(
    &self,
    channel: &str,
    handler: H,
  ) -> Result<HandlerId, PubSubError> {
    self.subscribe_shared(channel, Arc::new(handler)).await
  }

  /// Register one handler on several channels, in order
  ///
  /// Stops at the first failure; channels already subscribed stay subscribed.
  pub async fn subscribe_many<H: MessageHandler>(
    &self,
    channels: &[&str],
    handler: H,
  ) -> Result<Vec<HandlerId>, PubSubError> {
    let handler: Arc<dyn MessageHandler> = Arc::new(handler);
    let mut ids = Vec::with_capacity(channels.len());
    for channel in channels {
      ids.push(self.subscribe_shared(channel, handler.clone()).await?);
    }
    Ok(ids)
  }

  /// Register a channel receiver instead of a callback
  pub async fn subscribe_receiver(
    &self,
    channel: &str,
  ) -> Result<(HandlerId, mpsc::UnboundedReceiver<ChannelMessage>), PubSubError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.subscribe(channel, tx).await?;
    Ok((id, rx))
  }

  async fn subscribe_shared(
    &self,
    channel: &str,
    handler: Arc<dyn MessageHandler>,
  ) -> Result<HandlerId, PubSubError> {
    let _ops = self.ops.lock().await;
    let id = HandlerId::new();

    {
      let channels = self.channels.read();
      if let Some(record) = channels.get(channel) {
        record.handlers.write().push((id, handler));
        return Ok(id);
      }
    }

    // The record goes in first so deliveries racing the subscribe reply are routed
    let handlers: HandlerList = Arc::new(RwLock::new(vec![(id, handler)]));
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(dispatch_channel(channel.to_string(), handlers.clone(), rx));
    self
      .channels
      .write()
      .insert(channel.to_string(), ChannelRecord { handlers, tx });

    let subscribed = self
      .conn
      .execute("subscribe", |store| store.subscribe(channel))
      .await;
    if let Err(e) = subscribed {
      self.channels.write().remove(channel);
      return Err(Self::failed("subscribe", channel, e));
    }

    tracing::info!(channel, "Subscribed to channel");
    Ok(id)
  }

  /// Drop every handler on `channel` and the store-level subscription
  ///
  /// Returns `false` when nothing was subscribed. There is no way to remove a single
  /// handler here; use [`PubSub::remove_handler`] with the id from `subscribe`.
  pub async fn unsubscribe(&self, channel: &str) -> Result<bool, PubSubError> {
    let _ops = self.ops.lock().await;
    if !self.channels.read().contains_key(channel) {
      return Ok(false);
    }

    self
      .conn
      .execute("unsubscribe", |store| store.unsubscribe(channel))
      .await
      .map_err(|e| Self::failed("unsubscribe", channel, e))?;
    self.channels.write().remove(channel);

    tracing::info!(channel, "Unsubscribed from channel");
    Ok(true)
  }

  /// Remove one handler; the last handler out tears down the store-level subscription
  pub async fn remove_handler(&self, channel: &str, id: HandlerId) -> Result<bool, PubSubError> {
    let _ops = self.ops.lock().await;
    let last = {
      let channels = self.channels.read();
      let Some(record) = channels.get(channel) else {
        return Ok(false);
      };
      let handlers = record.handlers.read();
      if !handlers.iter().any(|(h, _)| *h == id) {
        return Ok(false);
      }
      handlers.len() == 1
    };

    if last {
      self
        .conn
        .execute("unsubscribe", |store| store.unsubscribe(channel))
        .await
        .map_err(|e| Self::failed("unsubscribe", channel, e))?;
      self.channels.write().remove(channel);
      tracing::info!(channel, "Unsubscribed from channel");
    } else {
      let channels = self.channels.read();
      if let Some(record) = channels.get(channel) {
        record.handlers.write().retain(|(h, _)| *h != id);
      }
    }
    Ok(true)
  }

  /// Encode and publish `message`; returns how many receivers the store reached
  ///
  /// The count comes from the store, so subscribers in other processes are included.
  pub async fn publish<T: Serialize + ?Sized>(
    &self,
    channel: &str,
    message: &T,
  ) -> Result<u64, PubSubError> {
    let payload = codec::encode(message).map_err(|source| {
      tracing::error!(channel, "Pubsub message could not be encoded: {}", source);
      PubSubError::Codec {
        operation: "publish",
        channel: channel.to_string(),
        source,
      }
    })?;

    self
      .conn
      .execute("publish", |store| store.publish(channel, &payload))
      .await
      .map_err(|e| Self::failed("publish", channel, e))
  }

  /// Channels with at least one registered handler, sorted
  pub fn subscribed_channels(&self) -> Vec<String> {
    let mut channels: Vec<String> = self.channels.read().keys().cloned().collect();
    channels.sort();
    channels
  }

  pub fn handler_count(&self, channel: &str) -> usize {
    self
      .channels
      .read()
      .get(channel)
      .map(|record| record.handlers.read().len())
      .unwrap_or(0)
  }

  /// Unsubscribe from every channel; keeps going past failures and reports the first
  pub async fn shutdown(&self) -> Result<(), PubSubError> {
    let mut first_error = None;
    for channel in self.subscribed_channels() {
      if let Err(e) = self.unsubscribe(&channel).await {
        first_error.get_or_insert(e);
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

impl Drop for PubSub {
  fn drop(&mut self) {
    self.router.abort();
  }
}
