//! Connection manager: one supervised session to the backing store
//!
//! A supervisor task owns (re)connection. Commands go through [`ConnectionManager::execute`],
//! which waits out outages when offline queueing is enabled and re-issues a command after
//! a transport failure, up to `max_retries_per_request` times.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};

use crate::config::{RetryConfig, StoreConfig};
use crate::error::{BackendError, ShutdownError, TransportError};
use crate::store::{open_backend, StoreBackend};

/// Interval between liveness probes while the session is ready
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
  Connecting,
  /// Transport open, handshake not yet confirmed
  Connected,
  /// Safe to issue commands
  Ready,
  Reconnecting,
  Closing,
  Closed,
}

impl std::fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectionState::Connecting => write!(f, "connecting"),
      ConnectionState::Connected => write!(f, "connected"),
      ConnectionState::Ready => write!(f, "ready"),
      ConnectionState::Reconnecting => write!(f, "reconnecting"),
      ConnectionState::Closing => write!(f, "closing"),
      ConnectionState::Closed => write!(f, "closed"),
    }
  }
}

/// What happened to the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ConnectionEventKind {
  Connecting,
  Connected,
  Ready,
  Error { message: String },
  Reconnecting { attempt: u32, delay_ms: u64 },
  Closed,
}

/// A point-in-time lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
  #[serde(flatten)]
  pub kind: ConnectionEventKind,
  pub at: DateTime<Utc>,
}

/// Reconnect delay policy: `min(attempt * step, max_delay)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  pub step: Duration,
  pub max_delay: Duration,
  /// `None` retries forever
  pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from(&RetryConfig::default())
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      step: Duration::from_millis(config.step_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
      max_attempts: config.max_attempts,
    }
  }
}

impl RetryPolicy {
  /// Delay before reconnect `attempt` (1-based), or `None` once attempts are exhausted
  pub fn delay(&self, attempt: u32) -> Option<Duration> {
    if self.max_attempts.is_some_and(|max| attempt > max) {
      return None;
    }
    Some(self.step.saturating_mul(attempt).min(self.max_delay))
  }
}

#[derive(Debug, Clone)]
struct Status {
  state: ConnectionState,
  /// Reconnect attempts made over the manager's lifetime
  reconnects: u64,
  /// Set when the retry policy gave up: (attempts, last error)
  gave_up: Option<(u32, String)>,
}

/// Decrements the in-flight counter when a command finishes
struct InFlight<'a> {
  count: &'a AtomicUsize,
  drained: &'a Notify,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.drained.notify_waiters();
    }
  }
}

/// Owns the single session to the backing store
pub struct ConnectionManager {
  backend: Arc<dyn StoreBackend>,
  config: StoreConfig,
  policy: RetryPolicy,
  status: watch::Sender<Status>,
  events: broadcast::Sender<ConnectionEvent>,
  shutdown: watch::Sender<bool>,
  last_error: parking_lot::Mutex<Option<String>>,
  in_flight: AtomicUsize,
  drained: Notify,
  close_requested: AtomicBool,
}

impl ConnectionManager {
  /// Build the backend named by `config.mode` and start connecting in the background
  pub fn connect(config: StoreConfig) -> Result<Arc<Self>, BackendError> {
    let backend = open_backend(&config)?;
    Ok(Self::with_backend(config, backend))
  }

  /// Start a manager around an existing backend; must be called inside a Tokio runtime
  pub fn with_backend(config: StoreConfig, backend: Arc<dyn StoreBackend>) -> Arc<Self> {
    let (status, _) = watch::channel(Status {
      state: ConnectionState::Connecting,
      reconnects: 0,
      gave_up: None,
    });
    let (events, _) = broadcast::channel(256);
    let (shutdown, _) = watch::channel(false);

    let manager = Arc::new(Self {
      backend,
      policy: RetryPolicy::from(&config.retry),
      config,
      status,
      events,
      shutdown,
      last_error: parking_lot::Mutex::new(None),
      in_flight: AtomicUsize::new(0),
      drained: Notify::new(),
      close_requested: AtomicBool::new(false),
    });

    tracing::info!(
      "Connecting to {} store at {}",
      manager.backend.name(),
      manager.config.redacted_url()
    );
    tokio::spawn(manager.clone().supervise());
    manager
  }

  pub fn backend(&self) -> &Arc<dyn StoreBackend> {
    &self.backend
  }

  pub fn config(&self) -> &StoreConfig {
    &self.config
  }

  /// Current lifecycle state
  pub fn state(&self) -> ConnectionState {
    self.status.borrow().state
  }

  /// Subscribe to lifecycle events from now on
  pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.events.subscribe()
  }

  /// Wait until the session is ready, giving up after `timeout`
  pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), TransportError> {
    let mut rx = self.status.subscribe();
    let waited = tokio::time::timeout(
      timeout,
      wait_status(&mut rx, |s| {
        matches!(s.state, ConnectionState::Ready | ConnectionState::Closed)
      }),
    )
    .await;

    match waited {
      Ok(Ok(status)) if status.state == ConnectionState::Ready => Ok(()),
      Ok(Ok(status)) => Err(closed_error(&status)),
      Ok(Err(e)) => Err(e),
      Err(_) => Err(TransportError::Timeout(timeout)),
    }
  }

  /// Liveness probe; fails fast when the session is down and never outlasts the connect timeout
  pub async fn ping(&self) -> Result<Duration, TransportError> {
    let state = self.state();
    if state != ConnectionState::Ready {
      return Err(TransportError::NotReady(state));
    }

    let timeout = self.config.connect_timeout();
    let started = Instant::now();
    match tokio::time::timeout(timeout, self.backend.ping()).await {
      Ok(Ok(())) => Ok(started.elapsed()),
      Ok(Err(e)) => {
        tracing::warn!("Store ping failed: {}", e);
        match e {
          BackendError::Transport(t) => {
            self.mark_broken(&t);
            Err(t)
          }
          BackendError::Command(msg) => Err(TransportError::Io(msg)),
        }
      }
      Err(_) => {
        tracing::warn!("Store ping timed out after {:?}", timeout);
        Err(TransportError::Timeout(timeout))
      }
    }
  }

  /// `true` when a ping succeeds
  pub async fn is_healthy(&self) -> bool {
    self.ping().await.is_ok()
  }

  /// Run one store command under the offline-queue and per-request retry policy
  pub async fn execute<'a, T, F, Fut>(
    &'a self,
    operation: &'static str,
    mut command: F,
  ) -> Result<T, BackendError>
  where
    F: FnMut(&'a dyn StoreBackend) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
  {
    let _guard = self.begin()?;
    let mut retries = 0u32;

    loop {
      self.await_ready().await?;

      match command(self.backend.as_ref()).await {
        Err(BackendError::Transport(e)) => {
          self.mark_broken(&e);
          retries += 1;
          let exhausted = self
            .config
            .max_retries_per_request
            .is_some_and(|max| retries > max);
          if exhausted || !self.config.offline_queue {
            return Err(e.into());
          }
          tracing::debug!(operation, retries, "Re-issuing command after transport failure");
        }
        other => return other,
      }
    }
  }

  /// Drain in-flight commands and close the session
  ///
  /// A second call is a no-op. A failed close is logged and returned to the caller.
  /// The backend is closed even when the retry policy already gave up.
  pub async fn disconnect(&self, drain_timeout: Duration) -> Result<(), ShutdownError> {
    if self.close_requested.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    // Only fails when the supervisor already moved to `Closed`
    let was_open = self.advance(ConnectionState::Closing);

    tracing::info!("Closing store connection");
    let _ = self.shutdown.send(true);

    if !self.wait_drained(drain_timeout).await {
      tracing::warn!(
        "{} store commands still in flight after {:?}",
        self.in_flight.load(Ordering::SeqCst),
        drain_timeout
      );
    }

    let result = self.backend.close().await;
    if was_open {
      self.set_state(ConnectionState::Closed);
      self.emit(ConnectionEventKind::Closed);
    }

    match result {
      Ok(()) => Ok(()),
      Err(source) => {
        tracing::error!("Store connection did not close cleanly: {}", source);
        Err(ShutdownError { source })
      }
    }
  }

  fn begin(&self) -> Result<InFlight<'_>, TransportError> {
    self.in_flight.fetch_add(1, Ordering::SeqCst);
    let guard = InFlight {
      count: &self.in_flight,
      drained: &self.drained,
    };
    let status = self.status.borrow().clone();
    match status.state {
      ConnectionState::Closing => Err(TransportError::Closed),
      ConnectionState::Closed => Err(closed_error(&status)),
      _ => Ok(guard),
    }
  }

  async fn wait_drained(&self, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let mut drained = pin!(self.drained.notified());
      drained.as_mut().enable();
      if self.in_flight.load(Ordering::SeqCst) == 0 {
        return true;
      }
      if tokio::time::timeout_at(deadline, drained).await.is_err() {
        return false;
      }
    }
  }

  /// Wait for `Ready` (offline queue) or fail fast (no offline queue)
  async fn await_ready(&self) -> Result<(), TransportError> {
    let (state, start) = {
      let status = self.status.borrow();
      match status.state {
        ConnectionState::Ready => return Ok(()),
        ConnectionState::Closing => return Err(TransportError::Closed),
        ConnectionState::Closed => return Err(closed_error(&status)),
        state => (state, status.reconnects),
      }
    };

    if !self.config.offline_queue {
      return Err(TransportError::NotReady(state));
    }

    let budget = self.config.max_retries_per_request;
    let mut rx = self.status.subscribe();
    let status = wait_status(&mut rx, |s| {
      matches!(
        s.state,
        ConnectionState::Ready | ConnectionState::Closing | ConnectionState::Closed
      ) || budget.is_some_and(|max| s.reconnects - start > u64::from(max))
    })
    .await?;

    match status.state {
      ConnectionState::Ready => Ok(()),
      ConnectionState::Closing => Err(TransportError::Closed),
      ConnectionState::Closed => Err(closed_error(&status)),
      _ => Err(TransportError::RetriesExhausted {
        attempts: (status.reconnects - start) as u32,
        message: self
          .last_error
          .lock()
          .clone()
          .unwrap_or_else(|| "store unavailable".into()),
      }),
    }
  }

  /// Flag a ready session as broken so the supervisor reconnects
  fn mark_broken(&self, error: &TransportError) {
    *self.last_error.lock() = Some(error.to_string());
    self.status.send_if_modified(|s| {
      if s.state == ConnectionState::Ready {
        s.state = ConnectionState::Reconnecting;
        true
      } else {
        false
      }
    });
  }

  fn set_state(&self, state: ConnectionState) {
    self.status.send_modify(|s| s.state = state);
  }

  /// Move to `state` unless the manager is already closing
  fn advance(&self, state: ConnectionState) -> bool {
    self.status.send_if_modified(|s| {
      if matches!(s.state, ConnectionState::Closing | ConnectionState::Closed) {
        false
      } else {
        s.state = state;
        true
      }
    })
  }

  fn emit(&self, kind: ConnectionEventKind) {
    match &kind {
      ConnectionEventKind::Connecting => tracing::info!("Store connecting"),
      ConnectionEventKind::Connected => tracing::info!("Store transport connected"),
      ConnectionEventKind::Ready => tracing::info!("Store connection ready"),
      ConnectionEventKind::Error { message } => tracing::warn!("Store connection error: {}", message),
      ConnectionEventKind::Reconnecting { attempt, delay_ms } => {
        tracing::warn!("Store reconnecting (attempt {}) in {}ms", attempt, delay_ms)
      }
      ConnectionEventKind::Closed => tracing::info!("Store connection closed"),
    }
    let _ = self.events.send(ConnectionEvent {
      kind,
      at: Utc::now(),
    });
  }

  fn is_shutting_down(&self) -> bool {
    *self.shutdown.borrow()
  }

  /// Open the transport and run the ready check
  async fn open_session(&self) -> Result<(), TransportError> {
    let timeout = self.config.connect_timeout();
    match tokio::time::timeout(timeout, self.backend.establish()).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => return Err(as_transport(e)),
      Err(_) => return Err(TransportError::Timeout(timeout)),
    }
    if !self.advance(ConnectionState::Connected) {
      return Err(TransportError::Closed);
    }
    self.emit(ConnectionEventKind::Connected);

    if self.config.ready_check {
      match tokio::time::timeout(timeout, self.backend.ping()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(as_transport(e)),
        Err(_) => return Err(TransportError::Timeout(timeout)),
      }
    }
    Ok(())
  }

  /// Hold a ready session until it breaks; returns `false` on shutdown
  ///
  /// `status` must be subscribed before the move to `Ready` so a command that breaks
  /// the session in between is still observed.
  async fn hold_session(
    &self,
    shutdown: &mut watch::Receiver<bool>,
    mut status: watch::Receiver<Status>,
  ) -> bool {
    if status.borrow_and_update().state != ConnectionState::Ready {
      return !self.is_shutting_down();
    }
    loop {
      tokio::select! {
        _ = shutdown.changed() => return false,
        changed = status.changed() => {
          if changed.is_err() {
            return false;
          }
          let state = status.borrow_and_update().state;
          if state != ConnectionState::Ready {
            return !self.is_shutting_down();
          }
        }
        _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
          let timeout = self.config.connect_timeout();
          let probe = tokio::time::timeout(timeout, self.backend.ping()).await;
          let failure = match probe {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(as_transport(e)),
            Err(_) => Some(TransportError::Timeout(timeout)),
          };
          if let Some(e) = failure {
            self.mark_broken(&e);
          }
        }
      }
    }
  }

  async fn supervise(self: Arc<Self>) {
    let mut shutdown = self.shutdown.subscribe();
    let mut attempt = 0u32;
    self.emit(ConnectionEventKind::Connecting);

    loop {
      if self.is_shutting_down() {
        return;
      }

      match self.open_session().await {
        Ok(()) => {
          attempt = 0;
          let status = self.status.subscribe();
          if !self.advance(ConnectionState::Ready) {
            return;
          }
          self.emit(ConnectionEventKind::Ready);

          if !self.hold_session(&mut shutdown, status).await {
            return;
          }
          let message = self
            .last_error
            .lock()
            .clone()
            .unwrap_or_else(|| "connection lost".into());
          self.emit(ConnectionEventKind::Error { message });
        }
        Err(e) => {
          if self.is_shutting_down() {
            return;
          }
          *self.last_error.lock() = Some(e.to_string());
          self.emit(ConnectionEventKind::Error {
            message: e.to_string(),
          });
        }
      }

      attempt += 1;
      let Some(delay) = self.policy.delay(attempt) else {
        let message = self
          .last_error
          .lock()
          .clone()
          .unwrap_or_else(|| "store unavailable".into());
        tracing::error!(
          "Giving up on store connection after {} attempts",
          attempt - 1
        );
        let gave_up = self.status.send_if_modified(|s| {
          if s.state == ConnectionState::Closing {
            return false;
          }
          s.state = ConnectionState::Closed;
          s.gave_up = Some((attempt - 1, message));
          true
        });
        if gave_up {
          self.emit(ConnectionEventKind::Closed);
        }
        return;
      };

      let reconnecting = self.status.send_if_modified(|s| {
        if matches!(s.state, ConnectionState::Closing | ConnectionState::Closed) {
          false
        } else {
          s.state = ConnectionState::Reconnecting;
          s.reconnects += 1;
          true
        }
      });
      if !reconnecting {
        return;
      }
      self.emit(ConnectionEventKind::Reconnecting {
        attempt,
        delay_ms: delay.as_millis() as u64,
      });

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => return,
      }
    }
  }
}

/// Wait until `done` holds for the current status
async fn wait_status(
  rx: &mut watch::Receiver<Status>,
  done: impl Fn(&Status) -> bool,
) -> Result<Status, TransportError> {
  loop {
    {
      let status = rx.borrow_and_update();
      if done(&status) {
        return Ok(status.clone());
      }
    }
    rx.changed().await.map_err(|_| TransportError::Closed)?;
  }
}

fn as_transport(error: BackendError) -> TransportError {
  match error {
    BackendError::Transport(t) => t,
    BackendError::Command(msg) => TransportError::Io(msg),
  }
}

fn closed_error(status: &Status) -> TransportError {
  match &status.gave_up {
    Some((attempts, message)) => TransportError::RetriesExhausted {
      attempts: *attempts,
      message: message.clone(),
    },
    None => TransportError::Closed,
  }
}
