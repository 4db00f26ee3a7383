//! Error taxonomy for the store client
//!
//! Transport failures are retried by the connection manager; everything else is
//! logged where it happens and handed back to the caller unchanged.

use std::time::Duration;
use thiserror::Error;

use crate::connection::ConnectionState;

/// Connection-level failure (store lost, unreachable, or shut down)
#[derive(Debug, Clone, Error)]
pub enum TransportError {
  #[error("store connection is not ready (state: {0})")]
  NotReady(ConnectionState),

  #[error("store connection is closed")]
  Closed,

  #[error("store unreachable after {attempts} reconnect attempts: {message}")]
  RetriesExhausted { attempts: u32, message: String },

  #[error("no response from store within {0:?}")]
  Timeout(Duration),

  #[error("store is unavailable")]
  Unavailable,

  #[error("transport failure: {0}")]
  Io(String),
}

/// Failure reported by a store backend for a single command
#[derive(Debug, Clone, Error)]
pub enum BackendError {
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// The store understood the command and refused it (WRONGTYPE, index out of range, ...)
  #[error("store rejected command: {0}")]
  Command(String),
}

impl BackendError {
  pub fn is_transport(&self) -> bool {
    matches!(self, BackendError::Transport(_))
  }
}

/// Value could not be converted to or from its stored text form
#[derive(Debug, Error)]
pub enum CodecError {
  #[error("failed to encode value: {0}")]
  Serialization(#[source] serde_json::Error),

  #[error("malformed stored value: {0}")]
  Deserialization(#[source] serde_json::Error),
}

/// Cache operation failure, tagged with the operation and the keys involved
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache {operation} failed for {keys:?}: {source}")]
  Operation {
    operation: &'static str,
    keys: Vec<String>,
    #[source]
    source: BackendError,
  },

  #[error("cache {operation} could not convert value for {key}: {source}")]
  Codec {
    operation: &'static str,
    key: String,
    #[source]
    source: CodecError,
  },
}

/// List/queue operation failure
#[derive(Debug, Error)]
pub enum ListError {
  #[error("list {operation} failed for {key}: {source}")]
  Operation {
    operation: &'static str,
    key: String,
    #[source]
    source: BackendError,
  },

  #[error("list {operation} could not convert value for {key}: {source}")]
  Codec {
    operation: &'static str,
    key: String,
    #[source]
    source: CodecError,
  },

  #[error("list {operation} on {key} needs at least one value")]
  EmptyPush { operation: &'static str, key: String },
}

/// Pub/sub operation failure
#[derive(Debug, Error)]
pub enum PubSubError {
  #[error("pubsub {operation} failed for channel {channel}: {source}")]
  Operation {
    operation: &'static str,
    channel: String,
    #[source]
    source: BackendError,
  },

  #[error("pubsub {operation} could not convert message for channel {channel}: {source}")]
  Codec {
    operation: &'static str,
    channel: String,
    #[source]
    source: CodecError,
  },
}

/// The store session could not be closed cleanly
#[derive(Debug, Error)]
#[error("store shutdown failed: {source}")]
pub struct ShutdownError {
  #[source]
  pub source: BackendError,
}
