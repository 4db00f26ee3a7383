//! cachebus: a shared-connection client for a Redis-compatible store
//!
//! One [`ConnectionManager`] owns the session; [`Cache`], [`PubSub`] and [`Lists`] are
//! thin typed helpers built on top of it.

pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod list;
pub mod pubsub;
pub mod store;

// Lifecycle coordinator (only compiled with server feature)
#[cfg(feature = "server")]
pub mod server;

pub use cache::Cache;
pub use codec::StoreValue;
pub use config::{RetryConfig, StoreConfig, StoreMode};
pub use connection::{
  ConnectionEvent, ConnectionEventKind, ConnectionManager, ConnectionState, RetryPolicy,
};
pub use error::{
  BackendError, CacheError, CodecError, ListError, PubSubError, ShutdownError, TransportError,
};
pub use list::{BlockingPop, Lists};
pub use pubsub::{ChannelMessage, HandlerId, MessageHandler, PubSub};
pub use store::{MemoryStore, RedisStore, StoreBackend};
