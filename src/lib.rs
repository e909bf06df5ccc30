//! # Conveyor
//!
//! Durable work queues over Redis Streams: publish flat-field work items
//! into named streams, consume them through consumer groups with bounded
//! concurrency, optional per-key FIFO ordering, at-least-once delivery, and
//! cooperative graceful shutdown.
//!
//! ## Architecture
//!
//! ```text
//! Producer -> Publisher -> StoreClient -> Redis Stream
//!                                             |
//!                          Consumer <- XREADGROUP (consumer group)
//!                             |
//!                          JobHandler -> ack on success
//! ```
//!
//! ## Modules
//!
//! - [`payload`]: the wire payload and message id types
//! - [`config`]: environment-driven store and log configuration
//! - [`client`]: the [`StreamStore`] capability surface and its Redis client
//! - [`store`]: the process-wide [`SharedStore`] handle
//! - [`publisher`]: the publish side
//! - [`consumer`]: the poll/dispatch engine
//! - [`handlers`]: the [`JobHandler`] trait and built-ins
//! - [`shutdown`]: OS signal wiring for worker shells
//! - [`telemetry`]: logging initialization
//! - [`testing`]: an in-memory store for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use conveyor::{Consumer, ConsumerOptions, Payload, Publisher, PublishOptions, SharedStore};
//! use std::sync::Arc;
//!
//! let shared = SharedStore::new();
//! shared.connect(None).await?;
//!
//! let store = shared.store().await.expect("connected");
//! let publisher = Publisher::new(store.clone());
//!
//! let payload: Payload = [("email", "a@example.com")].into_iter().collect();
//! publisher.publish("emails", &payload, PublishOptions::with_ordering_key("a@example.com")).await?;
//!
//! let consumer = Consumer::new(store, "emails", Arc::new(MyHandler), ConsumerOptions {
//!     concurrency: 4,
//!     process_ordered_by_key: true,
//!     ..ConsumerOptions::default()
//! })?;
//! consumer.start().await?;
//! ```

pub mod client;
pub mod config;
pub mod consumer;
pub mod handlers;
pub mod payload;
pub mod publisher;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod testing;

// Re-export commonly used types at crate root
pub use client::{ConnectionState, StoreClient, StoreError, StreamStore};
pub use config::{LogConfig, Profile, StoreConfig};
pub use consumer::{Consumer, ConsumerError, ConsumerOptions, ConsumerState};
pub use handlers::{HandlerError, JobHandler, LogHandler};
pub use payload::{Job, MessageId, Payload};
pub use publisher::{PublishError, PublishOptions, Publisher};
pub use shutdown::ShutdownSignal;
pub use store::SharedStore;

/// Reserved payload field marking an item as keyed for ordered consumption.
pub const ORDERING_KEY_FIELD: &str = "_orderingKey";
