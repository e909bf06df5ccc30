//! Store client for conveyor.
//!
//! [`StreamStore`] is the capability surface the rest of the crate is built
//! against: append to a stream, ensure a consumer group, blocking group read,
//! per-message acknowledgment, and simple key get/set. [`StoreClient`] is the
//! Redis implementation over a deadpool connection pool; the in-memory
//! [`crate::testing::MemoryStore`] satisfies the same surface for tests.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> Closing -> Disconnected
//! ```
//!
//! `connect` is idempotent and single-flight: concurrent callers collapse
//! into one attempt. Commands require `Ready` and fail with
//! [`StoreError::NotReady`] otherwise.

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, AsyncCommands, RedisError};
use deadpool_redis::{Pool, Runtime};
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::payload::{Job, MessageId, Payload};

/// Fixed handshake timeout for a connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a [`StoreClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No connect was ever attempted on the owning handle.
    #[error("store was never connected")]
    NotConnected,

    /// The client is not in the `Ready` state.
    #[error("store is not ready (state: {0})")]
    NotReady(ConnectionState),

    /// The connect handshake failed or timed out.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A runtime failure from the backing store.
    #[error("store command failed: {0}")]
    Redis(#[from] RedisError),

    /// A runtime failure from a non-Redis implementation of the capability
    /// surface.
    #[error("store failure: {0}")]
    Backend(String),

    /// The connection pool could not hand out a connection.
    #[error("connection pool error: {0}")]
    Pool(String),
}

/// Capability surface over the backing log store.
///
/// Contract notes:
/// - `append` flattens payload fields in insertion order and returns the
///   server-assigned id.
/// - `create_group` creates the stream if needed, starts the group at the
///   tail, and absorbs the "group already exists" signal as success.
/// - `read_group` delivers only never-before-delivered messages, blocking up
///   to `block` for availability; an empty result means the call timed out.
/// - `ack` removes a delivered message from the group's pending set.
#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn append(&self, stream: &str, payload: &Payload) -> Result<MessageId, StoreError>;

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

struct Shared {
    state: ConnectionState,
    pool: Option<Pool>,
}

/// Redis implementation of [`StreamStore`] over a deadpool connection pool.
pub struct StoreClient {
    config: StoreConfig,
    shared: RwLock<Shared>,
    // Serializes connect/disconnect so concurrent connect calls collapse
    // into a single attempt.
    flight: Mutex<()>,
}

impl StoreClient {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            shared: RwLock::new(Shared {
                state: ConnectionState::Disconnected,
                pool: None,
            }),
            flight: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionState {
        self.shared.read().unwrap().state
    }

    /// The underlying driver pool, for operations this wrapper does not
    /// cover. `None` until the first successful connect.
    pub fn pool(&self) -> Option<Pool> {
        self.shared.read().unwrap().pool.clone()
    }

    /// Open the connection and wait for the store's ready signal.
    ///
    /// Idempotent: returns immediately when already `Ready`. Concurrent
    /// callers await the in-flight attempt and share its outcome. The ready
    /// signal is a PING round-trip, not merely an established socket; the
    /// attempt fails with [`StoreError::Connect`] if it is not received
    /// within 10 s.
    pub async fn connect(&self) -> Result<(), StoreError> {
        let _flight = self.flight.lock().await;

        // A concurrent caller may have finished the handshake while this
        // one waited on the flight lock.
        if self.status() == ConnectionState::Ready {
            return Ok(());
        }

        let stale = {
            let mut shared = self.shared.write().unwrap();
            shared.state = ConnectionState::Connecting;
            shared.pool.take()
        };
        if let Some(pool) = stale {
            pool.close();
        }

        let url = self.config.url();
        debug!(host = %self.config.host, port = self.config.port, db = self.config.db, "Connecting to store");

        let pool = match deadpool_redis::Config::from_url(url).create_pool(Some(Runtime::Tokio1)) {
            Ok(pool) => pool,
            Err(e) => {
                self.shared.write().unwrap().state = ConnectionState::Disconnected;
                return Err(StoreError::Connect(e.to_string()));
            }
        };

        let handshake = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| StoreError::Pool(e.to_string()))?;
            let _: String = cmd("PING").query_async(&mut conn).await?;
            Ok::<(), StoreError>(())
        })
        .await;

        match handshake {
            Ok(Ok(())) => {
                let mut shared = self.shared.write().unwrap();
                shared.state = ConnectionState::Ready;
                shared.pool = Some(pool);
                info!(host = %self.config.host, port = self.config.port, "Store connection ready");
                Ok(())
            }
            Ok(Err(e)) => {
                pool.close();
                self.shared.write().unwrap().state = ConnectionState::Disconnected;
                Err(StoreError::Connect(e.to_string()))
            }
            Err(_) => {
                pool.close();
                self.shared.write().unwrap().state = ConnectionState::Disconnected;
                Err(StoreError::Connect(format!(
                    "no ready signal within {}s",
                    CONNECT_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Tear the connection down. Never fails, including on clients that were
    /// never connected.
    pub async fn disconnect(&self) {
        let _flight = self.flight.lock().await;

        let pool = {
            let mut shared = self.shared.write().unwrap();
            if shared.state == ConnectionState::Disconnected && shared.pool.is_none() {
                return;
            }
            shared.state = ConnectionState::Closing;
            shared.pool.take()
        };

        if let Some(pool) = pool {
            pool.close();
        }

        self.shared.write().unwrap().state = ConnectionState::Disconnected;
        debug!("Store connection closed");
    }

    fn ready_pool(&self) -> Result<Pool, StoreError> {
        let shared = self.shared.read().unwrap();
        match (&shared.state, &shared.pool) {
            (ConnectionState::Ready, Some(pool)) => Ok(pool.clone()),
            (state, _) => Err(StoreError::NotReady(*state)),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.ready_pool()?
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

fn is_busygroup(err: &RedisError) -> bool {
    err.to_string().contains("BUSYGROUP")
}

#[async_trait]
impl StreamStore for StoreClient {
    async fn append(&self, stream: &str, payload: &Payload) -> Result<MessageId, StoreError> {
        let mut conn = self.conn().await?;

        let mut xadd = cmd("XADD");
        xadd.arg(stream).arg("*");
        for (field, value) in payload.iter() {
            xadd.arg(field).arg(value);
        }

        let id: String = xadd.query_async(&mut conn).await?;
        Ok(MessageId::from(id))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;

        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if is_busygroup(&e) => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn().await?;

        // Parsing as nested key/value pairs keeps the wire field order.
        type StreamBatch = Vec<(String, Vec<(String, Vec<(String, String)>)>)>;

        let reply: Option<StreamBatch> = cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::new();
        if let Some(batch) = reply {
            for (_, entries) in batch {
                for (id, fields) in entries {
                    jobs.push(Job::new(
                        MessageId::from(id),
                        fields.into_iter().collect::<Payload>(),
                    ));
                }
            }
        }
        Ok(jobs)
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;

        let acked: u64 = cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;

        if acked == 0 {
            warn!(stream = %stream, group = %group, id = %id, "Ack matched no pending message");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_is_disconnected() {
        let client = StoreClient::new(StoreConfig::default());
        assert_eq!(client.status(), ConnectionState::Disconnected);
        assert!(client.pool().is_none());
    }

    #[tokio::test]
    async fn commands_require_ready() {
        let client = StoreClient::new(StoreConfig::default());

        let err = client.append("q", &Payload::new()).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotReady(ConnectionState::Disconnected)
        ));

        let err = client.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::NotReady(_)));
    }

    #[tokio::test]
    async fn disconnect_is_safe_when_never_connected() {
        let client = StoreClient::new(StoreConfig::default());
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.status(), ConnectionState::Disconnected);
    }

    #[test]
    fn busygroup_detection() {
        let err = RedisError::from((
            deadpool_redis::redis::ErrorKind::ExtensionError,
            "BUSYGROUP",
            "Consumer Group name already exists".to_string(),
        ));
        assert!(is_busygroup(&err));

        let err = RedisError::from((
            deadpool_redis::redis::ErrorKind::ResponseError,
            "ERR",
            "something else".to_string(),
        ));
        assert!(!is_busygroup(&err));
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
