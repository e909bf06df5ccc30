//! Process-wide store handle.
//!
//! A [`SharedStore`] owns at most one [`StoreClient`] at a time, connects it
//! lazily with either the ambient (`STORE_*`) or an explicit configuration,
//! and replaces it when reconnected with a different configuration. Consumers
//! and publishers obtain the client through it; they hold non-owning
//! references and must be stopped before the store is disconnected.

use std::sync::Arc;

use deadpool_redis::Pool;
use tokio::sync::Mutex;
use tracing::info;

use crate::client::{StoreClient, StoreError, StreamStore};
use crate::config::StoreConfig;
use crate::payload::{MessageId, Payload};

struct Inner {
    client: Option<Arc<StoreClient>>,
    config: Option<StoreConfig>,
}

/// One process-wide store client, lazily (re)configured.
pub struct SharedStore {
    // Serializes connect/reconfigure/disconnect; concurrent connect callers
    // collapse into the attempt already holding this lock.
    inner: Mutex<Inner>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                client: None,
                config: None,
            }),
        }
    }

    /// Connect with the given configuration, or the ambient `STORE_*`
    /// environment configuration when `None`.
    ///
    /// Reconnecting with a configuration equal to the current one (per
    /// [`StoreConfig::matches`]) reuses the existing client; its idempotent
    /// connect returns immediately when already ready. A different
    /// configuration disconnects the existing client and replaces it.
    pub async fn connect(&self, config: Option<StoreConfig>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let config = config.unwrap_or_else(StoreConfig::from_env);

        let same_config = inner
            .config
            .as_ref()
            .is_some_and(|current| current.matches(&config));

        let client = match inner.client.clone() {
            Some(client) if same_config => client,
            existing => {
                if let Some(old) = existing {
                    info!(host = %config.host, port = config.port, "Store configuration changed, replacing client");
                    old.disconnect().await;
                }
                let client = Arc::new(StoreClient::new(config.clone()));
                inner.client = Some(client.clone());
                inner.config = Some(config);
                client
            }
        };

        client.connect().await
    }

    /// Tear down and clear the client and its cached configuration.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(client) = inner.client.take() {
            client.disconnect().await;
        }
        inner.config = None;
    }

    /// The current client, if `connect` has been called.
    pub async fn client(&self) -> Option<Arc<StoreClient>> {
        self.inner.lock().await.client.clone()
    }

    /// The current client as the capability surface consumers are built on.
    pub async fn store(&self) -> Option<Arc<dyn StreamStore>> {
        self.client().await.map(|c| c as Arc<dyn StreamStore>)
    }

    /// The raw driver pool, for operations the wrapper does not cover.
    pub async fn pool(&self) -> Option<Pool> {
        self.client().await.and_then(|c| c.pool())
    }

    async fn ensure_ready(&self) -> Result<Arc<StoreClient>, StoreError> {
        // Awaiting the lock also awaits any connect attempt in flight.
        self.inner
            .lock()
            .await
            .client
            .clone()
            .ok_or(StoreError::NotConnected)
    }

    pub async fn append(&self, stream: &str, payload: &Payload) -> Result<MessageId, StoreError> {
        self.ensure_ready().await?.append(stream, payload).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_ready().await?.get(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_ready().await?.set(key, value).await
    }
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_fail_before_connect() {
        let store = SharedStore::new();

        let err = store.append("q", &Payload::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));

        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));

        let err = store.set("k", "v").await.unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));
    }

    #[tokio::test]
    async fn no_client_until_connect() {
        let store = SharedStore::new();
        assert!(store.client().await.is_none());
        assert!(store.pool().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_clears_state() {
        let store = SharedStore::new();
        store.disconnect().await;
        assert!(store.client().await.is_none());

        let err = store.append("q", &Payload::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));
    }
}
