//! Publish side: validate and tag outgoing work items.
//!
//! The [`Publisher`] is a thin producer. It validates its inputs, optionally
//! tags a defensive copy of the payload with an ordering key, and delegates
//! the append to the store. The caller's payload is never mutated.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::client::{StoreError, StreamStore};
use crate::payload::{MessageId, Payload};

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// When set (and non-empty after trimming), the published item carries
    /// this value in its `_orderingKey` field, and ordered consumers will
    /// serialize it with other items sharing the key.
    pub ordering_key: Option<String>,
}

impl PublishOptions {
    pub fn with_ordering_key(key: impl Into<String>) -> Self {
        Self {
            ordering_key: Some(key.into()),
        }
    }
}

/// Errors from [`Publisher::publish`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// Input validation failed; nothing was sent to the store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Thin producer over a [`StreamStore`].
pub struct Publisher {
    store: Arc<dyn StreamStore>,
}

impl Publisher {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store }
    }

    /// Append a work item to `stream`, returning the server-assigned id.
    ///
    /// The stream name must be non-empty after trimming and the payload must
    /// carry at least one field; violations fail with
    /// [`PublishError::InvalidArgument`] before any store call.
    pub async fn publish(
        &self,
        stream: &str,
        payload: &Payload,
        options: PublishOptions,
    ) -> Result<MessageId, PublishError> {
        let stream = stream.trim();
        if stream.is_empty() {
            return Err(PublishError::InvalidArgument(
                "stream name must be a non-empty string".to_string(),
            ));
        }
        if payload.is_empty() {
            return Err(PublishError::InvalidArgument(
                "payload must carry at least one field".to_string(),
            ));
        }

        let ordering_key = options
            .ordering_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty());

        let id = match ordering_key {
            Some(key) => {
                let mut tagged = payload.clone();
                tagged.set_ordering_key(key);
                self.store.append(stream, &tagged).await?
            }
            None => self.store.append(stream, payload).await?,
        };

        debug!(stream = %stream, id = %id, ordering_key = ?ordering_key, "Published work item");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    fn payload() -> Payload {
        [("email", "a@x"), ("subject", "s")].into_iter().collect()
    }

    #[tokio::test]
    async fn publish_appends_and_returns_id() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone());

        let id = publisher
            .publish("Q1", &payload(), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(store.entry_count("Q1"), 1);
        let entries = store.entries("Q1");
        assert_eq!(entries[0].0, id);
        assert!(entries[0].1.ordering_key().is_none());
    }

    #[tokio::test]
    async fn ordering_key_is_trimmed_and_injected() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone());

        publisher
            .publish("Q1", &payload(), PublishOptions::with_ordering_key("  K1  "))
            .await
            .unwrap();

        let entries = store.entries("Q1");
        assert_eq!(entries[0].1.ordering_key(), Some("K1"));
    }

    #[tokio::test]
    async fn blank_ordering_key_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone());

        publisher
            .publish("Q1", &payload(), PublishOptions::with_ordering_key("   "))
            .await
            .unwrap();

        let entries = store.entries("Q1");
        assert!(entries[0].1.ordering_key().is_none());
    }

    #[tokio::test]
    async fn caller_payload_is_never_mutated() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store);

        let original = payload();
        publisher
            .publish("Q1", &original, PublishOptions::with_ordering_key("K1"))
            .await
            .unwrap();

        assert_eq!(original, payload());
        assert!(original.ordering_key().is_none());
    }

    #[tokio::test]
    async fn validation_fails_before_any_store_call() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone());

        let err = publisher
            .publish("   ", &payload(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidArgument(_)));

        let err = publisher
            .publish("Q1", &Payload::new(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidArgument(_)));

        assert_eq!(store.entry_count("Q1"), 0);
    }
}
