//! In-memory store for tests.
//!
//! [`MemoryStore`] implements [`StreamStore`] entirely in memory: per-stream
//! append logs with monotonically increasing ids, per-group tail cursors and
//! pending sets, and blocking group reads woken by appends. It exists so the
//! publish and consume paths can be exercised end-to-end without a running
//! store, and it exposes enough introspection for tests to assert on
//! delivery, acknowledgment, and read behavior.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::client::{StoreError, StreamStore};
use crate::payload::{Job, MessageId, Payload};

struct GroupState {
    cursor: usize,
    pending: Vec<MessageId>,
    acked: Vec<MessageId>,
}

struct Inner {
    streams: HashMap<String, Vec<(MessageId, Payload)>>,
    groups: HashMap<(String, String), GroupState>,
    kv: HashMap<String, String>,
}

/// An in-memory [`StreamStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    appended: Notify,
    seq: AtomicU64,
    read_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                groups: HashMap::new(),
                kv: HashMap::new(),
            }),
            appended: Notify::new(),
            seq: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
        }
    }

    /// Number of entries appended to `stream`.
    pub fn entry_count(&self, stream: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .map_or(0, Vec::len)
    }

    /// All entries appended to `stream`, in append order.
    pub fn entries(&self, stream: &str) -> Vec<(MessageId, Payload)> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids delivered to `group` but not yet acknowledged.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<MessageId> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.pending.clone())
            .unwrap_or_default()
    }

    /// Ids acknowledged in `group`, in acknowledgment order.
    pub fn acked(&self, stream: &str, group: &str) -> Vec<MessageId> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.acked.clone())
            .unwrap_or_default()
    }

    /// Total number of `read_group` calls issued against this store.
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn append(&self, stream: &str, payload: &Payload) -> Result<MessageId, StoreError> {
        let id = MessageId::new(format!("{}-0", self.seq.fetch_add(1, Ordering::SeqCst) + 1));
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .push((id.clone(), payload.clone()));
        }
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        // Creating a group implicitly creates the stream; the group starts
        // at the current tail.
        let tail = inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .len();
        inner
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_insert(GroupState {
                cursor: tail,
                pending: Vec::new(),
                acked: Vec::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + block;
        let key = (stream.to_string(), group.to_string());

        loop {
            // Register for append wakeups before checking, so an append
            // between the check and the await is not lost.
            let mut notified = pin!(self.appended.notified());
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                let Inner {
                    streams, groups, ..
                } = &mut *inner;
                let state = groups
                    .get_mut(&key)
                    .ok_or_else(|| StoreError::Backend(format!("no such group: {group}")))?;
                let entries: &[(MessageId, Payload)] = match streams.get(stream) {
                    Some(entries) => entries.as_slice(),
                    None => &[],
                };

                if state.cursor < entries.len() {
                    let take = count.min(entries.len() - state.cursor);
                    let batch: Vec<Job> = entries[state.cursor..state.cursor + take]
                        .iter()
                        .map(|(id, payload)| Job::new(id.clone(), payload.clone()))
                        .collect();
                    state.cursor += take;
                    state.pending.extend(batch.iter().map(|job| job.id.clone()));
                    return Ok(batch);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .groups
            .get_mut(&(stream.to_string(), group.to_string()))
            .ok_or_else(|| StoreError::Backend(format!("no such group: {group}")))?;
        if let Some(pos) = state.pending.iter().position(|p| p == id) {
            state.pending.remove(pos);
            state.acked.push(id.clone());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().unwrap().kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .kv
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
