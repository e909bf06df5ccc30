//! The consumer engine.
//!
//! A [`Consumer`] drives end-to-end, at-least-once consumption of one stream
//! through a consumer group:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ poll task                                                  │
//! │   blocking group read                                      │
//! │     │                                                      │
//! │     ├── unkeyed item ──► spawn handler (if a slot is free) │
//! │     │                                                      │
//! │     └── keyed item ────► per-key FIFO ──► keyed dispatch   │
//! │                          (one in-flight job per key)       │
//! └────────────────────────────────────────────────────────────┘
//!           handler Ok  → ack        handler Err → no ack
//! ```
//!
//! In-flight handler invocations are bounded by `concurrency`. With
//! `process_ordered_by_key` enabled, items sharing an `_orderingKey` are
//! handled strictly in arrival order while distinct keys run in parallel.
//!
//! Shutdown is cooperative: [`Consumer::stop`] cancels further polling,
//! waits for in-flight handlers to drain (bounded by the graceful timeout),
//! and leaves anything not yet dispatched pending in the store for
//! redelivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{StoreError, StreamStore};
use crate::handlers::JobHandler;
use crate::payload::Job;

/// Delay before re-polling when the worker pool is full (unordered mode).
const FULL_POOL_RETRY: Duration = Duration::from_secs(1);

/// Delay before re-polling after a store read failure.
const READ_ERROR_RETRY: Duration = Duration::from_secs(5);

/// Interval between in-flight checks while draining on stop.
const DRAIN_TICK: Duration = Duration::from_millis(250);

/// Consumer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Errors from consumer construction and startup.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Constructor input validation failed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tuning options for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Upper bound on concurrent handler invocations. Zero is coerced to 1
    /// with a warning.
    pub concurrency: usize,

    /// Serialize items sharing an `_orderingKey` while parallelizing across
    /// keys.
    pub process_ordered_by_key: bool,

    /// Consumer group name. Default: `group:<stream>`.
    pub group_name: Option<String>,

    /// Consumer identity, unique within the group.
    /// Default: `consumer:<stream>-<pid>-<nowMs>`.
    pub consumer_name: Option<String>,

    /// Maximum blocking time per group read.
    pub block_time: Duration,

    /// Maximum wait for in-flight handlers to drain on stop.
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            process_ordered_by_key: false,
            group_name: None,
            consumer_name: None,
            block_time: Duration::from_millis(5000),
            graceful_shutdown_timeout: Duration::from_millis(30000),
        }
    }
}

// State mutated by the poll task and by handler completions. One lock is
// the single serialization point for all of it; it is never held across an
// await.
struct Shared {
    state: ConsumerState,
    in_flight: usize,
    ordering_queues: HashMap<String, VecDeque<Job>>,
    busy_keys: HashSet<String>,
}

struct Engine {
    store: Arc<dyn StreamStore>,
    handler: Arc<dyn JobHandler>,
    stream: String,
    group: String,
    consumer_name: String,
    concurrency: usize,
    ordered: bool,
    block_time: Duration,
    shutdown_timeout: Duration,
    shared: Mutex<Shared>,
    cancel: CancellationToken,
}

/// At-least-once consumer for one stream.
pub struct Consumer {
    engine: Arc<Engine>,
}

impl Consumer {
    /// Build a consumer over `store` for `stream`, dispatching to `handler`.
    ///
    /// Fails with [`ConsumerError::InvalidArgument`] when the stream name is
    /// empty after trimming.
    pub fn new(
        store: Arc<dyn StreamStore>,
        stream: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumerOptions,
    ) -> Result<Self, ConsumerError> {
        let stream = stream.trim();
        if stream.is_empty() {
            return Err(ConsumerError::InvalidArgument(
                "stream name must be a non-empty string".to_string(),
            ));
        }

        let concurrency = if options.concurrency == 0 {
            warn!(stream = %stream, "concurrency < 1 is not allowed, using 1");
            1
        } else {
            options.concurrency
        };

        let group = options
            .group_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("group:{stream}"));

        let consumer_name = options
            .consumer_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("consumer:{stream}-{}-{}", std::process::id(), now_ms()));

        Ok(Self {
            engine: Arc::new(Engine {
                store,
                handler,
                stream: stream.to_string(),
                group,
                consumer_name,
                concurrency,
                ordered: options.process_ordered_by_key,
                block_time: options.block_time,
                shutdown_timeout: options.graceful_shutdown_timeout,
                shared: Mutex::new(Shared {
                    state: ConsumerState::Idle,
                    in_flight: 0,
                    ordering_queues: HashMap::new(),
                    busy_keys: HashSet::new(),
                }),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn stream(&self) -> &str {
        &self.engine.stream
    }

    pub fn group_name(&self) -> &str {
        &self.engine.group
    }

    pub fn consumer_name(&self) -> &str {
        &self.engine.consumer_name
    }

    pub fn state(&self) -> ConsumerState {
        self.engine.shared.lock().unwrap().state
    }

    /// Number of handler invocations currently running.
    pub fn in_flight(&self) -> usize {
        self.engine.shared.lock().unwrap().in_flight
    }

    /// Number of keyed items read from the store but not yet dispatched.
    pub fn ordered_backlog(&self) -> usize {
        self.engine.ordered_backlog()
    }

    /// Ensure the consumer group exists and start the poll task.
    ///
    /// Only valid from `Idle`; in any other state this logs a warning and
    /// returns without effect. A group-creation failure (other than the
    /// absorbed "already exists" signal) is surfaced and returns the
    /// consumer to `Idle`.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        {
            let mut shared = self.engine.shared.lock().unwrap();
            if shared.state != ConsumerState::Idle {
                warn!(
                    stream = %self.engine.stream,
                    state = ?shared.state,
                    "start ignored: consumer is not idle"
                );
                return Ok(());
            }
            shared.state = ConsumerState::Running;
        }

        if let Err(e) = self
            .engine
            .store
            .create_group(&self.engine.stream, &self.engine.group)
            .await
        {
            error!(
                stream = %self.engine.stream,
                group = %self.engine.group,
                error = %e,
                "Failed to create consumer group"
            );
            self.engine.shared.lock().unwrap().state = ConsumerState::Idle;
            return Err(e.into());
        }

        let engine = self.engine.clone();
        tokio::spawn(async move { engine.poll_loop().await });

        info!(
            stream = %self.engine.stream,
            group = %self.engine.group,
            consumer = %self.engine.consumer_name,
            concurrency = self.engine.concurrency,
            ordered = self.engine.ordered,
            "Consumer started"
        );
        Ok(())
    }

    /// Stop polling and drain in-flight work.
    ///
    /// Idempotent. Cancels any scheduled poll, then waits (checking every
    /// 250 ms) until no handler is in flight or the graceful timeout
    /// elapses. Handlers are never forcibly cancelled; on timeout a warning
    /// is logged and shutdown proceeds. Items read but never dispatched
    /// remain pending in the store and will be redelivered.
    pub async fn stop(&self) {
        {
            let mut shared = self.engine.shared.lock().unwrap();
            if shared.state == ConsumerState::Stopped {
                return;
            }
            shared.state = ConsumerState::Stopping;
        }
        self.engine.cancel.cancel();
        info!(stream = %self.engine.stream, "Consumer stopping, draining in-flight jobs");

        let deadline = tokio::time::Instant::now() + self.engine.shutdown_timeout;
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    stream = %self.engine.stream,
                    in_flight,
                    timeout_ms = self.engine.shutdown_timeout.as_millis() as u64,
                    "Graceful shutdown timed out with handlers still running"
                );
                break;
            }
            tokio::time::sleep(DRAIN_TICK).await;
        }

        if self.engine.ordered {
            let backlog = self.engine.ordered_backlog();
            if backlog > 0 {
                warn!(
                    stream = %self.engine.stream,
                    queued = backlog,
                    "Keyed jobs were read but never dispatched; they remain pending and will be redelivered"
                );
            }
        }

        self.engine.shared.lock().unwrap().state = ConsumerState::Stopped;
        info!(stream = %self.engine.stream, "Consumer stopped");
    }
}

impl Engine {
    fn state(&self) -> ConsumerState {
        self.shared.lock().unwrap().state
    }

    fn in_flight(&self) -> usize {
        self.shared.lock().unwrap().in_flight
    }

    fn ordered_backlog(&self) -> usize {
        self.shared
            .lock()
            .unwrap()
            .ordering_queues
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Sleep for `duration`, returning `true` when interrupted by stop.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        debug!(stream = %self.stream, "Poll loop started");

        loop {
            if self.state() != ConsumerState::Running {
                break;
            }

            let avail = self.concurrency.saturating_sub(self.in_flight());
            if !self.ordered && avail == 0 {
                if self.pause(FULL_POOL_RETRY).await {
                    break;
                }
                continue;
            }

            let fetch_count = if self.ordered {
                self.concurrency
            } else {
                avail.max(1)
            };

            let batch = match self
                .store
                .read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer_name,
                    fetch_count,
                    self.block_time,
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Group read failed, retrying");
                    if self.pause(READ_ERROR_RETRY).await {
                        break;
                    }
                    continue;
                }
            };

            // The stop check and batch admission share one critical section,
            // so a stop cannot slip in between them.
            let admitted = {
                let mut shared = self.shared.lock().unwrap();
                if shared.state != ConsumerState::Running {
                    None
                } else {
                    let mut unordered = Vec::new();
                    for job in batch {
                        let key = self
                            .ordered
                            .then(|| job.payload.ordering_key().map(str::to_string))
                            .flatten();
                        match key {
                            Some(key) => {
                                shared.ordering_queues.entry(key).or_default().push_back(job);
                            }
                            None => {
                                if shared.in_flight < self.concurrency {
                                    shared.in_flight += 1;
                                    unordered.push(job);
                                } else {
                                    // Pool full: the rest of the batch stays
                                    // in the pending set and will be
                                    // redelivered.
                                    break;
                                }
                            }
                        }
                    }
                    Some(unordered)
                }
            };
            let Some(unordered) = admitted else {
                // The batch was never dispatched; it stays pending in the
                // store and will be redelivered.
                break;
            };

            for job in unordered {
                self.clone().spawn_job(job, None);
            }
            if self.ordered {
                self.clone().dispatch_ordered();
            }
            // Re-poll immediately.
        }

        debug!(stream = %self.stream, "Poll loop exited");
    }

    /// Admit eligible keyed jobs to the pool: for each key with queued items
    /// that is not already busy, dispatch the head of its FIFO while a slot
    /// is free. Keys whose FIFO empties are dropped from the mapping.
    fn dispatch_ordered(self: Arc<Self>) {
        let ready = {
            let mut shared = self.shared.lock().unwrap();
            let mut ready = Vec::new();
            // No admissions once a stop has begun; whatever is still queued
            // stays pending in the store.
            while shared.state == ConsumerState::Running && shared.in_flight < self.concurrency {
                let candidate = shared
                    .ordering_queues
                    .iter()
                    .find(|(key, queue)| {
                        !queue.is_empty() && !shared.busy_keys.contains(key.as_str())
                    })
                    .map(|(key, _)| key.clone());
                let Some(key) = candidate else { break };

                let Some(job) = shared
                    .ordering_queues
                    .get_mut(&key)
                    .and_then(VecDeque::pop_front)
                else {
                    break;
                };
                if shared
                    .ordering_queues
                    .get(&key)
                    .is_some_and(VecDeque::is_empty)
                {
                    shared.ordering_queues.remove(&key);
                }

                shared.busy_keys.insert(key.clone());
                shared.in_flight += 1;
                ready.push((job, key));
            }
            ready
        };

        for (job, key) in ready {
            self.clone().spawn_job(job, Some(key));
        }
    }

    fn spawn_job(self: Arc<Self>, job: Job, key: Option<String>) {
        tokio::spawn(async move {
            self.execute_job(job, key.as_deref()).await;

            {
                let mut shared = self.shared.lock().unwrap();
                shared.in_flight -= 1;
                if let Some(key) = &key {
                    shared.busy_keys.remove(key.as_str());
                }
            }
            if self.ordered {
                self.clone().dispatch_ordered();
            }
        });
    }

    async fn execute_job(&self, job: Job, key: Option<&str>) {
        let id = job.id.clone();
        debug!(stream = %self.stream, id = %id, key = ?key, "Executing job");

        // The handler runs in its own task so a panic is contained and
        // counts as a failure.
        let handler = self.handler.clone();
        let outcome = tokio::spawn(async move { handler.handle(job).await }).await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = self.store.ack(&self.stream, &self.group, &id).await {
                    // The message stays pending and will be redelivered
                    // after min-idle; the handler may run again.
                    error!(
                        stream = %self.stream,
                        id = %id,
                        error = %e,
                        "Failed to ack completed job"
                    );
                }
            }
            Ok(Err(e)) => {
                warn!(
                    stream = %self.stream,
                    id = %id,
                    key = ?key,
                    error = %e,
                    "Handler failed, job left pending"
                );
            }
            Err(e) => {
                error!(
                    stream = %self.stream,
                    id = %id,
                    key = ?key,
                    error = %e,
                    "Handler panicked, job left pending"
                );
            }
        }
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::LogHandler;
    use crate::testing::MemoryStore;

    fn consumer(options: ConsumerOptions) -> Result<Consumer, ConsumerError> {
        Consumer::new(
            Arc::new(MemoryStore::new()),
            "jobs",
            Arc::new(LogHandler::new()),
            options,
        )
    }

    #[test]
    fn default_names() {
        let consumer = consumer(ConsumerOptions::default()).unwrap();
        assert_eq!(consumer.group_name(), "group:jobs");
        assert!(consumer.consumer_name().starts_with("consumer:jobs-"));
        assert_eq!(consumer.state(), ConsumerState::Idle);
    }

    #[test]
    fn explicit_names_win() {
        let consumer = consumer(ConsumerOptions {
            group_name: Some("workers".to_string()),
            consumer_name: Some("w-1".to_string()),
            ..ConsumerOptions::default()
        })
        .unwrap();
        assert_eq!(consumer.group_name(), "workers");
        assert_eq!(consumer.consumer_name(), "w-1");
    }

    #[test]
    fn zero_concurrency_coerced_to_one() {
        let consumer = consumer(ConsumerOptions {
            concurrency: 0,
            ..ConsumerOptions::default()
        })
        .unwrap();
        assert_eq!(consumer.engine.concurrency, 1);
    }

    #[test]
    fn empty_stream_rejected() {
        let err = Consumer::new(
            Arc::new(MemoryStore::new()),
            "   ",
            Arc::new(LogHandler::new()),
            ConsumerOptions::default(),
        )
        .err()
        .expect("construction must fail");
        assert!(matches!(err, ConsumerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn start_is_noop_unless_idle() {
        let consumer = consumer(ConsumerOptions::default()).unwrap();
        consumer.start().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);

        // Second start is ignored.
        consumer.start().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);

        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        // Start after stop is ignored too.
        consumer.start().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let consumer = consumer(ConsumerOptions::default()).unwrap();
        consumer.stop().await;
        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn drained_keys_are_removed_from_the_mapping() {
        let store = Arc::new(MemoryStore::new());
        let consumer = Consumer::new(
            store.clone(),
            "jobs",
            Arc::new(LogHandler::new()),
            ConsumerOptions {
                concurrency: 2,
                process_ordered_by_key: true,
                block_time: Duration::from_millis(50),
                ..ConsumerOptions::default()
            },
        )
        .unwrap();

        consumer.start().await.unwrap();

        let mut payload = crate::payload::Payload::new();
        payload.set("v", "1");
        payload.set_ordering_key("K");
        store.append("jobs", &payload).await.unwrap();
        store.append("jobs", &payload).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if store.acked("jobs", "group:jobs").len() == 2 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "keyed jobs were not drained"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Completion bookkeeping runs just after the ack; wait it out.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if consumer.in_flight() == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "jobs still in flight");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        {
            let shared = consumer.engine.shared.lock().unwrap();
            assert!(shared.ordering_queues.is_empty());
            assert!(shared.busy_keys.is_empty());
        }

        consumer.stop().await;
    }
}
