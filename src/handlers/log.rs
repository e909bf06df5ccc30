//! A handler that logs consumed jobs.
//!
//! Useful as a default for worker shells and for debugging stream traffic.

use async_trait::async_trait;
use tracing::info;

use super::{HandlerError, JobHandler};
use crate::payload::Job;

/// Logs each delivered job with structured fields.
#[derive(Debug, Clone)]
pub struct LogHandler {
    prefix: String,
}

impl LogHandler {
    pub fn new() -> Self {
        Self {
            prefix: "job".to_string(),
        }
    }

    /// A custom prefix, useful for distinguishing several log handlers
    /// (e.g. "audit", "debug").
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, job: Job) -> Result<(), HandlerError> {
        let fields: serde_json::Map<String, serde_json::Value> = job
            .payload
            .iter()
            .map(|(f, v)| (f.to_string(), serde_json::Value::String(v.to_string())))
            .collect();

        info!(
            prefix = %self.prefix,
            id = %job.id,
            payload = %serde_json::Value::Object(fields),
            "[{}] Processed job {}",
            self.prefix,
            job.id
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{MessageId, Payload};

    #[tokio::test]
    async fn log_handler_succeeds() {
        let handler = LogHandler::new();
        let payload: Payload = [("email", "a@x")].into_iter().collect();
        let job = Job::new(MessageId::from("1-0"), payload);

        assert!(handler.handle(job).await.is_ok());
    }

    #[tokio::test]
    async fn log_handler_with_prefix() {
        let handler = LogHandler::with_prefix("audit");
        let job = Job::new(
            MessageId::from("2-0"),
            [("k", "v")].into_iter().collect::<Payload>(),
        );

        assert!(handler.handle(job).await.is_ok());
    }
}
