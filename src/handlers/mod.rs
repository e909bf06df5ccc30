//! Job handler surface.
//!
//! A [`JobHandler`] is the user-supplied code a [`crate::Consumer`] invokes
//! for each delivered work item. Handlers are async and must be `Send +
//! Sync`; the engine runs them concurrently up to the consumer's
//! concurrency bound.
//!
//! Handler outcomes drive the acknowledgment discipline: `Ok` acknowledges
//! the message, `Err` leaves it pending for redelivery (at-least-once).
//!
//! ## Implementing a handler
//!
//! ```rust,ignore
//! use conveyor::{HandlerError, Job, JobHandler};
//! use async_trait::async_trait;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     async fn handle(&self, job: Job) -> Result<(), HandlerError> {
//!         let to = job.payload.get("email").ok_or("missing email field")?;
//!         // deliver…
//!         Ok(())
//!     }
//! }
//! ```

pub mod log;

pub use log::LogHandler;

use async_trait::async_trait;
use thiserror::Error;

use crate::payload::Job;

/// A failure reported by handler code.
///
/// The engine logs the message and withholds the acknowledgment; it never
/// inspects the content.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// User-supplied processing for consumed work items.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one delivered job.
    ///
    /// Returning `Ok` acknowledges the message; returning `Err` leaves it
    /// pending and it will be redelivered per store semantics. Duplicate
    /// invocations are possible and must be tolerated.
    async fn handle(&self, job: Job) -> Result<(), HandlerError>;
}
