//! A durable job scheduling and timer library.
//!
//! Timekeep schedules one-shot and repeating jobs against a pluggable,
//! durable [`store::JobStore`], executes them through registered
//! [`executor::JobExecutor`]s when their timers fire, retries failed
//! executions with bounded attempts, and periodically reconciles its
//! in-process timer set against the store, self-healing after restarts or
//! when several instances share one store.
//!
//! The moving parts:
//!
//! - [`trigger::Trigger`]: pure next-fire-time computation.
//! - [`job`]: the persisted [`job::JobDetails`] model and the caller-facing
//!   [`job::ScheduleSpec`].
//! - [`store`]: the durable store contract plus an in-memory implementation.
//! - [`executor`]: the side-effecting execution seam.
//! - [`backoff`]: retry delay policies; constant by default.
//! - [`interceptor`]: ordered middleware around timeout processing.
//! - [`event`]: fire-and-forget lifecycle event fan-out.
//! - [`sync`]: the external transaction-boundary hook.
//! - [`scheduler`]: the core tying it all together.
//!
//! # Example
//!
//! ```
//! use timekeep::prelude::*;
//! use timekeep::store::memory::InMemoryJobStore;
//! use async_trait::async_trait;
//! use chrono::{TimeDelta, Utc};
//! use std::sync::Arc;
//!
//! struct EmailExecutor;
//!
//! #[async_trait]
//! impl JobExecutor for EmailExecutor {
//!     async fn execute(&self, job: &JobDetails) -> Result<(), Box<dyn ExecutionError>> {
//!         tracing::info!("sending email described by {}", job.recipient);
//!         Ok(())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let scheduler = Scheduler::builder(InMemoryJobStore::new())
//!     .with_executor(Arc::new(EmailExecutor))
//!     .start();
//!
//! scheduler
//!     .schedule(
//!         ScheduleSpec::new("welcome-42", Utc::now() + TimeDelta::seconds(5))
//!             .with_correlation_id("user-42")
//!             .with_recipient(serde_json::json!({ "template": "welcome" })),
//!     )
//!     .await
//!     .unwrap();
//! scheduler.shutdown();
//! # });
//! ```

pub mod backoff;
pub mod event;
pub mod executor;
pub mod interceptor;
pub mod job;
pub mod prelude;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod trigger;

use thiserror::Error;

pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerConfig};

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The operation names a job the store does not know.
    #[error("No job found with id {0}")]
    JobNotFound(job::JobId),
    #[error("Error communicating with the job store")]
    Store(#[from] store::StoreError),
    /// The scheduler has been shut down and accepts no new work.
    #[error("Scheduler is shut down")]
    Shutdown,
}
