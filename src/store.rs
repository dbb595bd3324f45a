//! The durable job store contract.
//!
//! The store is the single source of truth for scheduling state and may be
//! shared by several scheduler instances racing benignly; mutations are
//! last-writer-wins at the job level. Implementations back this trait with
//! whatever persistence technology the embedding system uses. The crate
//! ships [`memory::InMemoryJobStore`] as a correct reference implementation
//! for tests and light embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{JobDetails, JobId};

pub mod memory;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find(&self, id: &JobId) -> Result<Option<JobDetails>, StoreError>;

    /// Stores a new job. Persisting an id that already exists is a caller
    /// error and fails with [`StoreError::AlreadyExists`].
    async fn persist(&self, job: JobDetails) -> Result<(), StoreError>;

    /// Replaces the stored state of an existing job.
    async fn update(&self, job: JobDetails) -> Result<(), StoreError>;

    /// Removes the job, returning its last state. Absent ids are not an
    /// error: removal races benignly with completion.
    async fn remove(&self, id: &JobId) -> Result<Option<JobDetails>, StoreError>;

    /// Whether the job is still due to run: present and in a live status.
    /// Consulted when a timer fires, guarding against cancellations and
    /// reschedules that raced the in-process timer.
    async fn should_run(&self, id: &JobId) -> Result<bool, StoreError>;

    /// Every job in a live status whose next fire time is at or before
    /// `until`, for the reconciliation loop's bounded look-ahead.
    async fn load_active_jobs(&self, until: DateTime<Utc>)
        -> Result<Vec<JobDetails>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No job found with id {0}")]
    NotFound(JobId),
    #[error("A job with id {0} already exists")]
    AlreadyExists(JobId),
    #[error("Job store in bad state")]
    BadState,
    #[error("Error encoding or decoding job data")]
    Serialization(#[from] serde_json::Error),
}
