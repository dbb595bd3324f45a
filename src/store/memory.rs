//! Provides an in memory implementation of [`JobStore`].
//!
//! Currently this is provided for testing purposes and for embedding the
//! scheduler without a durable backend. It is not optimized, instead it is
//! designed to be a correct implementation of the store contract.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobStore, StoreError};
use crate::job::{JobDetails, JobId};

/// An in memory implementation of [`JobStore`].
///
/// **This is not designed for use in a production system**: state does not
/// survive a restart, which defeats the recovery protocol the scheduler's
/// reconciliation loop exists for.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, JobDetails>>>,
}

impl InMemoryJobStore {
    /// Creates a new instance of [`InMemoryJobStore`].
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find(&self, id: &JobId) -> Result<Option<JobDetails>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(id)
            .cloned())
    }

    async fn persist(&self, job: JobDetails) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn update(&self, job: JobDetails) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.get_mut(&job.id) {
            None => Err(StoreError::NotFound(job.id)),
            Some(existing) => {
                *existing = job;
                Ok(())
            }
        }
    }

    async fn remove(&self, id: &JobId) -> Result<Option<JobDetails>, StoreError> {
        Ok(self
            .jobs
            .write()
            .map_err(|_| StoreError::BadState)?
            .remove(id))
    }

    async fn should_run(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(id)
            .map(JobDetails::is_active)
            .unwrap_or(false))
    }

    async fn load_active_jobs(
        &self,
        until: DateTime<Utc>,
    ) -> Result<Vec<JobDetails>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|job| {
                job.is_active()
                    && job
                        .trigger
                        .has_next_fire_time()
                        .map(|due| due <= until)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
