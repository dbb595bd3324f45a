//! The scheduler core.
//!
//! Owns the in-memory map of live timers, drives the per-job state machine
//! (schedule, run, execute, retry, error, reschedule, remove), and runs the
//! periodic reconciliation loop against the job store. Built via
//! [`Scheduler::builder`]:
//!
//! ```
//! # use timekeep::prelude::*;
//! # use timekeep::store::memory::InMemoryJobStore;
//! # use async_trait::async_trait;
//! # use chrono::{TimeDelta, Utc};
//! # use std::sync::Arc;
//! struct PingExecutor;
//!
//! #[async_trait]
//! impl JobExecutor for PingExecutor {
//!     async fn execute(&self, job: &JobDetails) -> Result<(), Box<dyn ExecutionError>> {
//!         tracing::info!("pinging for job {}", job.id);
//!         Ok(())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let scheduler = Scheduler::builder(InMemoryJobStore::new())
//!     .with_executor(Arc::new(PingExecutor))
//!     .start();
//!
//! let job_id = scheduler
//!     .schedule(ScheduleSpec::new("ping-1", Utc::now() + TimeDelta::minutes(5)))
//!     .await
//!     .unwrap();
//! scheduler.cancel(&job_id).await.unwrap();
//! scheduler.shutdown();
//! # });
//! ```

pub(crate) mod reconciler;
pub(crate) mod timers;
pub(crate) mod transitions;

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backoff::{Backoff, RetryPolicy};
use crate::event::{
    EventAdapter, EventFanout, EventPublisher, JobDetailsEventAdapter, JobEvent, JobEventKind,
};
use crate::executor::JobExecutor;
use crate::interceptor::{self, TimeoutInterceptor, TimeoutTask};
use crate::job::{
    ExceptionDetails, IdentityMerger, JobDescriptionMerger, JobDetails, JobId, JobStatus,
    ScheduleSpec,
};
use crate::store::{JobStore, StoreError};
use crate::sync::{InlineSynchronization, JobSynchronization};
use crate::SchedulerError;
use timers::{TimerKey, TimerMap};
use transitions::Followup;

/// Recognized scheduler options.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Retry attempts a failing execution is granted before the job freezes
    /// in `Error`.
    pub max_retries: u32,
    /// Period of the reconciliation loop.
    pub refresh_interval: TimeDelta,
    /// Look-ahead window within which in-process timers are held; floored to
    /// `refresh_interval` when the scheduler is built.
    pub max_refresh_window: TimeDelta,
    /// Delay between retry attempts under the default constant backoff.
    pub retry_interval: TimeDelta,
    /// Maximum concurrently executing timeout tasks.
    pub worker_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            refresh_interval: TimeDelta::seconds(1),
            max_refresh_window: TimeDelta::minutes(5),
            retry_interval: TimeDelta::seconds(10),
            worker_count: 10,
        }
    }
}

impl SchedulerConfig {
    fn normalized(self) -> Self {
        Self {
            max_refresh_window: self.max_refresh_window.max(self.refresh_interval),
            ..self
        }
    }
}

/// Assembles a [`Scheduler`] and its pluggable collaborators.
pub struct SchedulerBuilder<S> {
    store: S,
    config: SchedulerConfig,
    executors: Vec<Arc<dyn JobExecutor>>,
    interceptors: Vec<Arc<dyn TimeoutInterceptor>>,
    adapters: Vec<Arc<dyn EventAdapter>>,
    publishers: Vec<Arc<dyn EventPublisher>>,
    merger: Arc<dyn JobDescriptionMerger>,
    synchronization: Arc<dyn JobSynchronization>,
    backoff: Option<Box<dyn Backoff>>,
}

impl<S> SchedulerBuilder<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: Default::default(),
            executors: Default::default(),
            interceptors: Default::default(),
            adapters: Default::default(),
            publishers: Default::default(),
            merger: Arc::new(IdentityMerger),
            synchronization: Arc::new(InlineSynchronization),
            backoff: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an executor; executors run in registration order for every
    /// job they accept.
    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn TimeoutInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Registers an event adapter; without any, every transition is
    /// forwarded by [`JobDetailsEventAdapter`].
    pub fn with_adapter(mut self, adapter: Arc<dyn EventAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_merger(mut self, merger: Arc<dyn JobDescriptionMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_synchronization(mut self, synchronization: Arc<dyn JobSynchronization>) -> Self {
        self.synchronization = synchronization;
        self
    }

    /// Overrides the retry backoff. The default is a constant
    /// [`SchedulerConfig::retry_interval`] between attempts.
    pub fn with_backoff(mut self, backoff: Box<dyn Backoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Sorts the interceptor chain, spawns the reconciliation loop, and
    /// returns the running scheduler handle.
    pub fn start(self) -> Scheduler<S> {
        let config = self.config.normalized();
        let mut interceptors = self.interceptors;
        interceptors.sort_by_key(|interceptor| interceptor.priority());
        let adapters = if self.adapters.is_empty() {
            vec![Arc::new(JobDetailsEventAdapter) as Arc<dyn EventAdapter>]
        } else {
            self.adapters
        };
        let backoff = self
            .backoff
            .unwrap_or_else(|| Box::new(RetryPolicy::constant(config.retry_interval)));

        let inner = Arc::new(SchedulerInner {
            store: self.store,
            executors: self.executors,
            interceptors,
            merger: self.merger,
            synchronization: self.synchronization,
            backoff,
            events: EventFanout::new(adapters, self.publishers),
            timers: TimerMap::default(),
            workers: Semaphore::new(config.worker_count),
            shutdown: CancellationToken::new(),
            config,
        });
        reconciler::spawn(Arc::clone(&inner), inner.shutdown.clone());
        Scheduler { inner }
    }
}

/// Handle to a running scheduler; cheap to clone and share.
pub struct Scheduler<S: JobStore> {
    inner: Arc<SchedulerInner<S>>,
}

impl<S: JobStore> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Scheduler<S>
where
    S: JobStore + 'static,
{
    pub fn builder(store: S) -> SchedulerBuilder<S> {
        SchedulerBuilder::new(store)
    }

    /// Persists a new job and arms its timer.
    ///
    /// The job is armed only after persistence succeeds, and only when its
    /// due instant lies within the refresh window; a job due further out is
    /// picked up by a reconciliation pass once its due time approaches.
    /// Scheduling an id that already exists is a caller error surfaced from
    /// the store.
    pub async fn schedule(&self, spec: ScheduleSpec) -> Result<JobId, SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::Shutdown);
        }
        let job = spec.into_details();
        let id = job.id.clone();
        let inner = Arc::clone(&self.inner);
        let persisted = job.clone();
        self.inner
            .synchronization
            .synchronize(Box::pin(async move {
                inner.store.persist(persisted.clone()).await?;
                SchedulerInner::arm_within_window(&inner, &persisted);
                Ok(())
            }))
            .await?;
        tracing::debug!(job_id = %id, "Scheduled job {id}");
        self.inner
            .events
            .dispatch(JobEvent::now(JobEventKind::Scheduled, job));
        Ok(id)
    }

    /// Replaces the trigger of an existing job with the one described by
    /// `spec`, keeping the job's execution history.
    ///
    /// The old trigger is logically canceled, observable as a `Canceled`
    /// transition, without removing the persisted job.
    pub async fn reschedule(&self, spec: ScheduleSpec) -> Result<JobId, SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::Shutdown);
        }
        let existing = self
            .inner
            .store
            .find(spec.id())
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(spec.id().clone()))?;
        let canceled = existing
            .clone()
            .with_trigger(existing.trigger.exhausted())
            .with_status(JobStatus::Canceled);
        let job = spec
            .into_details()
            .with_execution_counter(existing.execution_counter);
        let id = job.id.clone();
        let inner = Arc::clone(&self.inner);
        let replacement = job.clone();
        self.inner
            .synchronization
            .synchronize(Box::pin(async move {
                inner.timers.disarm_job(&replacement.id);
                inner.store.update(replacement.clone()).await?;
                SchedulerInner::arm_within_window(&inner, &replacement);
                Ok(())
            }))
            .await?;
        tracing::debug!(job_id = %id, "Rescheduled job {id}");
        self.inner
            .events
            .dispatch(JobEvent::now(JobEventKind::Canceled, canceled));
        self.inner
            .events
            .dispatch(JobEvent::now(JobEventKind::Scheduled, job));
        Ok(id)
    }

    /// Cancels a job: disarms its timer, removes it from the store, and
    /// returns its final state. Unknown ids are a tolerated no-op, since
    /// cancellation races benignly with concurrent completion.
    ///
    /// A timeout task already in flight is not interrupted; it observes the
    /// removed job through the store and exits without re-arming.
    pub async fn cancel(&self, id: &JobId) -> Result<Option<JobDetails>, SchedulerError> {
        let Some(existing) = self.inner.store.find(id).await? else {
            tracing::debug!(job_id = %id, "Cancel of unknown job {id} ignored");
            return Ok(None);
        };
        // stop pending fires before touching the store
        self.inner.timers.disarm_job(id);
        let canceled = existing
            .clone()
            .with_trigger(existing.trigger.exhausted())
            .with_status(JobStatus::Canceled);
        let inner = Arc::clone(&self.inner);
        let target = id.clone();
        self.inner
            .synchronization
            .synchronize(Box::pin(async move {
                inner.store.remove(&target).await?;
                // a timeout racing this cancel may have re-armed between the
                // first disarm and the store removal
                inner.timers.disarm_job(&target);
                Ok(())
            }))
            .await?;
        tracing::debug!(job_id = %id, "Canceled job {id}");
        self.inner
            .events
            .dispatch(JobEvent::now(JobEventKind::Canceled, canceled.clone()));
        Ok(Some(canceled))
    }

    /// Stops the reconciliation loop and disarms every timer. Timeout tasks
    /// already in flight run to completion; persisted jobs are untouched and
    /// will be picked up by the next scheduler instance.
    pub fn shutdown(&self) {
        tracing::debug!("Shutting down scheduler");
        self.inner.shutdown.cancel();
        self.inner.timers.disarm_all();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<SchedulerInner<S>> {
        &self.inner
    }
}

pub(crate) struct SchedulerInner<S> {
    pub(crate) store: S,
    pub(crate) config: SchedulerConfig,
    pub(crate) executors: Vec<Arc<dyn JobExecutor>>,
    pub(crate) interceptors: Vec<Arc<dyn TimeoutInterceptor>>,
    pub(crate) merger: Arc<dyn JobDescriptionMerger>,
    pub(crate) synchronization: Arc<dyn JobSynchronization>,
    pub(crate) backoff: Box<dyn Backoff>,
    pub(crate) events: EventFanout,
    pub(crate) timers: TimerMap,
    pub(crate) workers: Semaphore,
    pub(crate) shutdown: CancellationToken,
}

impl<S> SchedulerInner<S>
where
    S: JobStore + 'static,
{
    /// Arms a timer for the job unless its due instant lies beyond the
    /// refresh window; far-out jobs are left to the reconciliation loop.
    pub(crate) fn arm_within_window(inner: &Arc<Self>, job: &JobDetails) {
        let Some(due) = job.trigger.has_next_fire_time() else {
            return;
        };
        let horizon = Utc::now() + inner.config.max_refresh_window;
        if due > horizon {
            tracing::debug!(
                job_id = %job.id,
                "Job {} due beyond the refresh window, leaving it to reconciliation",
                job.id
            );
            return;
        }
        Self::arm(inner, job);
    }

    /// Arms an in-process timer for the job's current due instant.
    pub(crate) fn arm(inner: &Arc<Self>, job: &JobDetails) {
        let Some(fire_at) = job.trigger.has_next_fire_time() else {
            return;
        };
        if inner.shutdown.is_cancelled() {
            return;
        }
        let key = TimerKey::for_job(job);
        let delay = job.trigger.delay_from(Utc::now());
        inner.timers.arm(key.clone(), fire_at, |timer_id| {
            tokio::spawn({
                let inner = Arc::clone(inner);
                let key = key.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    let processing_inner = Arc::clone(&inner);
                    let processing_key = key.clone();
                    inner.timers.begin_processing(&key, timer_id, move || {
                        tokio::spawn(SchedulerInner::timeout(processing_inner, processing_key))
                    });
                }
            })
        });
    }

    /// Entry point of a fired timer: dispatched onto the bounded worker pool
    /// and wrapped by the interceptor chain, so executor I/O never delays
    /// other timers from firing.
    async fn timeout(inner: Arc<Self>, key: TimerKey) {
        let Ok(_permit) = inner.workers.acquire().await else {
            return;
        };
        let task: TimeoutTask = Box::pin(Self::process_timeout(Arc::clone(&inner), key));
        interceptor::chain(&inner.interceptors, task).await;
    }

    #[instrument(skip(inner, key), fields(job_id = %key.job_id))]
    async fn process_timeout(inner: Arc<Self>, key: TimerKey) {
        let job_id = key.job_id.clone();
        // the store has the last word on whether this fire is still wanted
        match inner.store.should_run(&job_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(%job_id, "Job {job_id} no longer due to run, dropping its timer");
                inner.timers.remove(&key);
                return;
            }
            Err(err) => {
                // store unreachable before the guard: keep the entry so the
                // next reconciliation pass re-evaluates this timer
                tracing::error!(?err, %job_id, "Failed to consult the store for job {job_id}: {err}");
                return;
            }
        }
        let job = match inner.store.find(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                inner.timers.remove(&key);
                return;
            }
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to load job {job_id}: {err}");
                return;
            }
        };
        inner.events.dispatch(JobEvent::now(
            JobEventKind::Running,
            job.clone().with_status(JobStatus::Running),
        ));
        tracing::debug!(%job_id, "Executing job {job_id}");
        match Self::execute_accepting(&inner, &job).await {
            Ok(()) => Self::complete(&inner, key, job).await,
            Err(fault) => Self::fail(&inner, key, job, fault).await,
        }
    }

    /// Runs every accepting executor in registration order; the first
    /// failure aborts the run and feeds the retry state machine.
    async fn execute_accepting(
        inner: &Arc<Self>,
        job: &JobDetails,
    ) -> Result<(), ExceptionDetails> {
        for executor in inner.executors.iter() {
            if !executor.accept(job) {
                continue;
            }
            executor
                .execute(job)
                .await
                .map_err(ExceptionDetails::from)?;
        }
        Ok(())
    }

    async fn complete(inner: &Arc<Self>, key: TimerKey, job: JobDetails) {
        let job_id = job.id.clone();
        let now = Utc::now();
        let executed = job
            .with_incremented_counter()
            .with_exception(None)
            .with_status(JobStatus::Executed);
        inner
            .events
            .dispatch(JobEvent::now(JobEventKind::Executed, executed.clone()));
        match transitions::next_occurrence(&executed, now, inner.merger.as_ref()) {
            Some(next) => {
                tracing::debug!(
                    %job_id,
                    "Job {job_id} executed, next occurrence at {:?}",
                    next.execution_timeout
                );
                Self::apply(inner, key, next).await;
            }
            None => {
                tracing::debug!(%job_id, "Job {job_id} executed, no further occurrences");
                let terminal = executed.clone().with_trigger(executed.trigger.exhausted());
                Self::apply(inner, key, terminal).await;
            }
        }
    }

    async fn fail(inner: &Arc<Self>, key: TimerKey, job: JobDetails, fault: ExceptionDetails) {
        let job_id = job.id.clone();
        let next = transitions::retry_or_error(
            job,
            fault,
            inner.backoff.as_ref(),
            inner.config.max_retries,
            inner.merger.as_ref(),
        );
        let kind = match next.status {
            JobStatus::Retry => {
                tracing::warn!(
                    %job_id,
                    "Job {job_id} failed, retry {} of {} due at {:?}",
                    next.retries,
                    inner.config.max_retries,
                    next.execution_timeout
                );
                JobEventKind::Retried
            }
            _ => {
                tracing::error!(
                    %job_id,
                    "Job {job_id} failed and exhausted its {} retries",
                    inner.config.max_retries
                );
                JobEventKind::Failed
            }
        };
        inner.events.dispatch(JobEvent::now(kind, next.clone()));
        Self::apply(inner, key, next).await;
    }

    /// Applies the resulting job state, persistence and timer bookkeeping
    /// together under the synchronization scope.
    async fn apply(inner: &Arc<Self>, key: TimerKey, job: JobDetails) {
        let job_id = job.id.clone();
        let followup = transitions::followup_for(job.status);
        let scope_inner = Arc::clone(inner);
        let scope_key = key.clone();
        let result = inner
            .synchronization
            .synchronize(Box::pin(async move {
                let inner = scope_inner;
                let key = scope_key;
                match followup {
                    Followup::Remove => {
                        inner.store.remove(&job.id).await?;
                        inner.timers.remove(&key);
                    }
                    Followup::Rearm => {
                        inner.store.update(job.clone()).await?;
                        inner.timers.remove(&key);
                        Self::arm_within_window(&inner, &job);
                        // close the race with a cancel that removed the job
                        // between the update and the arm
                        if let Ok(false) = inner.store.should_run(&job.id).await {
                            inner.timers.disarm_job(&job.id);
                        }
                    }
                    Followup::Freeze => {
                        inner.store.update(job.clone()).await?;
                        inner.timers.remove(&key);
                    }
                    Followup::None => {}
                }
                Ok(())
            }))
            .await;
        match result {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                // the job was removed underneath us, e.g. by a racing cancel
                tracing::debug!(%job_id, "Job {job_id} disappeared before its update, dropping its timer");
                inner.timers.remove(&key);
            }
            Err(err) => {
                // keep the bookkeeping entry: the reconciliation loop
                // re-arms fired timers that never completed
                tracing::error!(?err, %job_id, "Failed to persist the outcome of job {job_id}: {err}");
            }
        }
    }
}
