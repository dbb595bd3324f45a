//! The periodic reconciliation loop.
//!
//! Re-derives the in-process timer set from the job store within a bounded
//! look-ahead window, self-healing after restarts, instance handoff, or
//! externally made changes to persisted jobs. This is not a lock-step
//! protocol: a pass may observe a torn snapshot while schedules, cancels,
//! and firing timers interleave with it, and relies on the next pass to
//! converge.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fxhash::FxHashSet;
use tokio_util::sync::CancellationToken;

use super::timers::TimerKey;
use super::SchedulerInner;
use crate::store::{JobStore, StoreError};

pub(crate) fn spawn<S>(inner: Arc<SchedulerInner<S>>, cancellation_token: CancellationToken)
where
    S: JobStore + 'static,
{
    tokio::spawn(async move {
        let interval = inner
            .config
            .refresh_interval
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = reconcile(&inner).await {
                        tracing::error!(?err, "Abandoning job reconciliation pass: {err}");
                    }
                }
                _ = cancellation_token.cancelled() => {
                    tracing::debug!("Shutting down the job reconciler");
                    break;
                }
            }
        }
    });
}

/// One reconciliation pass.
pub(crate) async fn reconcile<S>(inner: &Arc<SchedulerInner<S>>) -> Result<(), StoreError>
where
    S: JobStore + 'static,
{
    let horizon = Utc::now() + inner.config.max_refresh_window;
    let active = inner.store.load_active_jobs(horizon).await?;

    let mut live = FxHashSet::default();
    for job in active {
        let key = TimerKey::for_job(&job);
        live.insert(key.clone());
        let Some(due) = job.trigger.has_next_fire_time() else {
            continue;
        };
        match inner.timers.state_of(&key) {
            None => {
                tracing::debug!(job_id = %job.id, "Arming job {} due at {due}", job.id);
                SchedulerInner::arm(inner, &job);
            }
            Some(state) if state.fire_at > horizon => {
                // speculative lookahead beyond the window; a later pass
                // re-arms it once the due instant truly enters the window
                tracing::debug!(job_id = %job.id, "Disarming timer for job {} held beyond the window", job.id);
                inner.timers.disarm(&key);
            }
            Some(state) if state.fire_at != due => {
                // the job was rescheduled underneath us
                tracing::debug!(job_id = %job.id, "Re-arming job {} after an external reschedule", job.id);
                inner.timers.disarm(&key);
                SchedulerInner::arm(inner, &job);
            }
            Some(state) if state.finished => {
                // the previous fire never cleaned up its entry, e.g. the
                // store was unreachable when it fired
                tracing::debug!(job_id = %job.id, "Re-arming job {} whose timer fired without completing", job.id);
                SchedulerInner::arm(inner, &job);
            }
            Some(_) => {}
        }
    }

    // anything not in the active set completed, was canceled, or errored out
    // through another path
    inner.timers.retain_live(&live);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::test::RecordingExecutor;
    use crate::job::ScheduleSpec;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::store::memory::InMemoryJobStore;
    use chrono::{DateTime, TimeDelta};

    fn manual_config() -> SchedulerConfig {
        // virtual time never advances in these tests, so the background loop
        // stays quiet and every pass below runs manually
        SchedulerConfig::default()
    }

    fn scheduler(store: InMemoryJobStore) -> (Scheduler<InMemoryJobStore>, RecordingExecutor) {
        let executor = RecordingExecutor::default();
        let scheduler = Scheduler::builder(store)
            .with_config(manual_config())
            .with_executor(Arc::new(executor.clone()))
            .start();
        (scheduler, executor)
    }

    fn timer_states(scheduler: &Scheduler<InMemoryJobStore>) -> Vec<(TimerKey, DateTime<Utc>)> {
        let inner = scheduler.inner();
        let mut states: Vec<_> = inner
            .timers
            .armed_keys()
            .into_iter()
            .map(|key| {
                let fire_at = inner.timers.state_of(&key).unwrap().fire_at;
                (key, fire_at)
            })
            .collect();
        states.sort_by(|a, b| a.0.job_id.as_str().cmp(b.0.job_id.as_str()));
        states
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_passes_change_nothing() {
        let store = InMemoryJobStore::new();
        let (scheduler, _executor) = scheduler(store);
        scheduler
            .schedule(ScheduleSpec::new("job-1", Utc::now() + TimeDelta::minutes(1)))
            .await
            .unwrap();
        scheduler
            .schedule(ScheduleSpec::new("job-2", Utc::now() + TimeDelta::minutes(2)))
            .await
            .unwrap();

        let before = timer_states(&scheduler);
        reconcile(scheduler.inner()).await.unwrap();
        let after_one = timer_states(&scheduler);
        reconcile(scheduler.inner()).await.unwrap();
        let after_two = timer_states(&scheduler);

        assert_eq!(before, after_one);
        assert_eq!(after_one, after_two);
        assert_eq!(after_two.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_job_created_behind_our_back_is_armed() {
        let store = InMemoryJobStore::new();
        let (scheduler, _executor) = scheduler(store.clone());
        // another instance wrote straight to the shared store
        let foreign = ScheduleSpec::new("foreign", Utc::now() + TimeDelta::minutes(1));
        crate::store::JobStore::persist(&store, foreign.into_details())
            .await
            .unwrap();

        assert_eq!(scheduler.inner().timers.len(), 0);
        reconcile(scheduler.inner()).await.unwrap();

        assert_eq!(scheduler.inner().timers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_stale_timer_is_swept() {
        let store = InMemoryJobStore::new();
        let (scheduler, _executor) = scheduler(store.clone());
        scheduler
            .schedule(ScheduleSpec::new("job-1", Utc::now() + TimeDelta::minutes(1)))
            .await
            .unwrap();
        assert_eq!(scheduler.inner().timers.len(), 1);

        // the job completed through another path
        crate::store::JobStore::remove(&store, &"job-1".into())
            .await
            .unwrap();
        reconcile(scheduler.inner()).await.unwrap();

        assert_eq!(scheduler.inner().timers.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn an_external_reschedule_rearms_the_timer() {
        let store = InMemoryJobStore::new();
        let (scheduler, _executor) = scheduler(store.clone());
        scheduler
            .schedule(ScheduleSpec::new("job-1", Utc::now() + TimeDelta::minutes(1)))
            .await
            .unwrap();

        let job = crate::store::JobStore::find(&store, &"job-1".into())
            .await
            .unwrap()
            .unwrap();
        let shifted = job.clone().with_trigger(job.trigger.delayed_by(TimeDelta::minutes(2)));
        let new_due = shifted.trigger.has_next_fire_time().unwrap();
        crate::store::JobStore::update(&store, shifted).await.unwrap();

        reconcile(scheduler.inner()).await.unwrap();

        let states = timer_states(&scheduler);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].1, new_due);

        // and a second pass leaves the fresh timer alone
        reconcile(scheduler.inner()).await.unwrap();
        assert_eq!(timer_states(&scheduler), states);
    }

    #[tokio::test(start_paused = true)]
    async fn a_timer_held_beyond_the_window_is_disarmed() {
        let store = InMemoryJobStore::new();
        let (scheduler, _executor) = scheduler(store.clone());
        scheduler
            .schedule(ScheduleSpec::new("job-1", Utc::now() + TimeDelta::minutes(4)))
            .await
            .unwrap();

        // simulate a timer armed when the window was wider: same key, due
        // beyond the current horizon
        let job = crate::store::JobStore::find(&store, &"job-1".into())
            .await
            .unwrap()
            .unwrap();
        let speculative = job.clone().with_trigger(job.trigger.delayed_by(TimeDelta::minutes(10)));
        SchedulerInner::arm(scheduler.inner(), &speculative);

        reconcile(scheduler.inner()).await.unwrap();
        assert_eq!(scheduler.inner().timers.len(), 0);

        // the next pass arms it from the store again
        reconcile(scheduler.inner()).await.unwrap();
        let states = timer_states(&scheduler);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].1, job.trigger.has_next_fire_time().unwrap());
    }
}
