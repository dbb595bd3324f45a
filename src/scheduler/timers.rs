//! In-process timer bookkeeping.
//!
//! The timer map is keyed by `jobId-retries` so that a stale timer armed for
//! a superseded retry generation can be told apart from the current one. It
//! only ever holds state for live, armed timers; nothing here is persisted.
//! Every read-modify-write runs as a single operation under the map lock to
//! avoid lost updates between worker tasks and the reconciliation loop.
//!
//! A timer lives in two phases. While waiting for its due instant it is an
//! abortable sleep task; disarming kills it outright. Once it fires it hands
//! off to a separate processing task registered via
//! [`TimerMap::begin_processing`], and disarming no longer interrupts it: an
//! in-flight timeout is expected to notice a canceled job through the store
//! and exit cleanly. Each armed timer carries a unique `timer_id`, so a fire
//! racing a replacement timer under the same key cannot start processing on
//! the replacement's behalf.

use chrono::{DateTime, Utc};
use fxhash::{FxHashMap, FxHashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;

use crate::job::{JobDetails, JobId};

/// Identifies one armed timer generation for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey {
    pub(crate) job_id: JobId,
    pub(crate) retries: u32,
}

impl TimerKey {
    pub(crate) fn for_job(job: &JobDetails) -> Self {
        Self {
            job_id: job.id.clone(),
            retries: job.retries,
        }
    }
}

impl Display for TimerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.job_id, self.retries)
    }
}

#[derive(Debug)]
struct TimerHandle {
    timer_id: u64,
    fire_at: DateTime<Utc>,
    sleep: JoinHandle<()>,
    processing: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Kills the pending sleep. Processing already in flight is left to
    /// finish and observe the store.
    fn disarm(&self) {
        self.sleep.abort();
    }

    fn is_finished(&self) -> bool {
        self.sleep.is_finished()
            && self
                .processing
                .as_ref()
                .map(JoinHandle::is_finished)
                .unwrap_or(true)
    }
}

/// What the reconciliation loop sees of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerState {
    pub(crate) fire_at: DateTime<Utc>,
    /// The timer ran to completion without replacing or removing its own
    /// entry; the job it was armed for still needs a fresh timer.
    pub(crate) finished: bool,
}

#[derive(Default)]
pub(crate) struct TimerMap {
    inner: Mutex<FxHashMap<TimerKey, TimerHandle>>,
    next_timer_id: AtomicU64,
}

impl TimerMap {
    /// Registers `key` and spawns its sleep task in one locked operation, so
    /// an immediately-firing timer can never observe the map without its own
    /// entry. Any displaced timer for the same key is disarmed. The spawned
    /// task receives the timer id it must present to
    /// [`begin_processing`](TimerMap::begin_processing).
    pub(crate) fn arm(
        &self,
        key: TimerKey,
        fire_at: DateTime<Utc>,
        spawn: impl FnOnce(u64) -> JoinHandle<()>,
    ) {
        let timer_id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.lock();
        let sleep = spawn(timer_id);
        let handle = TimerHandle {
            timer_id,
            fire_at,
            sleep,
            processing: None,
        };
        if let Some(displaced) = timers.insert(key, handle) {
            displaced.disarm();
        }
    }

    /// Called by a firing sleep task: spawns the timeout-processing task,
    /// but only if this timer is still the armed one for `key`. A timer
    /// disarmed or displaced between waking and locking the map fires into
    /// nothing.
    pub(crate) fn begin_processing(
        &self,
        key: &TimerKey,
        timer_id: u64,
        spawn: impl FnOnce() -> JoinHandle<()>,
    ) {
        let mut timers = self.lock();
        match timers.get_mut(key) {
            Some(handle) if handle.timer_id == timer_id => {
                handle.processing = Some(spawn());
            }
            _ => {}
        }
    }

    /// Aborts and forgets the timer for `key`, if any.
    pub(crate) fn disarm(&self, key: &TimerKey) {
        if let Some(handle) = self.lock().remove(key) {
            handle.disarm();
        }
    }

    /// Aborts and forgets every timer generation for `job_id`.
    pub(crate) fn disarm_job(&self, job_id: &JobId) {
        self.lock().retain(|key, handle| {
            if key.job_id == *job_id {
                handle.disarm();
                false
            } else {
                true
            }
        });
    }

    /// Forgets the entry without aborting: used by a timeout task consuming
    /// its own fired generation.
    pub(crate) fn remove(&self, key: &TimerKey) {
        self.lock().remove(key);
    }

    pub(crate) fn state_of(&self, key: &TimerKey) -> Option<TimerState> {
        self.lock().get(key).map(|handle| TimerState {
            fire_at: handle.fire_at,
            finished: handle.is_finished(),
        })
    }

    /// Disarms every timer whose key is not in `live`, in one locked sweep.
    pub(crate) fn retain_live(&self, live: &FxHashSet<TimerKey>) {
        self.lock().retain(|key, handle| {
            if live.contains(key) {
                true
            } else {
                handle.disarm();
                false
            }
        });
    }

    pub(crate) fn disarm_all(&self) {
        let mut timers = self.lock();
        for handle in timers.values() {
            handle.disarm();
        }
        timers.clear();
    }

    #[cfg(test)]
    pub(crate) fn armed_keys(&self) -> Vec<TimerKey> {
        self.lock().keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<TimerKey, TimerHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn at() -> DateTime<Utc> {
        "2024-04-01T12:00:00Z".parse().unwrap()
    }

    fn key(id: &str, retries: u32) -> TimerKey {
        TimerKey {
            job_id: id.into(),
            retries,
        }
    }

    fn sleeper(_timer_id: u64) -> JoinHandle<()> {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
    }

    #[test]
    fn keys_name_the_retry_generation() {
        assert_eq!(key("job-1", 0).to_string(), "job-1-0");
        assert_eq!(key("job-1", 2).to_string(), "job-1-2");
        assert_ne!(key("job-1", 0), key("job-1", 1));
    }

    #[tokio::test]
    async fn arming_replaces_a_displaced_timer() {
        let timers = TimerMap::default();

        timers.arm(key("job-1", 0), at(), sleeper);
        timers.arm(key("job-1", 0), at() + TimeDelta::seconds(5), sleeper);

        assert_eq!(timers.len(), 1);
        let state = timers.state_of(&key("job-1", 0)).unwrap();
        assert_eq!(state.fire_at, at() + TimeDelta::seconds(5));
    }

    #[tokio::test]
    async fn disarm_job_clears_every_generation() {
        let timers = TimerMap::default();
        timers.arm(key("job-1", 0), at(), sleeper);
        timers.arm(key("job-1", 1), at(), sleeper);
        timers.arm(key("job-2", 0), at(), sleeper);

        timers.disarm_job(&"job-1".into());

        assert_eq!(timers.armed_keys(), vec![key("job-2", 0)]);
    }

    #[tokio::test]
    async fn retain_live_sweeps_stale_keys() {
        let timers = TimerMap::default();
        timers.arm(key("job-1", 0), at(), sleeper);
        timers.arm(key("job-2", 0), at(), sleeper);

        let live = [key("job-2", 0)].into_iter().collect();
        timers.retain_live(&live);

        assert_eq!(timers.armed_keys(), vec![key("job-2", 0)]);
    }

    #[tokio::test]
    async fn a_completed_timer_without_processing_is_finished() {
        let timers = TimerMap::default();
        timers.arm(key("job-1", 0), at(), |_| tokio::spawn(async {}));

        // let the empty sleep task run to completion
        tokio::task::yield_now().await;

        let state = timers.state_of(&key("job-1", 0)).unwrap();
        assert!(state.finished);
    }

    #[tokio::test]
    async fn in_flight_processing_is_not_finished() {
        let timers = TimerMap::default();
        timers.arm(key("job-1", 0), at(), |_| tokio::spawn(async {}));
        tokio::task::yield_now().await;

        timers.begin_processing(&key("job-1", 0), 0, || {
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
        });

        let state = timers.state_of(&key("job-1", 0)).unwrap();
        assert!(!state.finished);
    }

    #[tokio::test]
    async fn a_stale_timer_id_cannot_begin_processing() {
        let spawned = Arc::new(AtomicBool::new(false));
        let timers = TimerMap::default();
        timers.arm(key("job-1", 0), at(), sleeper);
        // the armed timer got id 0; a displaced generation presents another
        let spawned_flag = spawned.clone();
        timers.begin_processing(&key("job-1", 0), 42, move || {
            spawned_flag.store(true, Ordering::SeqCst);
            tokio::spawn(async {})
        });

        assert!(!spawned.load(Ordering::SeqCst));
        assert!(!timers.state_of(&key("job-1", 0)).unwrap().finished);
    }

    #[tokio::test]
    async fn disarm_all_empties_the_map() {
        let timers = TimerMap::default();
        timers.arm(key("job-1", 0), at(), sleeper);
        timers.arm(key("job-2", 0), at(), sleeper);

        timers.disarm_all();

        assert_eq!(timers.len(), 0);
    }
}
