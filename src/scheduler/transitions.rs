//! Pure state-transition computations.
//!
//! Everything here is side-effect free: given the current job state these
//! functions decide what the next persisted state is, and
//! [`followup_for`] maps a resulting status onto the store and timer actions
//! the scheduler must take. Keeping these decisions pure keeps the state
//! machine testable without a running scheduler.

use chrono::{DateTime, Utc};

use crate::backoff::Backoff;
use crate::job::{ExceptionDetails, JobDescriptionMerger, JobDetails, JobStatus};

/// The store and timer consequences of a resulting status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Followup {
    /// Terminal: disarm the timer and delete the job from the store.
    Remove,
    /// Live: persist the update and arm a fresh timer.
    Rearm,
    /// Terminal but kept for inspection: persist the update, no timer.
    Freeze,
    /// Defensive: nothing to do.
    None,
}

pub(crate) fn followup_for(status: JobStatus) -> Followup {
    match status {
        JobStatus::Executed | JobStatus::Canceled => Followup::Remove,
        JobStatus::Scheduled | JobStatus::Retry => Followup::Rearm,
        JobStatus::Error => Followup::Freeze,
        // Running is never a resulting state of a completed transition
        JobStatus::Running => Followup::None,
    }
}

/// The next state of a job whose execution attempt failed.
///
/// While attempts remain, the job moves to `Retry` with its due instant
/// pushed forward by the backoff delay for the upcoming attempt; the repeat
/// countdown is untouched. Once attempts are exhausted the job freezes in
/// `Error` with its trigger and retry count left as they were, for
/// inspection and manual rescheduling.
pub(crate) fn retry_or_error(
    job: JobDetails,
    fault: ExceptionDetails,
    backoff: &dyn Backoff,
    max_retries: u32,
    merger: &dyn JobDescriptionMerger,
) -> JobDetails {
    if job.retries < max_retries {
        let retries = job.retries + 1;
        let trigger = job.trigger.delayed_by(backoff.delay(retries));
        let recipient = merger.merge(&job.recipient, &trigger);
        job.with_trigger(trigger)
            .with_status(JobStatus::Retry)
            .with_retries(retries)
            .with_recipient(recipient)
            .with_exception(Some(fault))
    } else {
        job.with_status(JobStatus::Error).with_exception(Some(fault))
    }
}

/// The next occurrence of a job that just executed successfully, or `None`
/// when the trigger is spent and the caller should finalize the job as
/// terminal.
///
/// The next fire is anchored at `now`, the actual completion instant, not at
/// the previously scheduled instant: repeats that ran late or went through
/// retries do not accumulate drift.
pub(crate) fn next_occurrence(
    job: &JobDetails,
    now: DateTime<Utc>,
    merger: &dyn JobDescriptionMerger,
) -> Option<JobDetails> {
    let trigger = job.trigger.next_from(now)?;
    let recipient = merger.merge(&job.recipient, &trigger);
    Some(
        job.clone()
            .with_trigger(trigger)
            .with_status(JobStatus::Scheduled)
            .with_retries(0)
            .with_recipient(recipient)
            .with_exception(None),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::job::{IdentityMerger, ScheduleSpec};
    use crate::trigger::Trigger;
    use chrono::TimeDelta;

    fn at() -> DateTime<Utc> {
        "2024-04-01T12:00:00Z".parse().unwrap()
    }

    fn fault() -> ExceptionDetails {
        ExceptionDetails {
            error_type: "test".to_owned(),
            message: "boom".to_owned(),
            recorded_at: at(),
        }
    }

    fn repeating_job() -> JobDetails {
        ScheduleSpec::new("job-1", at())
            .with_repeat_interval(TimeDelta::minutes(5))
            .with_repeat_limit(2)
            .into_details()
    }

    #[test]
    fn failing_consumes_retries_then_freezes() {
        let backoff = RetryPolicy::constant(TimeDelta::seconds(10));
        let merger = IdentityMerger;
        let mut job = repeating_job();

        for attempt in 1..=3u32 {
            job = retry_or_error(job, fault(), &backoff, 3, &merger);
            assert_eq!(job.status, JobStatus::Retry);
            assert_eq!(job.retries, attempt);
            assert_eq!(
                job.trigger.has_next_fire_time(),
                Some(at() + TimeDelta::seconds(10 * attempt as i64))
            );
            assert_eq!(job.execution_timeout, job.trigger.has_next_fire_time());
        }

        let frozen = retry_or_error(job.clone(), fault(), &backoff, 3, &merger);
        assert_eq!(frozen.status, JobStatus::Error);
        // trigger and retry count are frozen for inspection
        assert_eq!(frozen.retries, 3);
        assert_eq!(
            frozen.trigger.has_next_fire_time(),
            job.trigger.has_next_fire_time()
        );
        assert_eq!(frozen.exception, Some(fault()));
    }

    #[test]
    fn retrying_does_not_consume_repeats() {
        let backoff = RetryPolicy::constant(TimeDelta::seconds(10));
        let job = repeating_job();

        let retried = retry_or_error(job, fault(), &backoff, 3, &IdentityMerger);

        // both remaining repeats still reachable after the retry
        let first = next_occurrence(&retried, at(), &IdentityMerger).unwrap();
        let second = next_occurrence(&first, at(), &IdentityMerger).unwrap();
        assert!(next_occurrence(&second, at(), &IdentityMerger).is_none());
    }

    #[test]
    fn next_occurrence_is_anchored_at_completion_time() {
        let job = repeating_job();
        let late_completion = at() + TimeDelta::minutes(17);

        let next = next_occurrence(&job, late_completion, &IdentityMerger).unwrap();

        assert_eq!(
            next.trigger.has_next_fire_time(),
            Some(late_completion + TimeDelta::minutes(5))
        );
        assert_eq!(next.execution_timeout, next.trigger.has_next_fire_time());
    }

    #[test]
    fn next_occurrence_resets_the_retry_cycle() {
        let backoff = RetryPolicy::constant(TimeDelta::seconds(10));
        let retried = retry_or_error(repeating_job(), fault(), &backoff, 3, &IdentityMerger);
        assert_eq!(retried.retries, 1);
        assert!(retried.exception.is_some());

        let next = next_occurrence(&retried, at(), &IdentityMerger).unwrap();

        assert_eq!(next.status, JobStatus::Scheduled);
        assert_eq!(next.retries, 0);
        assert!(next.exception.is_none());
    }

    #[test]
    fn one_shot_jobs_have_no_next_occurrence() {
        let job = ScheduleSpec::new("job-1", at()).into_details();

        assert!(next_occurrence(&job, at(), &IdentityMerger).is_none());
    }

    #[test]
    fn merger_rewrites_the_recipient_on_new_triggers() {
        struct DueStampMerger;
        impl JobDescriptionMerger for DueStampMerger {
            fn merge(&self, _recipient: &serde_json::Value, trigger: &Trigger) -> serde_json::Value {
                serde_json::json!({ "due": trigger.has_next_fire_time() })
            }
        }

        let next = next_occurrence(&repeating_job(), at(), &DueStampMerger).unwrap();

        assert_eq!(
            next.recipient,
            serde_json::json!({ "due": at() + TimeDelta::minutes(5) })
        );
    }

    #[test]
    fn followups_match_the_dispatch_table() {
        assert_eq!(followup_for(JobStatus::Executed), Followup::Remove);
        assert_eq!(followup_for(JobStatus::Canceled), Followup::Remove);
        assert_eq!(followup_for(JobStatus::Scheduled), Followup::Rearm);
        assert_eq!(followup_for(JobStatus::Retry), Followup::Rearm);
        assert_eq!(followup_for(JobStatus::Error), Followup::Freeze);
        assert_eq!(followup_for(JobStatus::Running), Followup::None);
    }
}
