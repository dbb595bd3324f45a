//! The persisted job model.
//!
//! [`JobDetails`] is the unit of scheduling state held by a
//! [`JobStore`](crate::store::JobStore). Every state transition builds a new
//! value from the previous one with the `with_*` methods; an instance handed
//! to a listener is never changed underneath it.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::fmt::Display;

use crate::trigger::Trigger;

/// Unique job identifier, stable across reschedules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a job currently is in its lifecycle.
///
/// `Scheduled` and `Retry` always carry a next fire time; `Executed` and
/// `Canceled` never do and are removable from the store. `Error` is terminal
/// but kept for inspection until an operator intervenes. `Running` is an
/// observability-only transition and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Running,
    Retry,
    Executed,
    Canceled,
    Error,
}

/// Details of the last failed execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionDetails {
    pub error_type: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// The persisted unit of scheduling state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDetails {
    pub id: JobId,
    /// Caller-supplied grouping key; not unique.
    pub correlation_id: String,
    pub status: JobStatus,
    pub trigger: Trigger,
    /// Retry attempts consumed for the current execution cycle.
    pub retries: u32,
    /// Successful executions across the job's lifetime.
    pub execution_counter: u32,
    /// The absolute instant the next fire is due; mirrors the trigger's next
    /// fire time for query and indexing purposes.
    pub execution_timeout: Option<DateTime<Utc>>,
    /// Opaque caller payload, carried through retries and repeats.
    pub recipient: serde_json::Value,
    /// Populated only while the last attempt failed.
    pub exception: Option<ExceptionDetails>,
}

impl JobDetails {
    pub fn with_status(self, status: JobStatus) -> Self {
        Self { status, ..self }
    }

    /// Replaces the trigger, keeping `execution_timeout` in sync with it.
    pub fn with_trigger(self, trigger: Trigger) -> Self {
        Self {
            execution_timeout: trigger.has_next_fire_time(),
            trigger,
            ..self
        }
    }

    pub fn with_retries(self, retries: u32) -> Self {
        Self { retries, ..self }
    }

    pub fn with_exception(self, exception: Option<ExceptionDetails>) -> Self {
        Self { exception, ..self }
    }

    pub fn with_recipient(self, recipient: serde_json::Value) -> Self {
        Self { recipient, ..self }
    }

    pub fn with_execution_counter(self, execution_counter: u32) -> Self {
        Self {
            execution_counter,
            ..self
        }
    }

    pub fn with_incremented_counter(self) -> Self {
        Self {
            execution_counter: self.execution_counter + 1,
            ..self
        }
    }

    /// Whether the job is live from the store's point of view: due to fire
    /// again rather than finished, canceled, or frozen in error.
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Scheduled | JobStatus::Retry)
    }
}

/// The caller's description of a job to schedule.
///
/// # Example
///
/// ```
/// # use timekeep::job::ScheduleSpec;
/// # use chrono::{TimeDelta, Utc};
/// let spec = ScheduleSpec::new("reminder-42", Utc::now() + TimeDelta::minutes(10))
///     .with_correlation_id("reminders")
///     .with_repeat_interval(TimeDelta::hours(1))
///     .with_repeat_limit(5)
///     .with_recipient(serde_json::json!({ "channel": "email" }));
/// ```
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    id: JobId,
    correlation_id: Option<String>,
    expire_at: DateTime<Utc>,
    repeat_interval: Option<TimeDelta>,
    repeat_limit: u32,
    end_time: Option<DateTime<Utc>>,
    recipient: serde_json::Value,
}

impl ScheduleSpec {
    /// A one-shot job due at `expire_at`. Instants already in the past are
    /// normalized to an immediate fire when the timer is armed.
    pub fn new(id: impl Into<JobId>, expire_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            correlation_id: None,
            expire_at,
            repeat_interval: None,
            repeat_limit: 0,
            end_time: None,
            recipient: serde_json::Value::Null,
        }
    }

    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..self
        }
    }

    pub fn with_repeat_interval(self, repeat_interval: TimeDelta) -> Self {
        Self {
            repeat_interval: Some(repeat_interval),
            ..self
        }
    }

    /// Additional fires beyond the first; `2` yields three executions.
    pub fn with_repeat_limit(self, repeat_limit: u32) -> Self {
        Self {
            repeat_limit,
            ..self
        }
    }

    pub fn with_end_time(self, end_time: DateTime<Utc>) -> Self {
        Self {
            end_time: Some(end_time),
            ..self
        }
    }

    pub fn with_recipient(self, recipient: serde_json::Value) -> Self {
        Self { recipient, ..self }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub(crate) fn trigger(&self) -> Trigger {
        let trigger = match self.repeat_interval {
            Some(period) => Trigger::repeating(self.expire_at, period, self.repeat_limit),
            None => Trigger::one_shot(self.expire_at),
        };
        match self.end_time {
            Some(end) => trigger.with_end_time(end),
            None => trigger,
        }
    }

    pub(crate) fn into_details(self) -> JobDetails {
        let trigger = self.trigger();
        JobDetails {
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| self.id.as_str().to_owned()),
            id: self.id,
            status: JobStatus::Scheduled,
            execution_timeout: trigger.has_next_fire_time(),
            trigger,
            retries: 0,
            execution_counter: 0,
            recipient: self.recipient,
            exception: None,
        }
    }
}

/// Rewrites the opaque recipient payload whenever a retry or repeat computes
/// a new trigger, so caller-specific timing data can track the job.
pub trait JobDescriptionMerger: Send + Sync {
    fn merge(&self, recipient: &serde_json::Value, trigger: &Trigger) -> serde_json::Value;
}

/// Default merger: the recipient is carried through unchanged.
pub struct IdentityMerger;

impl JobDescriptionMerger for IdentityMerger {
    fn merge(&self, recipient: &serde_json::Value, _trigger: &Trigger) -> serde_json::Value {
        recipient.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn at() -> DateTime<Utc> {
        "2024-04-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn spec_builds_scheduled_details() {
        let job = ScheduleSpec::new("job-1", at())
            .with_recipient(serde_json::json!({ "kind": "ping" }))
            .into_details();

        assert_eq!(job.id, "job-1".into());
        assert_eq!(job.correlation_id, "job-1");
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.execution_timeout, Some(at()));
        assert_eq!(job.retries, 0);
        assert_eq!(job.execution_counter, 0);
        assert!(job.exception.is_none());
    }

    #[test]
    fn repeating_spec_carries_the_limit() {
        let job = ScheduleSpec::new("job-1", at())
            .with_repeat_interval(TimeDelta::minutes(1))
            .with_repeat_limit(2)
            .into_details();

        let next = job.trigger.next_from(at()).unwrap();
        assert_eq!(next.has_next_fire_time(), Some(at() + TimeDelta::minutes(1)));
    }

    #[test]
    fn with_trigger_keeps_execution_timeout_in_sync() {
        let job = ScheduleSpec::new("job-1", at()).into_details();
        let shifted = job.trigger.delayed_by(TimeDelta::seconds(10));

        let job = job.with_trigger(shifted);
        assert_eq!(job.execution_timeout, Some(at() + TimeDelta::seconds(10)));

        let job = job.clone().with_trigger(job.trigger.exhausted());
        assert_eq!(job.execution_timeout, None);
    }

    #[test]
    fn identity_merger_preserves_the_recipient() {
        let recipient = serde_json::json!({ "kind": "ping" });
        let trigger = Trigger::one_shot(at());

        assert_eq!(IdentityMerger.merge(&recipient, &trigger), recipient);
    }
}
