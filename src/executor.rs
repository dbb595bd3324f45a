//! Pluggable job execution.
//!
//! When a job's timer fires, every registered [`JobExecutor`] whose
//! [`accept`](JobExecutor::accept) predicate holds is invoked in registration
//! order. Executors perform the job's actual side effect and may fail; a
//! failure feeds the retry state machine rather than surfacing to any caller.
//!
//! Executors should be idempotent: the scheduler guarantees at most one fire
//! per window per instance, but multiple instances racing over a shared store
//! can produce the occasional duplicate fire.

use async_trait::async_trait;
use chrono::Utc;
use std::error::Error;

use crate::job::{ExceptionDetails, JobDetails};

/// Performs the side effect of a job when its timer fires.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Whether this executor applies to the given job.
    fn accept(&self, _job: &JobDetails) -> bool {
        true
    }

    async fn execute(&self, job: &JobDetails) -> Result<(), Box<dyn ExecutionError>>;
}

/// A typed execution failure.
///
/// The `error_type` is a stable discriminator persisted alongside the failure
/// message so operators can distinguish failure classes without parsing
/// messages.
pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;
}

impl From<Box<dyn ExecutionError>> for ExceptionDetails {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: value.error_type().to_owned(),
            message: value.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::job::JobId;
    use std::sync::{Arc, Mutex};

    /// Records every job it executes; always succeeds.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingExecutor {
        pub(crate) runs: Arc<Mutex<Vec<JobId>>>,
    }

    impl RecordingExecutor {
        pub(crate) fn run_count(&self) -> usize {
            self.runs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn execute(&self, job: &JobDetails) -> Result<(), Box<dyn ExecutionError>> {
            self.runs.lock().unwrap().push(job.id.clone());
            Ok(())
        }
    }

    #[derive(Debug)]
    pub(crate) struct TestError(pub(crate) String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    impl ExecutionError for TestError {
        fn error_type(&self) -> &'static str {
            "test"
        }
    }

    /// Fails every attempt, counting them.
    #[derive(Clone, Default)]
    pub(crate) struct FailingExecutor {
        pub(crate) attempts: Arc<Mutex<u32>>,
    }

    impl FailingExecutor {
        pub(crate) fn attempt_count(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }
    }

    #[async_trait]
    impl JobExecutor for FailingExecutor {
        async fn execute(&self, _job: &JobDetails) -> Result<(), Box<dyn ExecutionError>> {
            *self.attempts.lock().unwrap() += 1;
            Err(Box::new(TestError("executor blew up".to_owned())))
        }
    }

    #[test]
    fn exception_details_carry_the_error_type() {
        let error: Box<dyn ExecutionError> = Box::new(TestError("boom".to_owned()));

        let details = ExceptionDetails::from(error);

        assert_eq!(details.error_type, "test");
        assert_eq!(details.message, "boom");
    }
}
