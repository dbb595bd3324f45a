//! The purpose of this module is to alleviate the need to import many of the
//! `timekeep` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use timekeep::prelude::*;
//! ```
pub use crate::backoff::{Backoff, Jitter, RetryPolicy};
pub use crate::event::{EventAdapter, EventPublisher, JobEvent, JobEventKind, OutboundEvent};
pub use crate::executor::{ExecutionError, JobExecutor};
pub use crate::interceptor::TimeoutInterceptor;
pub use crate::job::{JobDescriptionMerger, JobDetails, JobId, JobStatus, ScheduleSpec};
pub use crate::store::JobStore;
pub use crate::sync::JobSynchronization;
pub use crate::trigger::Trigger;
pub use crate::Scheduler;
pub use crate::SchedulerBuilder;
pub use crate::SchedulerConfig;
pub use crate::SchedulerError;
