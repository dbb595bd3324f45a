//! Retry delay strategies.
//!
//! The scheduler's default is a constant delay of
//! [`SchedulerConfig::retry_interval`](crate::scheduler::SchedulerConfig)
//! between attempts; that default is part of the compatibility contract and
//! must stay constant. [`RetryPolicy::exponential`] is available as an
//! opt-in generalization, and either can be softened with a random
//! [`Jitter`].
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use timekeep::backoff::{Backoff, Jitter, RetryPolicy};
//! # use chrono::TimeDelta;
//! let policy = RetryPolicy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(policy.delay(1), TimeDelta::seconds(2));
//! assert_eq!(policy.delay(2), TimeDelta::seconds(4));
//! assert_eq!(policy.delay(5), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Maps a retry attempt number (1-based) to the delay before that attempt.
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> TimeDelta;
}

/// Constant delay, whatever the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Backoff for Constant {
    fn delay(&self, _attempt: u32) -> TimeDelta {
        self.delay
    }
}

/// Delay growing exponentially with each attempt, optionally clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Backoff for Exponential {
    fn delay(&self, attempt: u32) -> TimeDelta {
        let mut seconds = self
            .base
            .num_seconds()
            .checked_pow(attempt)
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::seconds(seconds)
    }
}

/// A random jitter applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added uniformly from `-delta ..= delta`.
    Absolute(TimeDelta),
    /// Added as a proportion of the computed delay.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A [`Backoff`] with optional jitter and a minimum delay floor.
///
/// # Example
///
/// ```
/// # use timekeep::backoff::{Backoff, Jitter, RetryPolicy};
/// # use chrono::TimeDelta;
/// let policy = RetryPolicy::constant(TimeDelta::seconds(10))
///     .with_jitter(Jitter::Absolute(TimeDelta::seconds(2)))
///     .with_min(TimeDelta::seconds(1));
///
/// for attempt in 1..10 {
///     let delay = policy.delay(attempt);
///     assert!(delay >= TimeDelta::seconds(8));
///     assert!(delay <= TimeDelta::seconds(12));
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy<B: Backoff> {
    strategy: B,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl RetryPolicy<Constant> {
    /// The delay every retry of a failed execution waits by default.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl RetryPolicy<Exponential> {
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum delay to `max`.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.strategy.max = Some(max);
        self
    }
}

impl<B: Backoff> RetryPolicy<B> {
    pub const fn new(strategy: B) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// A floor, useful when a large jitter could otherwise produce a
    /// near-zero or negative delay.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<B: Backoff> Backoff for RetryPolicy<B> {
    fn delay(&self, attempt: u32) -> TimeDelta {
        let mut delay = self.strategy.delay(attempt);
        if let Some(jitter) = self.jitter {
            delay = jitter.apply(delay);
        }
        delay.max(self.min)
    }
}
