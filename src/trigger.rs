//! Recurrence rules and next-fire-time computation.
//!
//! A [`Trigger`] pairs a recurrence rule (period, repeat countdown, optional
//! end time) with the instant the job is currently due. It is a pure value:
//! advancing it either mutates a trigger owned exclusively by the caller via
//! [`Trigger::next_fire_time`], or builds a fresh trigger via the copy
//! constructors [`Trigger::next_from`] and [`Trigger::delayed_by`] so that a
//! trigger embedded in a persisted job is never changed underneath a reader.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// The recurrence rule plus current next-fire instant for a job.
///
/// A repeat limit of `N` means `N` *additional* fires beyond the first, so a
/// job scheduled with `repeating(at, period, 2)` is due three times in total.
/// Retries shift the due instant without consuming repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    next_fire: Option<DateTime<Utc>>,
    period: Option<TimeDelta>,
    remaining_repeats: i32,
    end_time: Option<DateTime<Utc>>,
}

impl Trigger {
    /// A trigger that fires once at `at` and is then exhausted.
    pub fn one_shot(at: DateTime<Utc>) -> Self {
        Self {
            next_fire: Some(at),
            period: None,
            remaining_repeats: 0,
            end_time: None,
        }
    }

    /// A trigger that first fires at `first` and then repeats every `period`,
    /// up to `repeat_limit` further times.
    pub fn repeating(first: DateTime<Utc>, period: TimeDelta, repeat_limit: u32) -> Self {
        Self {
            next_fire: Some(first),
            period: Some(period),
            remaining_repeats: repeat_limit as i32,
            end_time: None,
        }
    }

    /// Caps the trigger: no fire is ever due after `end`.
    pub fn with_end_time(self, end: DateTime<Utc>) -> Self {
        Self {
            end_time: Some(end),
            ..self
        }
    }

    /// The instant the job is currently due, without advancing the trigger.
    pub fn has_next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire
    }

    /// Advances to the next occurrence and returns it, or `None` once the
    /// repeat countdown is spent or the end time is passed. After returning
    /// `None` the trigger is exhausted and stays exhausted.
    pub fn next_fire_time(&mut self) -> Option<DateTime<Utc>> {
        let current = self.next_fire?;
        match self.candidate_after(current) {
            Some(next) => {
                self.next_fire = Some(next);
                self.remaining_repeats -= 1;
                Some(next)
            }
            None => {
                self.next_fire = None;
                None
            }
        }
    }

    /// The next occurrence anchored at `anchor` rather than at the previous
    /// due instant. Used after a successful execution so that a repeating
    /// job's subsequent fire is `period` after the actual completion time,
    /// keeping late or retried runs from accumulating drift.
    pub fn next_from(&self, anchor: DateTime<Utc>) -> Option<Trigger> {
        let next = self.candidate_after(anchor)?;
        Some(Self {
            next_fire: Some(next),
            remaining_repeats: self.remaining_repeats - 1,
            ..*self
        })
    }

    /// A copy with the due instant pushed forward by `delta`. The repeat
    /// countdown and end time are untouched; retries do not consume repeats.
    pub fn delayed_by(&self, delta: TimeDelta) -> Trigger {
        Self {
            next_fire: self.next_fire.map(|at| at + delta),
            ..*self
        }
    }

    /// A copy with no next fire time.
    pub fn exhausted(&self) -> Trigger {
        Self {
            next_fire: None,
            ..*self
        }
    }

    /// How long from `now` until the due instant. A due instant already in
    /// the past collapses to zero, an immediate fire, never a negative
    /// duration. An exhausted trigger also yields zero.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        self.next_fire
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO)
    }

    fn candidate_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.remaining_repeats <= 0 {
            return None;
        }
        let next = from + self.period?;
        match self.end_time {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }
}
