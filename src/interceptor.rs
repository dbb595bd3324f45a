//! Ordered middleware around the timeout task.
//!
//! Interceptors wrap the future that processes a fired timer, for
//! cross-cutting concerns such as metrics, tracing, or throttling. The chain
//! is sorted once when the scheduler is built: lower
//! [`priority`](TimeoutInterceptor::priority) values wrap outermost, so they
//! observe the entire run of everything after them.

use futures::future::BoxFuture;
use std::sync::Arc;

/// The timeout-processing future an interceptor wraps.
pub type TimeoutTask = BoxFuture<'static, ()>;

pub trait TimeoutInterceptor: Send + Sync {
    /// Position in the chain; lower values run outermost. Ties keep
    /// registration order.
    fn priority(&self) -> i32 {
        0
    }

    /// Returns a task that must drive `next` exactly once.
    fn intercept(&self, next: TimeoutTask) -> TimeoutTask;
}

/// Applies a priority-sorted chain around `task`.
pub(crate) fn chain(
    interceptors: &[Arc<dyn TimeoutInterceptor>],
    task: TimeoutTask,
) -> TimeoutTask {
    interceptors
        .iter()
        .rev()
        .fold(task, |task, interceptor| interceptor.intercept(task))
}
