//! External transaction-boundary hook.
//!
//! Some embedding environments need the scheduler's persistence and timer
//! bookkeeping to be observed atomically with an external commit, for
//! example an outbox-pattern transaction. [`JobSynchronization`] is the seam
//! for that: the scheduler funnels every persist-and-rearm sequence through
//! [`synchronize`](JobSynchronization::synchronize), and the embedder decides
//! what boundary to wrap around it. The default, [`InlineSynchronization`],
//! runs the action immediately.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::store::StoreError;

/// A persistence-and-bookkeeping sequence to run under the embedder's
/// atomicity boundary.
pub type SyncAction<'a> = BoxFuture<'a, Result<(), StoreError>>;

#[async_trait]
pub trait JobSynchronization: Send + Sync {
    /// Runs `action`, returning its result to the scheduler. Implementations
    /// must run the action exactly once; they may wrap it with whatever
    /// external transaction handling they need.
    async fn synchronize<'a>(&self, action: SyncAction<'a>) -> Result<(), StoreError>;
}

/// Default synchronization: runs the action immediately, inline.
pub struct InlineSynchronization;

#[async_trait]
impl JobSynchronization for InlineSynchronization {
    async fn synchronize<'a>(&self, action: SyncAction<'a>) -> Result<(), StoreError> {
        action.await
    }
}
