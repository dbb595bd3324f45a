//! Job lifecycle event fan-out.
//!
//! Every state transition the scheduler drives is offered to the configured
//! [`EventAdapter`]s; each accepted transition becomes an [`OutboundEvent`]
//! handed to every [`EventPublisher`]. Dispatch is fire-and-forget: it runs
//! on a spawned task and publisher failures are logged, never propagated, so
//! a broken transport cannot roll back or stall a state transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::job::{JobDetails, JobStatus};

/// The state transition that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventKind {
    Scheduled,
    Running,
    Executed,
    Retried,
    Failed,
    Canceled,
}

/// A job state transition, with the job as it looked when it happened.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: JobDetails,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub(crate) fn now(kind: JobEventKind, job: JobDetails) -> Self {
        Self {
            kind,
            job,
            at: Utc::now(),
        }
    }
}

/// The wire representation handed to publishers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    pub job_id: String,
    pub correlation_id: String,
    pub kind: JobEventKind,
    pub status: JobStatus,
    pub due: Option<DateTime<Utc>>,
    pub retries: u32,
    pub execution_counter: u32,
    pub recipient: serde_json::Value,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Decides which transitions leave the process and how they are shaped.
pub trait EventAdapter: Send + Sync {
    fn accept(&self, event: &JobEvent) -> bool;

    fn adapt(&self, event: &JobEvent) -> OutboundEvent;
}

/// Default adapter: forwards every transition with the full job state.
pub struct JobDetailsEventAdapter;

impl EventAdapter for JobDetailsEventAdapter {
    fn accept(&self, _event: &JobEvent) -> bool {
        true
    }

    fn adapt(&self, event: &JobEvent) -> OutboundEvent {
        OutboundEvent {
            job_id: event.job.id.to_string(),
            correlation_id: event.job.correlation_id.clone(),
            kind: event.kind,
            status: event.job.status,
            due: event.job.trigger.has_next_fire_time(),
            retries: event.job.retries,
            execution_counter: event.job.execution_counter,
            recipient: event.job.recipient.clone(),
            error: event.job.exception.as_ref().map(|e| e.message.clone()),
            at: event.at,
        }
    }
}

#[derive(Debug, Error)]
#[error("Failed to publish event: {0}")]
pub struct PublishError(pub String);

/// Hands adapted events to the outside world.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError>;
}

pub(crate) struct EventFanout {
    adapters: Vec<Arc<dyn EventAdapter>>,
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl EventFanout {
    pub(crate) fn new(
        adapters: Vec<Arc<dyn EventAdapter>>,
        publishers: Vec<Arc<dyn EventPublisher>>,
    ) -> Self {
        Self {
            adapters,
            publishers,
        }
    }

    pub(crate) fn dispatch(&self, event: JobEvent) {
        if self.publishers.is_empty() {
            return;
        }
        let outbound: Vec<OutboundEvent> = self
            .adapters
            .iter()
            .filter(|adapter| adapter.accept(&event))
            .map(|adapter| adapter.adapt(&event))
            .collect();
        if outbound.is_empty() {
            return;
        }
        let publishers = self.publishers.clone();
        tokio::spawn(async move {
            let publications = publishers.iter().flat_map(|publisher| {
                outbound
                    .iter()
                    .map(move |event| publisher.publish(event.clone()))
            });
            futures::future::join_all(publications)
                .await
                .into_iter()
                .filter_map(Result::err)
                .for_each(|err| {
                    tracing::error!(?err, "Failed to publish job event: {err}");
                });
        });
    }
}
