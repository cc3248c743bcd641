use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::correlation::CorrelationId;
use crate::job::JobId;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: CorrelationId,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: CorrelationId, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id,
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(correlation_id: &CorrelationId, payload: JobEventPayload) -> Self {
        let key = format!("{}-{}", payload.name(), payload.job_id());
        Self {
            meta: EventMeta::new(correlation_id.clone(), key),
            payload,
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job was published to the main queue by a producer.
    Enqueued {
        job_id: JobId,
        queue: String,
        priority: Option<i32>,
    },
    /// A worker picked the job up.
    Received {
        job_id: JobId,
        queue: String,
        retry_count: u32,
        redelivered: bool,
    },
    /// Processing succeeded and the message was acknowledged.
    Completed {
        job_id: JobId,
        retry_count: u32,
    },
    /// Processing failed and a fresh copy was published.
    Retried {
        job_id: JobId,
        new_job_id: JobId,
        retry_count: u32,
        delay: Duration,
    },
    /// Retries exhausted; the job moved to the dead-letter queue.
    DeadLettered {
        job_id: JobId,
        attempts_made: u32,
        reason: String,
    },
    /// The dead-letter worker (or an operator) sent the job back.
    Reinjected {
        dlq_job_id: JobId,
        new_job_id: JobId,
        dlq_retry_count: u32,
    },
    /// The job left the system without succeeding.
    Dropped {
        dlq_job_id: JobId,
        dlq_retry_count: u32,
    },
    /// A delivery went unacknowledged past the stall timeout.
    Stalled {
        job_id: JobId,
        queue: String,
        rejected: bool,
    },
}

impl JobEventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            JobEventPayload::Enqueued { .. } => "enqueued",
            JobEventPayload::Received { .. } => "received",
            JobEventPayload::Completed { .. } => "completed",
            JobEventPayload::Retried { .. } => "retried",
            JobEventPayload::DeadLettered { .. } => "dead_lettered",
            JobEventPayload::Reinjected { .. } => "reinjected",
            JobEventPayload::Dropped { .. } => "dropped",
            JobEventPayload::Stalled { .. } => "stalled",
        }
    }

    /// The message the event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEventPayload::Enqueued { job_id, .. }
            | JobEventPayload::Received { job_id, .. }
            | JobEventPayload::Completed { job_id, .. }
            | JobEventPayload::Retried { job_id, .. }
            | JobEventPayload::DeadLettered { job_id, .. }
            | JobEventPayload::Stalled { job_id, .. } => job_id,
            JobEventPayload::Reinjected { dlq_job_id, .. }
            | JobEventPayload::Dropped { dlq_job_id, .. } => dlq_job_id,
        }
    }
}

/// Trait for publishing job lifecycle events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    /// Publish a job event.
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;
    /// Subscribe to job events.
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged` and skips
/// ahead; publishing with no subscribers is not an error.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

/// Publish an event, logging instead of failing on error.
pub(crate) async fn emit(
    events: &dyn JobEventPublisher,
    correlation_id: &CorrelationId,
    payload: JobEventPayload,
) {
    let name = payload.name();
    if let Err(err) = events.publish(JobEvent::new(correlation_id, payload)).await {
        tracing::error!(event = name, "publish job event failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn completed(id: &str) -> JobEventPayload {
        JobEventPayload::Completed {
            job_id: JobId::from(id),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        bus.publish(JobEvent::new(&CorrelationId::new(), completed("a")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = InProcEventBus::new(16);
        let mut rx1 = bus.subscribe_jobs();
        let mut rx2 = bus.subscribe_jobs();
        assert_eq!(bus.subscriber_count(), 2);

        let corr = CorrelationId::new();
        emit(&bus, &corr, completed("a")).await;

        for rx in [&mut rx1, &mut rx2] {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.meta.correlation_id, corr);
            assert_eq!(event.meta.idempotency_key, "completed-a");
            assert_eq!(event.payload, completed("a"));
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_reports_skipped() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe_jobs();
        for i in 0..5 {
            emit(&bus, &CorrelationId::new(), completed(&i.to_string())).await;
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        let value = serde_json::to_value(JobEventPayload::Dropped {
            dlq_job_id: JobId::from("dlq-1"),
            dlq_retry_count: 3,
        })
        .unwrap();
        assert_eq!(value["event"], "dropped");
        assert_eq!(value["dlq_retry_count"], 3);
    }
}
