use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::Instrument;

use crate::broker::{clamp_priority, OutboundMessage};
use crate::connection::{BrokerConnection, QueueKind};
use crate::events::{emit, JobEventPayload, JobEventPublisher};
use crate::job::{Envelope, Job, JobId, Payload};
use crate::ledger::{JobLedger, Transition};
use crate::telemetry::{job_enqueue_span, record_job_enqueued};

/// Per-call publishing options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Higher is served first, within `-MAX_PRIORITY..=MAX_PRIORITY`.
    /// `None` means the transport default.
    pub priority: Option<i32>,
    /// Hold the job back for this long before it becomes available.
    pub delay: Duration,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(clamp_priority(priority));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Publishes jobs to the main queue.
///
/// Cheap to clone. Every clone shares the same broker connection, so a
/// producer may be handed to any number of request handlers.
#[derive(Clone)]
pub struct JobProducer {
    connection: Arc<BrokerConnection>,
    ledger: Arc<dyn JobLedger>,
    events: Arc<dyn JobEventPublisher>,
}

impl fmt::Debug for JobProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProducer")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl JobProducer {
    pub fn new(
        connection: Arc<BrokerConnection>,
        ledger: Arc<dyn JobLedger>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            connection,
            ledger,
            events,
        }
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Enqueue `payload` with a fresh correlation id and `retryCount = 0`.
    pub async fn enqueue<P: Payload>(&self, payload: P) -> anyhow::Result<Job<P>> {
        self.enqueue_with(payload, EnqueueOptions::default()).await
    }

    /// Enqueue with explicit options.
    ///
    /// Resolves once the transport has accepted the message. A failure to
    /// record the enqueue in the ledger is logged but does not fail the call,
    /// since the job is already on the queue.
    pub async fn enqueue_with<P: Payload>(
        &self,
        payload: P,
        options: EnqueueOptions,
    ) -> anyhow::Result<Job<P>> {
        let envelope = Envelope::new(payload).with_priority(options.priority);
        let queue = self
            .connection
            .topology()
            .queue_name(QueueKind::Main)
            .to_string();
        let span = job_enqueue_span(&queue, &envelope.correlation_id);
        self.enqueue_envelope(envelope, queue, options.delay)
            .instrument(span)
            .await
    }

    async fn enqueue_envelope<P: Payload>(
        &self,
        envelope: Envelope<P>,
        queue: String,
        delay: Duration,
    ) -> anyhow::Result<Job<P>> {
        let job_id = self
            .publish(QueueKind::Main, &envelope, delay)
            .await?;
        let correlation_id = envelope.correlation_id.clone();

        if let Err(err) = self
            .ledger
            .observe(
                &correlation_id,
                Transition::Enqueued {
                    job_id: job_id.clone(),
                    queue: queue.clone(),
                    retry_count: 0,
                    dlq_retry_count: 0,
                    replay_of: None,
                },
            )
            .await
        {
            tracing::error!(job_id = %job_id, "failed to record enqueue in ledger: {err:#}");
        }

        emit(
            self.events.as_ref(),
            &correlation_id,
            JobEventPayload::Enqueued {
                job_id: job_id.clone(),
                queue: queue.clone(),
                priority: envelope.priority,
            },
        )
        .await;
        record_job_enqueued(&queue, &job_id);

        Ok(Job::from_envelope(job_id, envelope, Utc::now(), None))
    }

    /// Publish an envelope to a topology queue as a persistent message.
    ///
    /// Does not touch the ledger; callers that move an existing job record
    /// the transition themselves.
    pub async fn publish<P: Payload>(
        &self,
        kind: QueueKind,
        envelope: &Envelope<P>,
        delay: Duration,
    ) -> anyhow::Result<JobId> {
        let message = OutboundMessage::persistent(envelope.encode()?)
            .with_priority(envelope.priority)
            .with_delay(delay);
        self.publish_message(kind, message).await
    }

    pub(crate) async fn publish_message(
        &self,
        kind: QueueKind,
        message: OutboundMessage,
    ) -> anyhow::Result<JobId> {
        let transport = self.connection.acquire().await?;
        let queue = self.connection.topology().queue_name(kind);
        let id = transport.publish(queue, message).await.map_err(|err| {
            tracing::error!(queue, "publish failed: {err:#}");
            err.context(format!("failed to publish to {queue}"))
        })?;
        tracing::debug!(queue, job_id = %id, "message published");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, MemoryConnector, MessageState, QueueInspect};
    use crate::connection::Topology;
    use crate::events::InProcEventBus;
    use crate::ledger::{InMemoryLedger, LedgerState};
    use serde_json::json;

    fn producer() -> (JobProducer, Arc<InMemoryBroker>, Arc<InMemoryLedger>, Arc<InProcEventBus>) {
        let broker = InMemoryBroker::shared();
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(MemoryConnector::new(broker.clone())),
            Topology::default(),
        ));
        let ledger = Arc::new(InMemoryLedger::new());
        let events = Arc::new(InProcEventBus::new(16));
        (
            JobProducer::new(connection, ledger.clone(), events.clone()),
            broker,
            ledger,
            events,
        )
    }

    #[tokio::test]
    async fn test_enqueue_publishes_fresh_envelope() {
        let (producer, broker, ledger, events) = producer();
        let mut rx = events.subscribe_jobs();

        let job = producer.enqueue(json!({ "type": "chat" })).await.unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.dlq_retry_count, 0);

        let stored = broker.get("main-queue", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Waiting);
        assert!(stored.persistent);
        let envelope = Envelope::<serde_json::Value>::decode(&stored.body).unwrap();
        assert_eq!(envelope.correlation_id, job.correlation_id);
        assert_eq!(envelope.retry_count, 0);

        let entry = ledger.get(&job.correlation_id).await.unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Waiting);
        assert_eq!(entry.job_id, job.id);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.name(), "enqueued");
    }

    #[tokio::test]
    async fn test_correlation_ids_are_unique() {
        let (producer, ..) = producer();
        let a = producer.enqueue(json!(1)).await.unwrap();
        let b = producer.enqueue(json!(1)).await.unwrap();
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_enqueue_with_priority_and_delay() {
        let (producer, broker, ..) = producer();
        let job = producer
            .enqueue_with(
                json!({}),
                EnqueueOptions::default()
                    .with_priority(7)
                    .with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let stored = broker.get("main-queue", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Delayed);
        assert_eq!(stored.priority, 7);
        assert_eq!(job.priority, Some(7));
    }

    struct RefusingConnector;

    #[async_trait::async_trait]
    impl crate::connection::Connector for RefusingConnector {
        async fn connect(&self) -> anyhow::Result<Arc<dyn crate::broker::Transport>> {
            anyhow::bail!("connection refused")
        }

        fn endpoint(&self) -> String {
            "test://down".into()
        }
    }

    #[tokio::test]
    async fn test_enqueue_fails_when_transport_unreachable() {
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(RefusingConnector),
            Topology::default(),
        ));
        let ledger = Arc::new(InMemoryLedger::new());
        let producer = JobProducer::new(
            connection,
            ledger.clone(),
            Arc::new(InProcEventBus::default()),
        );

        let err = producer.enqueue(json!({})).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
        assert!(ledger.is_empty());
    }
}
