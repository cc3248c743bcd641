//! Read and repair operations over the main queue and the dead-letter queue.
//!
//! Every operation goes through the shared [`BrokerConnection`]; none of them
//! opens its own. Manual re-injection first claims the dead-letter entry, so
//! it cannot race the dead-letter worker for it, and publishes the copy
//! before settling the claim, so a failure part-way leaves the job in both
//! queues rather than in neither.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;

use crate::broker::{is_stale_delivery, DeathRecord, MessageState, QueueCounts, StoredMessage};
use crate::connection::{BrokerConnection, QueueKind};
use crate::correlation::CorrelationId;
use crate::error::{AdminError, AdminResult};
use crate::events::{emit, JobEventPayload, JobEventPublisher};
use crate::job::{Envelope, JobId};
use crate::ledger::{JobLedger, LedgerEntry, Transition};
use crate::producer::JobProducer;
use crate::telemetry::{admin_span, set_queue_depth};

/// Consumer tag holding dead-letter entries during a manual retry.
pub const RETRY_CONSUMER: &str = "heron-admin-retry";

/// States listed for the dead-letter queue by default.
pub const DEAD_LETTER_LIST_STATES: [MessageState; 3] = [
    MessageState::Waiting,
    MessageState::Delayed,
    MessageState::Failed,
];

/// A queue message as presented to operators.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub state: MessageState,
    pub priority: i32,
    pub correlation_id: Option<CorrelationId>,
    pub retry_count: Option<u32>,
    pub dlq_retry_count: Option<u32>,
    /// Decoded payload; `None` when the body is not a valid envelope.
    pub payload: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deliveries: u32,
    pub death: Option<DeathRecord>,
}

impl From<StoredMessage> for JobRecord {
    fn from(message: StoredMessage) -> Self {
        let envelope = Envelope::<Value>::decode(&message.body).ok();
        Self {
            id: message.id,
            queue: message.queue,
            state: message.state,
            priority: message.priority,
            correlation_id: envelope.as_ref().map(|e| e.correlation_id.clone()),
            retry_count: envelope.as_ref().map(|e| e.retry_count),
            dlq_retry_count: envelope.as_ref().map(|e| e.dlq_retry_count),
            payload: envelope.map(|e| e.payload),
            enqueued_at: message.enqueued_at,
            processed_at: message.delivered_at,
            finished_at: message.finished_at,
            deliveries: message.deliveries,
            death: message.death,
        }
    }
}

/// Depth summary for both queues.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsReport {
    pub main_queue: MainQueueStats,
    pub dlq: DeadLetterStats,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MainQueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl From<QueueCounts> for MainQueueStats {
    fn from(counts: QueueCounts) -> Self {
        Self {
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            total: counts.total(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    /// Entries awaiting a decision, including delayed and failed ones.
    pub waiting: u64,
    pub active: u64,
    pub total: u64,
}

impl From<QueueCounts> for DeadLetterStats {
    fn from(counts: QueueCounts) -> Self {
        let waiting = counts.waiting + counts.delayed + counts.failed;
        Self {
            waiting,
            active: counts.active,
            total: waiting + counts.active,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub start: usize,
    pub limit: usize,
    pub total: u64,
}

/// One page of dead-letter entries with a per-state summary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeadLetterPage {
    pub jobs: Vec<JobRecord>,
    pub pagination: Pagination,
    pub summary: QueueCounts,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryOptions {
    /// Delete the dead-letter entry once the copy is published. Otherwise
    /// the entry is kept, marked completed, for inspection.
    pub remove_from_dlq: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReceipt {
    pub dlq_job_id: JobId,
    pub new_job_id: JobId,
    #[serde(rename = "removedFromDLQ")]
    pub removed_from_dlq: bool,
    pub correlation_id: CorrelationId,
    /// Set when the job had already left the system and was replayed under a
    /// new correlation id.
    pub replay_of: Option<CorrelationId>,
}

/// Administrative view over the topology queues.
#[derive(Clone)]
pub struct QueueInspector {
    connection: Arc<BrokerConnection>,
    producer: JobProducer,
    ledger: Arc<dyn JobLedger>,
    events: Arc<dyn JobEventPublisher>,
}

impl fmt::Debug for QueueInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueInspector")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl QueueInspector {
    pub fn new(
        producer: JobProducer,
        ledger: Arc<dyn JobLedger>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            connection: Arc::clone(producer.connection()),
            producer,
            ledger,
            events,
        }
    }

    fn queue(&self, kind: QueueKind) -> &str {
        self.connection.topology().queue_name(kind)
    }

    /// Messages in `states` (every state when empty), grouped by state in the
    /// given order.
    pub async fn list_jobs(
        &self,
        kind: QueueKind,
        states: &[MessageState],
        start: usize,
        limit: usize,
    ) -> AdminResult<Vec<JobRecord>> {
        let states = if states.is_empty() {
            &MessageState::ALL[..]
        } else {
            states
        };
        let transport = self.connection.acquire().await?;
        let messages = transport
            .list(self.queue(kind), states, start, limit)
            .instrument(admin_span("list_jobs"))
            .await?;
        Ok(messages.into_iter().map(JobRecord::from).collect())
    }

    pub async fn get_job(&self, kind: QueueKind, id: &JobId) -> AdminResult<JobRecord> {
        let transport = self.connection.acquire().await?;
        let queue = self.queue(kind);
        transport
            .get(queue, id)
            .await?
            .map(JobRecord::from)
            .ok_or_else(|| AdminError::not_found(queue, id))
    }

    /// Per-state counts; also refreshes the queue depth gauges.
    pub async fn get_stats(&self, kind: QueueKind) -> AdminResult<QueueCounts> {
        let transport = self.connection.acquire().await?;
        let queue = self.queue(kind);
        let counts = transport.counts(queue).await?;
        for state in MessageState::ALL {
            set_queue_depth(queue, state.as_str(), counts.get(state));
        }
        Ok(counts)
    }

    pub async fn queue_stats(&self) -> AdminResult<QueueStatsReport> {
        let main = self.get_stats(QueueKind::Main).await?;
        let dlq = self.get_stats(QueueKind::DeadLetter).await?;
        Ok(QueueStatsReport {
            main_queue: main.into(),
            dlq: dlq.into(),
            timestamp: Utc::now(),
        })
    }

    /// A page of dead-letter entries awaiting a decision.
    pub async fn list_dead_letters(&self, start: usize, limit: usize) -> AdminResult<DeadLetterPage> {
        let summary = self.get_stats(QueueKind::DeadLetter).await?;
        let jobs = self
            .list_jobs(QueueKind::DeadLetter, &DEAD_LETTER_LIST_STATES, start, limit)
            .await?;
        let total = DEAD_LETTER_LIST_STATES
            .iter()
            .map(|state| summary.get(*state))
            .sum();
        Ok(DeadLetterPage {
            jobs,
            pagination: Pagination { start, limit, total },
            summary,
        })
    }

    /// Ledger entry for a correlation id.
    pub async fn job_status(&self, correlation_id: &CorrelationId) -> AdminResult<LedgerEntry> {
        self.ledger
            .get(correlation_id)
            .await?
            .ok_or_else(|| AdminError::NotFound {
                queue: "ledger".to_string(),
                id: JobId(correlation_id.to_string()),
            })
    }

    /// Send a dead-lettered job back to the main queue with `retryCount = 0`.
    ///
    /// The DLQ counter is preserved so the manual attempt still counts
    /// against the dead-letter ceiling. A job whose ledger entry is already
    /// terminal is replayed under a fresh correlation id.
    pub async fn retry_job(
        &self,
        dlq_job_id: &JobId,
        options: RetryOptions,
    ) -> AdminResult<RetryReceipt> {
        self.reinject(dlq_job_id, options)
            .instrument(admin_span("retry_job"))
            .await
    }

    async fn reinject(&self, dlq_job_id: &JobId, options: RetryOptions) -> AdminResult<RetryReceipt> {
        let transport = self.connection.acquire().await?;
        let dlq = self.queue(QueueKind::DeadLetter).to_string();

        let Some(claimed) = transport.claim(&dlq, dlq_job_id, RETRY_CONSUMER).await? else {
            return Err(match transport.get(&dlq, dlq_job_id).await? {
                None => AdminError::not_found(&dlq, dlq_job_id),
                Some(message) if message.state == MessageState::Completed => {
                    AdminError::InvalidState(format!(
                        "job {dlq_job_id} has already been re-injected"
                    ))
                }
                Some(_) => AdminError::InvalidState(format!(
                    "job {dlq_job_id} is being processed by the dead-letter worker"
                )),
            });
        };

        let (envelope, new_job_id, replay_of) = match self.publish_copy(&claimed.message).await {
            Ok(published) => published,
            Err(err) => {
                // A failed entry keeps its finish time; it goes back to failed.
                let requeue = claimed.message.finished_at.is_none();
                if let Err(release) = transport.nack(&claimed.tag, requeue, None).await {
                    tracing::warn!(
                        dlq_job_id = %dlq_job_id,
                        "failed to release claimed dead-letter entry: {release:#}"
                    );
                }
                return Err(err);
            }
        };

        let main = self.queue(QueueKind::Main).to_string();
        match transport.ack(&claimed.tag).await {
            Ok(()) => {}
            Err(err) if is_stale_delivery(&err) => {
                if let Err(retract) = transport.remove(&main, &new_job_id).await {
                    tracing::warn!(new_job_id = %new_job_id, "failed to retract manual retry: {retract:#}");
                }
                return Err(AdminError::InvalidState(format!(
                    "job {dlq_job_id} was reclaimed while it was being re-injected"
                )));
            }
            Err(err) => return Err(err.into()),
        }
        let removed_from_dlq = options.remove_from_dlq && transport.remove(&dlq, dlq_job_id).await?;

        if let Err(err) = self
            .ledger
            .observe(
                &envelope.correlation_id,
                Transition::Enqueued {
                    job_id: new_job_id.clone(),
                    queue: main,
                    retry_count: 0,
                    dlq_retry_count: envelope.dlq_retry_count,
                    replay_of: replay_of.clone(),
                },
            )
            .await
        {
            tracing::error!(new_job_id = %new_job_id, "failed to record manual retry: {err:#}");
        }
        emit(
            self.events.as_ref(),
            &envelope.correlation_id,
            JobEventPayload::Reinjected {
                dlq_job_id: dlq_job_id.clone(),
                new_job_id: new_job_id.clone(),
                dlq_retry_count: envelope.dlq_retry_count,
            },
        )
        .await;

        tracing::info!(
            dlq_job_id = %dlq_job_id,
            new_job_id = %new_job_id,
            removed_from_dlq,
            replayed = replay_of.is_some(),
            "dead-letter job manually re-injected"
        );

        Ok(RetryReceipt {
            dlq_job_id: dlq_job_id.clone(),
            new_job_id,
            removed_from_dlq,
            correlation_id: envelope.correlation_id,
            replay_of,
        })
    }

    /// Publish a fresh main-queue copy of a claimed dead-letter entry.
    async fn publish_copy(
        &self,
        message: &StoredMessage,
    ) -> AdminResult<(Envelope<Value>, JobId, Option<CorrelationId>)> {
        let mut envelope = Envelope::<Value>::decode(&message.body).map_err(|_| {
            AdminError::InvalidState(format!("job {} has no original job data", message.id))
        })?;
        envelope.retry_count = 0;

        let previous = self.ledger.get(&envelope.correlation_id).await?;
        let replay_of = match previous {
            Some(entry) if entry.is_terminal() => Some(std::mem::replace(
                &mut envelope.correlation_id,
                CorrelationId::new(),
            )),
            _ => None,
        };

        let new_job_id = self
            .producer
            .publish(QueueKind::Main, &envelope, Duration::ZERO)
            .await?;
        Ok((envelope, new_job_id, replay_of))
    }

    /// Remove every non-active dead-letter entry. Requires `confirm`.
    pub async fn clear_dlq(&self, confirm: bool) -> AdminResult<u64> {
        if !confirm {
            return Err(AdminError::PreconditionFailed(
                "clearing the dead-letter queue requires confirm=true".to_string(),
            ));
        }
        let transport = self.connection.acquire().await?;
        let dlq = self.queue(QueueKind::DeadLetter);
        let removed = transport
            .purge(dlq, &DEAD_LETTER_LIST_STATES)
            .instrument(admin_span("clear_dlq"))
            .await?;
        tracing::warn!(queue = %dlq, removed, "dead-letter queue cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker, MemoryConnector, OutboundMessage, QueueInspect};
    use crate::connection::Topology;
    use crate::events::InProcEventBus;
    use crate::ledger::{FailureRecord, InMemoryLedger, LedgerState};
    use serde_json::json;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        ledger: Arc<InMemoryLedger>,
        inspector: QueueInspector,
    }

    async fn fixture() -> Fixture {
        let broker = InMemoryBroker::shared();
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(MemoryConnector::new(broker.clone())),
            Topology::default(),
        ));
        connection.acquire().await.unwrap();
        let ledger = Arc::new(InMemoryLedger::new());
        let events = Arc::new(InProcEventBus::default());
        let producer = JobProducer::new(connection, ledger.clone(), events.clone());
        Fixture {
            broker,
            ledger: ledger.clone(),
            inspector: QueueInspector::new(producer, ledger, events),
        }
    }

    async fn dead_letter(fx: &Fixture, dlq_retry_count: u32) -> (JobId, CorrelationId) {
        let mut envelope = Envelope::new(json!({ "type": "summary" }));
        envelope.retry_count = 3;
        envelope.dlq_retry_count = dlq_retry_count;
        let id = fx
            .broker
            .publish(
                "dead-letter-queue",
                OutboundMessage::persistent(envelope.encode().unwrap()),
            )
            .await
            .unwrap();
        (id, envelope.correlation_id)
    }

    #[tokio::test]
    async fn test_retry_job_publishes_then_removes() {
        let fx = fixture().await;
        let (dlq_id, correlation_id) = dead_letter(&fx, 1).await;

        let receipt = fx
            .inspector
            .retry_job(&dlq_id, RetryOptions { remove_from_dlq: true })
            .await
            .unwrap();
        assert!(receipt.removed_from_dlq);
        assert_eq!(receipt.correlation_id, correlation_id);
        assert!(receipt.replay_of.is_none());
        assert!(fx.broker.get("dead-letter-queue", &dlq_id).await.unwrap().is_none());

        let copy = fx
            .inspector
            .get_job(QueueKind::Main, &receipt.new_job_id)
            .await
            .unwrap();
        assert_eq!(copy.retry_count, Some(0));
        assert_eq!(copy.dlq_retry_count, Some(1));
        assert_eq!(copy.correlation_id, Some(correlation_id));
    }

    #[tokio::test]
    async fn test_retry_job_without_removal_archives_entry() {
        let fx = fixture().await;
        let (dlq_id, _) = dead_letter(&fx, 0).await;

        let receipt = fx
            .inspector
            .retry_job(&dlq_id, RetryOptions::default())
            .await
            .unwrap();
        assert!(!receipt.removed_from_dlq);
        let entry = fx.inspector.get_job(QueueKind::DeadLetter, &dlq_id).await.unwrap();
        assert_eq!(entry.state, MessageState::Completed);

        let err = fx
            .inspector
            .retry_job(&dlq_id, RetryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_retry_unknown_job_is_not_found() {
        let fx = fixture().await;
        let err = fx
            .inspector
            .retry_job(&JobId::from("missing"), RetryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::NotFound { .. }));
        assert_eq!(fx.broker.counts("main-queue").await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_retry_of_dropped_job_replays_under_new_correlation() {
        let fx = fixture().await;
        let (dlq_id, correlation_id) = dead_letter(&fx, 3).await;
        fx.ledger
            .observe(
                &correlation_id,
                Transition::Dropped {
                    dlq_retry_count: 3,
                    failure: Some(FailureRecord::new("boom", None)),
                },
            )
            .await
            .unwrap();

        let receipt = fx
            .inspector
            .retry_job(&dlq_id, RetryOptions { remove_from_dlq: true })
            .await
            .unwrap();
        assert_eq!(receipt.replay_of, Some(correlation_id.clone()));
        assert_ne!(receipt.correlation_id, correlation_id);

        let replay = fx.inspector.job_status(&receipt.correlation_id).await.unwrap();
        assert_eq!(replay.state, LedgerState::Waiting);
        assert_eq!(replay.replay_of, Some(correlation_id.clone()));
        let original = fx.inspector.job_status(&correlation_id).await.unwrap();
        assert_eq!(original.state, LedgerState::Failed);
    }

    #[tokio::test]
    async fn test_undecodable_entry_cannot_be_retried() {
        let fx = fixture().await;
        let id = fx
            .broker
            .publish("dead-letter-queue", OutboundMessage::persistent("???"))
            .await
            .unwrap();
        let err = fx
            .inspector
            .retry_job(&id, RetryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidState(_)));

        let record = fx.inspector.get_job(QueueKind::DeadLetter, &id).await.unwrap();
        assert!(record.payload.is_none());
        assert_eq!(record.state, MessageState::Waiting);
    }

    #[tokio::test]
    async fn test_retry_loses_to_dead_letter_worker_without_duplicating() {
        let fx = fixture().await;
        let (dlq_id, _) = dead_letter(&fx, 0).await;

        let delivery = fx
            .broker
            .receive("dead-letter-queue", "dlq-worker")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.id, dlq_id);

        let err = fx
            .inspector
            .retry_job(&dlq_id, RetryOptions { remove_from_dlq: true })
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidState(_)));
        assert_eq!(fx.broker.counts("main-queue").await.unwrap().total(), 0);

        // The worker still owns its delivery and settles it normally.
        fx.broker.ack(&delivery.tag).await.unwrap();
    }

    #[tokio::test]
    async fn test_claimed_entry_is_hidden_from_dead_letter_worker() {
        let fx = fixture().await;
        let (dlq_id, _) = dead_letter(&fx, 0).await;

        let claimed = fx
            .broker
            .claim("dead-letter-queue", &dlq_id, "other-admin")
            .await
            .unwrap()
            .unwrap();
        assert!(fx
            .broker
            .receive("dead-letter-queue", "dlq-worker")
            .await
            .unwrap()
            .is_none());
        let err = fx
            .inspector
            .retry_job(&dlq_id, RetryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidState(_)));

        fx.broker.nack(&claimed.tag, true, None).await.unwrap();
        let receipt = fx
            .inspector
            .retry_job(&dlq_id, RetryOptions::default())
            .await
            .unwrap();
        assert!(fx
            .broker
            .receive("dead-letter-queue", "dlq-worker")
            .await
            .unwrap()
            .is_none());
        assert_eq!(fx.broker.counts("main-queue").await.unwrap().waiting, 1);
        assert!(fx.broker.get("main-queue", &receipt.new_job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_requires_confirmation() {
        let fx = fixture().await;
        dead_letter(&fx, 0).await;
        dead_letter(&fx, 0).await;

        let err = fx.inspector.clear_dlq(false).await.unwrap_err();
        assert!(matches!(err, AdminError::PreconditionFailed(_)));
        assert_eq!(fx.inspector.get_stats(QueueKind::DeadLetter).await.unwrap().total(), 2);

        assert_eq!(fx.inspector.clear_dlq(true).await.unwrap(), 2);
        assert_eq!(fx.inspector.get_stats(QueueKind::DeadLetter).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_stats_and_dead_letter_page() {
        let fx = fixture().await;
        for _ in 0..3 {
            dead_letter(&fx, 0).await;
        }
        fx.broker
            .publish("main-queue", OutboundMessage::persistent("{}"))
            .await
            .unwrap();

        let report = fx.inspector.queue_stats().await.unwrap();
        assert_eq!(report.main_queue.waiting, 1);
        assert_eq!(report.main_queue.total, 1);
        assert_eq!(report.dlq.waiting, 3);
        assert_eq!(report.dlq.total, 3);

        let page = fx.inspector.list_dead_letters(1, 1).await.unwrap();
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.pagination.total, 3);
        assert_eq!(page.summary.waiting, 3);

        let value = serde_json::to_value(&report).unwrap();
        assert!(value.get("mainQueue").is_some());
        assert!(value.get("dlq").is_some());
    }

    #[tokio::test]
    async fn test_get_missing_job_is_not_found() {
        let fx = fixture().await;
        let err = fx
            .inspector
            .get_job(QueueKind::Main, &JobId::from("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "job nope not found in main-queue");
    }
}
