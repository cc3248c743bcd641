use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tracing::Instrument;

use crate::broker::{is_stale_delivery, FailureContext, Transport};
use crate::connection::{QueueKind, Topology};
use crate::consumer::{drive, Consumer, InboundJob};
use crate::events::{emit, JobEventPayload, JobEventPublisher};
use crate::job::{Envelope, JobId};
use crate::ledger::{FailureRecord, JobLedger, Transition};
use crate::producer::JobProducer;
use crate::retry::{DeadLetterDecision, DeadLetterPolicy};
use crate::runtime::ShutdownToken;
use crate::telemetry::{dead_letter_span, record_dead_letter};

/// What the dead-letter worker did with one entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    Reinjected {
        new_job_id: JobId,
        dlq_retry_count: u32,
    },
    Dropped {
        dlq_retry_count: u32,
    },
    Rejected {
        reason: String,
    },
    /// The entry's delivery went stale before it was settled.
    Reclaimed {
        dlq_job_id: JobId,
    },
}

/// Consumes the dead-letter queue, giving each job a bounded number of
/// further lives on the main queue.
///
/// Payloads are handled as opaque JSON; only the envelope counters are
/// touched.
pub struct DeadLetterWorker {
    transport: Arc<dyn Transport>,
    producer: JobProducer,
    ledger: Arc<dyn JobLedger>,
    events: Arc<dyn JobEventPublisher>,
    topology: Topology,
    policy: DeadLetterPolicy,
}

impl fmt::Debug for DeadLetterWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterWorker")
            .field("queue", &self.topology.dead_letter_queue)
            .field("policy", &self.policy)
            .finish()
    }
}

impl DeadLetterWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        producer: JobProducer,
        ledger: Arc<dyn JobLedger>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        let topology = producer.connection().topology().clone();
        Self {
            transport,
            producer,
            ledger,
            events,
            topology,
            policy: DeadLetterPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DeadLetterPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &DeadLetterPolicy {
        &self.policy
    }

    pub fn consumer(&self, tag: impl Into<String>, prefetch: usize, shutdown: ShutdownToken) -> Consumer {
        Consumer::new(
            Arc::clone(&self.transport),
            self.topology.dead_letter_queue.clone(),
            tag,
            prefetch,
            shutdown,
        )
    }

    pub async fn run(self: Arc<Self>, consumer: Arc<Consumer>, slot: String) -> anyhow::Result<()> {
        drive(consumer, slot, |inbound| {
            let worker = Arc::clone(&self);
            async move { worker.handle(inbound).await }
        })
        .await
    }

    pub async fn handle(&self, inbound: InboundJob) -> anyhow::Result<DeadLetterOutcome> {
        let envelope = match inbound.decode::<Value>() {
            Ok(envelope) => envelope,
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::error!(
                    job_id = %inbound.id(),
                    "dead-letter entry has no decodable job data: {reason}"
                );
                let dlq_job_id = inbound.id().clone();
                match inbound
                    .nack(false, Some(FailureContext::new(reason.clone())))
                    .await
                {
                    Ok(()) => {}
                    Err(err) if is_stale_delivery(&err) => {
                        return Ok(self.reclaimed(dlq_job_id, None).await);
                    }
                    Err(err) => {
                        return Err(err.context("failed to reject malformed dead-letter entry"))
                    }
                }
                return Ok(DeadLetterOutcome::Rejected { reason });
            }
        };

        let span = dead_letter_span(inbound.id(), &envelope.correlation_id);
        self.settle(inbound, envelope).instrument(span).await
    }

    async fn settle(
        &self,
        inbound: InboundJob,
        mut envelope: Envelope<Value>,
    ) -> anyhow::Result<DeadLetterOutcome> {
        let dlq_job_id = inbound.id().clone();
        let correlation_id = envelope.correlation_id.clone();
        let dlq_retry_count = envelope.dlq_retry_count + 1;
        let death = inbound.message().death.clone();

        tracing::info!(
            dlq_retry_count,
            max_dlq_retries = self.policy.max_retries,
            original_job_id = death.as_ref().map(|d| d.original_job_id.to_string()),
            failure_reason = death.as_ref().map(|d| d.failure_reason.as_str()),
            "dead-letter job received"
        );

        match self.policy.decide(dlq_retry_count) {
            DeadLetterDecision::Drop { dlq_retry_count } => {
                let reason = format!(
                    "dead-letter retries exhausted ({dlq_retry_count} > {})",
                    self.policy.max_retries
                );
                tracing::error!(
                    dlq_retry_count,
                    payload = %envelope.payload,
                    "job permanently dropped after exhausting dead-letter retries"
                );
                let settled = inbound
                    .nack(
                        false,
                        Some(
                            FailureContext::new(reason.clone())
                                .with_attempts(dlq_retry_count, self.policy.max_retries),
                        ),
                    )
                    .await;
                match settled {
                    Ok(()) => {}
                    Err(err) if is_stale_delivery(&err) => {
                        return Ok(self.reclaimed(dlq_job_id, None).await);
                    }
                    Err(err) => return Err(err.context("failed to settle dropped dead-letter entry")),
                }

                let failure = death
                    .map(|d| FailureRecord::new(d.failure_reason, d.failure_stack))
                    .unwrap_or_else(|| FailureRecord::new(reason, None));
                self.ledger
                    .observe(
                        &correlation_id,
                        Transition::Dropped {
                            dlq_retry_count,
                            failure: Some(failure),
                        },
                    )
                    .await
                    .context("failed to record dropped job")?;
                emit(
                    self.events.as_ref(),
                    &correlation_id,
                    JobEventPayload::Dropped {
                        dlq_job_id,
                        dlq_retry_count,
                    },
                )
                .await;
                record_dead_letter("dropped");
                Ok(DeadLetterOutcome::Dropped { dlq_retry_count })
            }
            DeadLetterDecision::Reinject { dlq_retry_count } => {
                envelope.retry_count = 0;
                envelope.dlq_retry_count = dlq_retry_count;

                let new_job_id = self
                    .producer
                    .publish(QueueKind::Main, &envelope, self.policy.reinject_delay)
                    .await
                    .context("failed to re-inject dead-lettered job")?;
                match inbound.ack().await {
                    Ok(()) => {}
                    Err(err) if is_stale_delivery(&err) => {
                        return Ok(self.reclaimed(dlq_job_id, Some(new_job_id)).await);
                    }
                    Err(err) => {
                        return Err(err.context("failed to acknowledge re-injected dead-letter entry"))
                    }
                }

                tracing::info!(
                    new_job_id = %new_job_id,
                    dlq_retry_count,
                    delay_ms = self.policy.reinject_delay.as_millis() as u64,
                    "job re-injected into main queue"
                );

                self.ledger
                    .observe(
                        &correlation_id,
                        Transition::Reinjected {
                            job_id: new_job_id.clone(),
                            queue: self.topology.main_queue.clone(),
                            dlq_retry_count,
                        },
                    )
                    .await
                    .context("failed to record re-injection")?;
                emit(
                    self.events.as_ref(),
                    &correlation_id,
                    JobEventPayload::Reinjected {
                        dlq_job_id,
                        new_job_id: new_job_id.clone(),
                        dlq_retry_count,
                    },
                )
                .await;
                record_dead_letter("reinjected");
                Ok(DeadLetterOutcome::Reinjected {
                    new_job_id,
                    dlq_retry_count,
                })
            }
        }
    }
}

impl DeadLetterWorker {
    /// Give up on an entry whose delivery went stale, removing the main-queue
    /// copy already published for it.
    async fn reclaimed(&self, dlq_job_id: JobId, reinjected: Option<JobId>) -> DeadLetterOutcome {
        tracing::warn!(
            dlq_job_id = %dlq_job_id,
            queue = %self.topology.dead_letter_queue,
            "dead-letter delivery was reclaimed before it could be settled"
        );
        if let Some(copy) = reinjected {
            let queue = &self.topology.main_queue;
            match self.transport.remove(queue, &copy).await {
                Ok(true) => tracing::debug!(job_id = %copy, queue, "retracted re-injected copy"),
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    job_id = %copy,
                    queue,
                    "re-injected copy already picked up: {err:#}"
                ),
            }
        }
        DeadLetterOutcome::Reclaimed { dlq_job_id }
    }
}
