//! Main-queue job worker.
//!
//! Each delivery is processed once and then settled in exactly one way:
//!
//! - success: ack.
//! - failure below the retry ceiling: publish a fresh copy with
//!   `retryCount + 1` (after the configured backoff), then ack the original.
//! - failure at the ceiling: route to the dead-letter queue, either by
//!   rejecting through the transport's binding or by publishing an explicit
//!   dead-letter record and acking.
//!
//! The copy is always published before the original is acked, so a crash in
//! between duplicates the job rather than losing it.
//!
//! A job that runs past the queue's stall timeout may have its delivery
//! handed to another consumer. Settling it then fails with
//! [`StaleDelivery`](crate::broker::StaleDelivery); the worker retracts any
//! copy it already published and leaves the job to the redelivery.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::Instrument;

use crate::broker::{is_stale_delivery, FailureContext, OutboundMessage, Transport};
use crate::connection::{QueueKind, Topology};
use crate::consumer::{drive, Consumer, InboundJob};
use crate::events::{emit, JobEventPayload, JobEventPublisher};
use crate::job::{Envelope, Job, JobId, Payload};
use crate::ledger::{FailureRecord, JobLedger, Transition};
use crate::producer::JobProducer;
use crate::retry::{RequeueStrategy, RetryDecision, RetryPolicy};
use crate::runtime::ShutdownToken;
use crate::telemetry::{
    job_process_span, record_job_end, record_job_processed, record_job_start, Outcome,
};

/// User-supplied processing function.
///
/// An `Err` (or a panic) counts as a failed attempt and feeds the retry
/// policy. The function must tolerate being invoked more than once for the
/// same job.
#[async_trait]
pub trait JobProcessor<P: Payload>: Send + Sync {
    async fn process(&self, job: &Job<P>) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`JobProcessor`].
pub struct FnProcessor<P, F> {
    f: F,
    _payload: PhantomData<fn(P)>,
}

/// Wrap `f` as a processor. The closure receives an owned copy of the job.
pub fn processor_fn<P, F, Fut>(f: F) -> FnProcessor<P, F>
where
    P: Payload,
    F: Fn(Job<P>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnProcessor {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> JobProcessor<P> for FnProcessor<P, F>
where
    P: Payload,
    F: Fn(Job<P>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(&self, job: &Job<P>) -> anyhow::Result<()> {
        (self.f)(job.clone()).await
    }
}

/// How a delivery was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed {
        retry_count: u32,
    },
    Requeued {
        new_job_id: JobId,
        retry_count: u32,
        delay: Duration,
    },
    DeadLettered {
        attempts_made: u32,
        /// Id of the explicit dead-letter record, when one was published.
        dlq_job_id: Option<JobId>,
    },
    /// The body could not be decoded and was rejected without processing.
    Rejected {
        reason: String,
    },
    /// The delivery went stale before it was settled; the message had
    /// already been redelivered or dead-lettered by the stall scanner.
    Reclaimed {
        job_id: JobId,
    },
}

pub struct JobWorker<P: Payload> {
    transport: Arc<dyn Transport>,
    producer: JobProducer,
    ledger: Arc<dyn JobLedger>,
    events: Arc<dyn JobEventPublisher>,
    processor: Arc<dyn JobProcessor<P>>,
    topology: Topology,
    policy: RetryPolicy,
    strategy: RequeueStrategy,
}

impl<P: Payload> fmt::Debug for JobWorker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobWorker")
            .field("queue", &self.topology.main_queue)
            .field("policy", &self.policy)
            .field("strategy", &self.strategy)
            .field("payload_type", &std::any::type_name::<P>())
            .finish()
    }
}

impl<P: Payload> JobWorker<P> {
    pub fn new(
        transport: Arc<dyn Transport>,
        producer: JobProducer,
        ledger: Arc<dyn JobLedger>,
        events: Arc<dyn JobEventPublisher>,
        processor: Arc<dyn JobProcessor<P>>,
    ) -> Self {
        let topology = producer.connection().topology().clone();
        Self {
            transport,
            producer,
            ledger,
            events,
            processor,
            topology,
            policy: RetryPolicy::default(),
            strategy: RequeueStrategy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_strategy(mut self, strategy: RequeueStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// A consumer on the main queue sharing this worker's transport.
    pub fn consumer(&self, tag: impl Into<String>, prefetch: usize, shutdown: ShutdownToken) -> Consumer {
        Consumer::new(
            Arc::clone(&self.transport),
            self.topology.main_queue.clone(),
            tag,
            prefetch,
            shutdown,
        )
    }

    /// Process deliveries from `consumer` until shutdown.
    pub async fn run(self: Arc<Self>, consumer: Arc<Consumer>, slot: String) -> anyhow::Result<()> {
        drive(consumer, slot, |inbound| {
            let worker = Arc::clone(&self);
            async move { worker.handle(inbound).await }
        })
        .await
    }

    /// Process and settle one delivery.
    ///
    /// Returns an error only when settlement or bookkeeping failed; processing
    /// failures are absorbed into the returned outcome.
    pub async fn handle(&self, inbound: InboundJob) -> anyhow::Result<WorkerOutcome> {
        let envelope = match inbound.decode::<P>() {
            Ok(envelope) => envelope,
            Err(err) => return self.reject_malformed(inbound, err).await,
        };

        let span = job_process_span(
            &self.topology.main_queue,
            inbound.id(),
            &envelope.correlation_id,
            envelope.retry_count,
        );
        self.process(inbound, envelope).instrument(span).await
    }

    async fn reject_malformed(
        &self,
        inbound: InboundJob,
        err: anyhow::Error,
    ) -> anyhow::Result<WorkerOutcome> {
        let reason = format!("{err:#}");
        tracing::error!(
            job_id = %inbound.id(),
            queue = %self.topology.main_queue,
            "rejecting undecodable message: {reason}"
        );
        let job_id = inbound.id().clone();
        match inbound
            .nack(false, Some(FailureContext::new(reason.clone())))
            .await
        {
            Ok(()) => {}
            Err(err) if is_stale_delivery(&err) => return Ok(self.reclaimed(job_id, None).await),
            Err(err) => return Err(err.context("failed to reject malformed message")),
        }
        record_job_processed(&self.topology.main_queue, Outcome::Rejected);
        Ok(WorkerOutcome::Rejected { reason })
    }

    async fn process(
        &self,
        inbound: InboundJob,
        envelope: Envelope<P>,
    ) -> anyhow::Result<WorkerOutcome> {
        let queue = self.topology.main_queue.clone();
        let message = inbound.message().clone();
        let correlation_id = envelope.correlation_id.clone();

        tracing::info!(
            retry_count = envelope.retry_count,
            dlq_retry_count = envelope.dlq_retry_count,
            redelivered = inbound.redelivered(),
            "job received"
        );

        self.ledger
            .observe(
                &correlation_id,
                Transition::Started {
                    job_id: message.id.clone(),
                    queue: queue.clone(),
                    retry_count: envelope.retry_count,
                    dlq_retry_count: envelope.dlq_retry_count,
                },
            )
            .await
            .context("failed to record job start")?;
        emit(
            self.events.as_ref(),
            &correlation_id,
            JobEventPayload::Received {
                job_id: message.id.clone(),
                queue: queue.clone(),
                retry_count: envelope.retry_count,
                redelivered: inbound.redelivered(),
            },
        )
        .await;

        let job = Job::from_envelope(
            message.id.clone(),
            envelope,
            message.enqueued_at,
            message.delivered_at,
        );
        let timing = record_job_start(&job.id);

        let result = AssertUnwindSafe(self.processor.process(&job))
            .catch_unwind()
            .await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(FailureRecord::new(err.to_string(), Some(format!("{err:?}")))),
            Err(panic) => Some(FailureRecord::new(panic_message(panic.as_ref()), None)),
        };

        let Some(failure) = failure else {
            match inbound.ack().await {
                Ok(()) => {}
                Err(err) if is_stale_delivery(&err) => {
                    record_job_end(timing, &queue, Outcome::Reclaimed);
                    return Ok(self.reclaimed(job.id.clone(), None).await);
                }
                Err(err) => return Err(err.context("failed to acknowledge processed job")),
            }
            tracing::info!("job completed");
            self.ledger
                .observe(
                    &correlation_id,
                    Transition::Completed {
                        job_id: job.id.clone(),
                    },
                )
                .await
                .context("failed to record job completion")?;
            emit(
                self.events.as_ref(),
                &correlation_id,
                JobEventPayload::Completed {
                    job_id: job.id.clone(),
                    retry_count: job.retry_count,
                },
            )
            .await;
            record_job_processed(&queue, Outcome::Completed);
            record_job_end(timing, &queue, Outcome::Completed);
            return Ok(WorkerOutcome::Completed {
                retry_count: job.retry_count,
            });
        };

        let retry_count = job.retry_count + 1;
        tracing::warn!(
            retry_count,
            max_retries = self.policy.max_retries,
            reason = %failure.reason,
            "job processing failed"
        );

        let outcome = match self.policy.decide(retry_count) {
            RetryDecision::Requeue { retry_count, delay } => {
                self.requeue(inbound, &job, retry_count, delay, failure).await?
            }
            RetryDecision::DeadLetter { attempts_made } => {
                self.dead_letter(inbound, &job, attempts_made, failure).await?
            }
        };

        let label = match outcome {
            WorkerOutcome::Requeued { .. } => Outcome::Retried,
            WorkerOutcome::Reclaimed { .. } => Outcome::Reclaimed,
            _ => Outcome::DeadLettered,
        };
        if label != Outcome::Reclaimed {
            record_job_processed(&queue, label);
        }
        record_job_end(timing, &queue, label);
        Ok(outcome)
    }

    async fn requeue(
        &self,
        inbound: InboundJob,
        job: &Job<P>,
        retry_count: u32,
        delay: Duration,
        failure: FailureRecord,
    ) -> anyhow::Result<WorkerOutcome> {
        let mut envelope = job.envelope();
        envelope.retry_count = retry_count;

        let new_job_id = self
            .producer
            .publish(QueueKind::Main, &envelope, delay)
            .await
            .context("failed to requeue job")?;
        match inbound.ack().await {
            Ok(()) => {}
            Err(err) if is_stale_delivery(&err) => {
                return Ok(self
                    .reclaimed(job.id.clone(), Some((QueueKind::Main, new_job_id)))
                    .await);
            }
            Err(err) => return Err(err.context("failed to acknowledge requeued job")),
        }

        tracing::info!(
            new_job_id = %new_job_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "job requeued"
        );

        self.ledger
            .observe(
                &job.correlation_id,
                Transition::Retried {
                    job_id: new_job_id.clone(),
                    retry_count,
                    failure,
                },
            )
            .await
            .context("failed to record job retry")?;
        emit(
            self.events.as_ref(),
            &job.correlation_id,
            JobEventPayload::Retried {
                job_id: job.id.clone(),
                new_job_id: new_job_id.clone(),
                retry_count,
                delay,
            },
        )
        .await;

        Ok(WorkerOutcome::Requeued {
            new_job_id,
            retry_count,
            delay,
        })
    }

    async fn dead_letter(
        &self,
        inbound: InboundJob,
        job: &Job<P>,
        attempts_made: u32,
        failure: FailureRecord,
    ) -> anyhow::Result<WorkerOutcome> {
        let context = FailureContext::new(failure.reason.clone())
            .with_stack(failure.stack.clone())
            .with_attempts(attempts_made, self.policy.max_retries);

        let dlq_job_id = match self.strategy {
            RequeueStrategy::TransportDeadLetter => {
                match inbound.nack(false, Some(context)).await {
                    Ok(()) => {}
                    Err(err) if is_stale_delivery(&err) => {
                        return Ok(self.reclaimed(job.id.clone(), None).await);
                    }
                    Err(err) => return Err(err.context("failed to dead-letter job")),
                }
                None
            }
            RequeueStrategy::ExplicitDeadLetter => {
                let now = Utc::now();
                let mut envelope = job.envelope();
                envelope.retry_count = attempts_made;
                let death = context.into_death(job.id.clone(), &self.topology.main_queue, now);
                let message = OutboundMessage::persistent(envelope.encode()?)
                    .with_priority(envelope.priority)
                    .with_id(JobId::dead_letter(&job.id, now))
                    .with_death(death);
                let id = self
                    .producer
                    .publish_message(QueueKind::DeadLetter, message)
                    .await
                    .context("failed to write dead-letter record")?;
                match inbound.ack().await {
                    Ok(()) => {}
                    Err(err) if is_stale_delivery(&err) => {
                        return Ok(self
                            .reclaimed(job.id.clone(), Some((QueueKind::DeadLetter, id)))
                            .await);
                    }
                    Err(err) => return Err(err.context("failed to acknowledge dead-lettered job")),
                }
                Some(id)
            }
        };

        tracing::error!(
            attempts_made,
            reason = %failure.reason,
            dead_letter_queue = %self.topology.dead_letter_queue,
            "job moved to dead-letter queue"
        );

        let reason = failure.reason.clone();
        self.ledger
            .observe(
                &job.correlation_id,
                Transition::DeadLettered {
                    job_id: dlq_job_id.clone(),
                    queue: self.topology.dead_letter_queue.clone(),
                    failure,
                },
            )
            .await
            .context("failed to record dead-lettering")?;
        emit(
            self.events.as_ref(),
            &job.correlation_id,
            JobEventPayload::DeadLettered {
                job_id: job.id.clone(),
                attempts_made,
                reason,
            },
        )
        .await;

        Ok(WorkerOutcome::DeadLettered {
            attempts_made,
            dlq_job_id,
        })
    }

    /// Give up on a delivery that went stale while its job ran, removing the
    /// copy already published on its behalf so only the redelivery proceeds.
    async fn reclaimed(&self, job_id: JobId, published: Option<(QueueKind, JobId)>) -> WorkerOutcome {
        tracing::warn!(
            job_id = %job_id,
            queue = %self.topology.main_queue,
            "delivery was reclaimed before it could be settled; leaving the job to its redelivery"
        );
        if let Some((kind, copy)) = published {
            let queue = self.topology.queue_name(kind);
            match self.transport.remove(queue, &copy).await {
                Ok(true) => tracing::debug!(job_id = %copy, queue, "retracted copy of reclaimed job"),
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    job_id = %copy,
                    queue,
                    "copy of reclaimed job already picked up: {err:#}"
                ),
            }
        }
        WorkerOutcome::Reclaimed { job_id }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("processor panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("processor panicked: {message}")
    } else {
        "processor panicked".to_string()
    }
}
