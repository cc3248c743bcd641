use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::broker::{MessageState, StallReport, Transport, STALLED_REASON};
use crate::config::WorkerConfig;
use crate::connection::{BrokerConnection, QueueKind, Topology};
use crate::correlation::CorrelationId;
use crate::dead_letter::DeadLetterWorker;
use crate::events::{emit, JobEventPayload, JobEventPublisher};
use crate::inspector::QueueInspector;
use crate::job::{Envelope, JobId, Payload};
use crate::ledger::{FailureRecord, JobLedger, Transition};
use crate::producer::JobProducer;
use crate::rate_limit::TokenBucket;
use crate::retry::{DeadLetterPolicy, RequeueStrategy, RetryPolicy};
use crate::telemetry::set_queue_depth;
use crate::worker::{JobProcessor, JobWorker};

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-level owner of the job workers, the dead-letter worker and the
/// housekeeper.
pub struct HeronRuntime<P: Payload> {
    config: WorkerConfig,
    connection: Arc<BrokerConnection>,
    producer: JobProducer,
    inspector: QueueInspector,
    ledger: Arc<dyn JobLedger>,
    events: Arc<dyn JobEventPublisher>,
    processor: Arc<dyn JobProcessor<P>>,
    retry_policy: RetryPolicy,
    strategy: RequeueStrategy,
    dead_letter_policy: Option<DeadLetterPolicy>,
    shutdown_token: ShutdownToken,
    consumer_tags: Mutex<Vec<String>>,
    worker_handles: Mutex<Vec<JoinHandle<anyhow::Result<()>>>>,
    started: AtomicBool,
}

impl<P: Payload> fmt::Debug for HeronRuntime<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeronRuntime")
            .field("config", &self.config)
            .field("connection", &self.connection)
            .field("retry_policy", &self.retry_policy)
            .field("strategy", &self.strategy)
            .field("dead_letter_policy", &self.dead_letter_policy)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("shutdown", &self.shutdown_token.is_cancelled())
            .field("payload_type", &std::any::type_name::<P>())
            .finish()
    }
}

impl<P: Payload> HeronRuntime<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        connection: Arc<BrokerConnection>,
        ledger: Arc<dyn JobLedger>,
        events: Arc<dyn JobEventPublisher>,
        processor: Arc<dyn JobProcessor<P>>,
        retry_policy: RetryPolicy,
        strategy: RequeueStrategy,
        dead_letter_policy: Option<DeadLetterPolicy>,
    ) -> Self {
        let producer = JobProducer::new(
            Arc::clone(&connection),
            Arc::clone(&ledger),
            Arc::clone(&events),
        );
        let inspector =
            QueueInspector::new(producer.clone(), Arc::clone(&ledger), Arc::clone(&events));
        Self {
            config,
            connection,
            producer,
            inspector,
            ledger,
            events,
            processor,
            retry_policy,
            strategy,
            dead_letter_policy,
            shutdown_token: ShutdownToken::new(),
            consumer_tags: Mutex::new(Vec::new()),
            worker_handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn connection(&self) -> Arc<BrokerConnection> {
        Arc::clone(&self.connection)
    }

    pub fn topology(&self) -> &Topology {
        self.connection.topology()
    }

    /// A producer sharing the runtime's connection and ledger.
    pub fn producer(&self) -> JobProducer {
        self.producer.clone()
    }

    pub fn inspector(&self) -> QueueInspector {
        self.inspector.clone()
    }

    pub fn ledger(&self) -> Arc<dyn JobLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn events(&self) -> Arc<dyn JobEventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Connect, then spawn the worker slots, the dead-letter worker (when
    /// enabled) and the housekeeper.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("heron runtime already started");
        }

        let transport = self.connection.acquire().await?;
        let topology = self.connection.topology().clone();
        let group = std::process::id();
        let mut handles = self.worker_handles.lock().await;
        let mut tags = self.consumer_tags.lock().await;

        let worker = Arc::new(
            JobWorker::new(
                Arc::clone(&transport),
                self.producer.clone(),
                Arc::clone(&self.ledger),
                Arc::clone(&self.events),
                Arc::clone(&self.processor),
            )
            .with_retry_policy(self.retry_policy.clone())
            .with_strategy(self.strategy),
        );
        let concurrency = self.config.concurrency.max(1);
        let limiter = self.config.rate_limit.as_ref().map(TokenBucket::from_config);
        let consumer = Arc::new(
            worker
                .consumer(
                    format!("{}-{group}", topology.main_queue),
                    concurrency,
                    self.shutdown_token.clone(),
                )
                .with_poll_interval(self.config.poll_interval())
                .with_rate_limit(limiter),
        );
        tags.push(consumer.tag().to_string());

        for i in 0..concurrency {
            let slot = format!("{}-w{i}", consumer.tag());
            let worker = Arc::clone(&worker);
            let consumer = Arc::clone(&consumer);
            handles.push(tokio::spawn(worker.run(consumer, slot)));
        }

        if let Some(policy) = &self.dead_letter_policy {
            let dead_letters = Arc::new(
                DeadLetterWorker::new(
                    Arc::clone(&transport),
                    self.producer.clone(),
                    Arc::clone(&self.ledger),
                    Arc::clone(&self.events),
                )
                .with_policy(policy.clone()),
            );
            let consumer = Arc::new(
                dead_letters
                    .consumer(
                        format!("{}-{group}", topology.dead_letter_queue),
                        1,
                        self.shutdown_token.clone(),
                    )
                    .with_poll_interval(self.config.poll_interval()),
            );
            tags.push(consumer.tag().to_string());
            let slot = format!("{}-w0", consumer.tag());
            handles.push(tokio::spawn(dead_letters.run(consumer, slot)));
        }

        let housekeeper = Housekeeper {
            transport,
            topology: topology.clone(),
            ledger: Arc::clone(&self.ledger),
            events: Arc::clone(&self.events),
        };
        handles.push(housekeeper.spawn(self.config.housekeeper_interval(), self.shutdown_token.clone()));

        tracing::info!(
            main_queue = %topology.main_queue,
            dead_letter_queue = %topology.dead_letter_queue,
            concurrency,
            dead_letter_worker = self.dead_letter_policy.is_some(),
            "heron runtime started"
        );
        Ok(())
    }

    /// Gracefully shut down: stop pulling, let in-flight jobs settle, return
    /// anything still unsettled to its queue, then close the connection.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("initiating graceful shutdown of heron runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let timeout = self.config.shutdown_timeout();
        for mut handle in handles {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => tracing::warn!("worker task exited with error: {err:#}"),
                Ok(Err(err)) => tracing::warn!("worker task failed: {err:?}"),
                Err(_) => {
                    tracing::warn!("worker task timed out during shutdown");
                    handle.abort();
                }
            }
        }

        if self.connection.is_connected().await {
            let transport = self.connection.acquire().await?;
            let tags = std::mem::take(&mut *self.consumer_tags.lock().await);
            for tag in tags {
                match transport.recover(&tag).await {
                    Ok(0) => {}
                    Ok(recovered) => {
                        tracing::info!(consumer = %tag, recovered, "returned unsettled deliveries")
                    }
                    Err(err) => tracing::warn!(consumer = %tag, "recover failed: {err:#}"),
                }
            }
        }
        self.connection.shutdown().await?;

        tracing::info!("heron runtime shutdown complete");
        Ok(())
    }
}

/// Periodic stall detection and queue depth sampling.
pub(crate) struct Housekeeper {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) topology: Topology,
    pub(crate) ledger: Arc<dyn JobLedger>,
    pub(crate) events: Arc<dyn JobEventPublisher>,
}

impl Housekeeper {
    fn spawn(
        self,
        interval: std::time::Duration,
        shutdown: ShutdownToken,
    ) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => self.tick().await,
                }
            }
            Ok(())
        })
    }

    pub(crate) async fn tick(&self) {
        for kind in [QueueKind::Main, QueueKind::DeadLetter] {
            let queue = self.topology.queue_name(kind);
            match self.transport.requeue_stalled(queue).await {
                Ok(report) if !report.is_empty() => self.record_stalls(kind, &report).await,
                Ok(_) => {}
                Err(err) => tracing::warn!(queue, "housekeeper stall scan error: {err:#}"),
            }

            match self.transport.counts(queue).await {
                Ok(counts) => {
                    for state in MessageState::ALL {
                        set_queue_depth(queue, state.as_str(), counts.get(state));
                    }
                }
                Err(err) => tracing::warn!(queue, "housekeeper depth sample error: {err:#}"),
            }
        }
    }

    async fn record_stalls(&self, kind: QueueKind, report: &StallReport) {
        let queue = self.topology.queue_name(kind);
        for id in &report.requeued {
            tracing::warn!(queue, job_id = %id, "stalled delivery returned to queue");
            if let Some(correlation_id) = self.correlation_of(queue, id).await {
                emit(
                    self.events.as_ref(),
                    &correlation_id,
                    JobEventPayload::Stalled {
                        job_id: id.clone(),
                        queue: queue.to_string(),
                        rejected: false,
                    },
                )
                .await;
            }
        }

        for id in &report.rejected {
            tracing::error!(queue, job_id = %id, "delivery stalled too often; rejected");
            let entry = match self.ledger.find_by_job_id(id).await {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(job_id = %id, "ledger lookup failed: {err:#}");
                    None
                }
            };
            let correlation_id = match entry {
                Some(entry) => entry.correlation_id,
                None => match self.correlation_of(queue, id).await {
                    Some(correlation_id) => correlation_id,
                    None => continue,
                },
            };

            let failure = FailureRecord::new(STALLED_REASON, None);
            let transition = match kind {
                QueueKind::Main => Transition::DeadLettered {
                    job_id: None,
                    queue: self.topology.dead_letter_queue.clone(),
                    failure,
                },
                QueueKind::DeadLetter => Transition::Dropped {
                    dlq_retry_count: self.dlq_retry_count(queue, id).await,
                    failure: Some(failure),
                },
            };
            if let Err(err) = self.ledger.observe(&correlation_id, transition).await {
                tracing::warn!(job_id = %id, "failed to record stall: {err:#}");
            }
            emit(
                self.events.as_ref(),
                &correlation_id,
                JobEventPayload::Stalled {
                    job_id: id.clone(),
                    queue: queue.to_string(),
                    rejected: true,
                },
            )
            .await;
        }
    }

    async fn envelope_of(&self, queue: &str, id: &JobId) -> Option<Envelope<serde_json::Value>> {
        let message = self.transport.get(queue, id).await.ok().flatten()?;
        Envelope::decode(&message.body).ok()
    }

    async fn correlation_of(&self, queue: &str, id: &JobId) -> Option<CorrelationId> {
        self.envelope_of(queue, id).await.map(|e| e.correlation_id)
    }

    async fn dlq_retry_count(&self, queue: &str, id: &JobId) -> u32 {
        self.envelope_of(queue, id)
            .await
            .map(|e| e.dlq_retry_count)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker, MemoryConnector, QueueInspect};
    use crate::events::InProcEventBus;
    use crate::job::Job;
    use crate::ledger::{InMemoryLedger, LedgerState};
    use crate::worker::processor_fn;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::timeout;

    fn build_runtime(broker: Arc<InMemoryBroker>) -> HeronRuntime<Value> {
        let topology = Topology::default().with_stall_timeout(Duration::from_millis(20));
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(MemoryConnector::new(broker)),
            topology,
        ));
        HeronRuntime::new(
            WorkerConfig::default()
                .with_concurrency(2)
                .with_poll_interval(Duration::from_millis(5))
                .with_rate_limit(None)
                .with_housekeeper_interval(Duration::from_millis(10)),
            connection,
            Arc::new(InMemoryLedger::new()),
            Arc::new(InProcEventBus::default()),
            Arc::new(processor_fn(|_job: Job<Value>| async { Ok(()) })),
            RetryPolicy::default(),
            RequeueStrategy::default(),
            Some(DeadLetterPolicy::default()),
        )
    }

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let clone = token.clone();
                tokio::spawn(async move { clone.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
            .await
            .expect("waiters did not observe cancellation within 5 seconds");
        for r in results {
            r.expect("waiter task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_runtime_processes_and_shuts_down() {
        let broker = InMemoryBroker::shared();
        let runtime = build_runtime(broker.clone());
        runtime.start().await.unwrap();
        assert!(runtime.start().await.is_err());

        let job = runtime.producer().enqueue(json!({ "n": 1 })).await.unwrap();
        timeout(Duration::from_secs(5), async {
            loop {
                let entry = runtime.ledger().get(&job.correlation_id).await.unwrap();
                if entry.is_some_and(|e| e.state == LedgerState::Completed) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job should complete");

        timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown should finish")
            .unwrap();
        assert!(!runtime.connection().is_connected().await);
    }

    #[tokio::test]
    async fn test_housekeeper_dead_letters_exhausted_stall() {
        let broker = InMemoryBroker::shared();
        let runtime = build_runtime(broker.clone());
        let connection = runtime.connection();
        let transport = connection.acquire().await.unwrap();

        let job = runtime.producer().enqueue(json!({})).await.unwrap();
        runtime
            .ledger()
            .observe(
                &job.correlation_id,
                Transition::Started {
                    job_id: job.id.clone(),
                    queue: "main-queue".into(),
                    retry_count: 0,
                    dlq_retry_count: 0,
                },
            )
            .await
            .unwrap();

        let housekeeper = Housekeeper {
            transport: Arc::clone(&transport),
            topology: connection.topology().clone(),
            ledger: runtime.ledger(),
            events: runtime.events(),
        };
        let mut rx = runtime.events().subscribe_jobs();

        // Default max_stalled is 1: the first stall requeues, the second rejects.
        for _ in 0..2 {
            broker.receive("main-queue", "ghost").await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            housekeeper.tick().await;
        }

        let dead = broker
            .list("dead-letter-queue", &[MessageState::Waiting], 0, 10)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].death.as_ref().unwrap().failure_reason, STALLED_REASON);

        let entry = runtime.ledger().get(&job.correlation_id).await.unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::DeadLettered);

        let mut stalled = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let JobEventPayload::Stalled { rejected, .. } = event.payload {
                stalled.push(rejected);
            }
        }
        assert_eq!(stalled, vec![false, true]);
    }
}
