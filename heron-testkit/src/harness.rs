use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use heron::*;
use tokio::time::{sleep, timeout};

use crate::{ScriptedProcessor, TestTask};

/// Upper bound for every `wait_*` helper.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration with millisecond timings so whole retry cycles finish
/// quickly: no backoff, 5ms polls, no rate limit.
pub fn fast_config() -> HeronConfig {
    let mut config = HeronConfig::default();
    config.retry.max_retries = 3;
    config.retry.backoff = Backoff::None;
    config.dead_letter.max_retries = 2;
    config.dead_letter.reinject_delay_ms = 0;
    config.worker = WorkerConfig::default()
        .with_concurrency(2)
        .with_poll_interval(Duration::from_millis(5))
        .with_rate_limit(None)
        .with_housekeeper_interval(Duration::from_millis(20));
    config.worker.shutdown_timeout_secs = 2;
    config
}

/// An in-memory deployment: broker, connection, ledger, event bus and a
/// scripted processor sharing one topology.
pub struct TestHarness {
    pub config: HeronConfig,
    pub broker: Arc<InMemoryBroker>,
    pub connector: Arc<crate::CountingConnector>,
    pub connection: Arc<BrokerConnection>,
    pub ledger: Arc<InMemoryLedger>,
    pub events: Arc<InProcEventBus>,
    pub processor: ScriptedProcessor,
}

impl TestHarness {
    pub fn new(processor: ScriptedProcessor) -> Self {
        Self::with_config(fast_config(), processor)
    }

    pub fn with_config(config: HeronConfig, processor: ScriptedProcessor) -> Self {
        let broker = InMemoryBroker::shared();
        let connector = Arc::new(crate::CountingConnector::new(Arc::clone(&broker)));
        let connection = Arc::new(BrokerConnection::new(
            connector.clone(),
            Topology::from_config(&config.topology),
        ));
        Self {
            config,
            broker,
            connector,
            connection,
            ledger: Arc::new(InMemoryLedger::new()),
            events: Arc::new(InProcEventBus::default()),
            processor,
        }
    }

    pub fn main_queue(&self) -> &str {
        &self.config.topology.main_queue
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.config.topology.dead_letter_queue
    }

    pub fn producer(&self) -> JobProducer {
        JobProducer::new(
            Arc::clone(&self.connection),
            self.ledger.clone(),
            self.events.clone(),
        )
    }

    pub fn inspector(&self) -> QueueInspector {
        QueueInspector::new(self.producer(), self.ledger.clone(), self.events.clone())
    }

    /// A runtime over the harness dependencies; not yet started.
    pub fn runtime(&self) -> anyhow::Result<HeronRuntime<TestTask>> {
        HeronRuntimeBuilder::new(self.config.clone())
            .with_connection(Arc::clone(&self.connection))
            .with_ledger(self.ledger.clone())
            .with_events(self.events.clone())
            .with_processor(Arc::new(self.processor.clone()))
            .build()
    }

    pub async fn started_runtime(&self) -> anyhow::Result<HeronRuntime<TestTask>> {
        let runtime = self.runtime()?;
        runtime.start().await?;
        Ok(runtime)
    }

    pub async fn counts(&self, kind: QueueKind) -> anyhow::Result<QueueCounts> {
        let queue = self.connection.topology().queue_name(kind).to_string();
        self.broker.counts(&queue).await
    }

    /// Wait until the ledger entry for `correlation_id` reaches `state`.
    pub async fn wait_for_state(
        &self,
        correlation_id: &CorrelationId,
        state: LedgerState,
    ) -> LedgerEntry {
        let ledger = self.ledger.clone();
        let id = correlation_id.clone();
        wait_for(&format!("{correlation_id} to reach {state}"), || {
            let ledger = ledger.clone();
            let id = id.clone();
            async move {
                ledger
                    .get(&id)
                    .await
                    .ok()
                    .flatten()
                    .filter(|entry| entry.state == state)
            }
        })
        .await
    }

    /// Wait until `queue` holds counts matching `predicate`.
    pub async fn wait_for_counts<F>(&self, kind: QueueKind, predicate: F) -> QueueCounts
    where
        F: Fn(&QueueCounts) -> bool,
    {
        let queue = self.connection.topology().queue_name(kind).to_string();
        let broker = Arc::clone(&self.broker);
        let predicate = &predicate;
        wait_for(&format!("counts on {queue}"), move || {
            let broker = Arc::clone(&broker);
            let queue = queue.clone();
            async move {
                broker
                    .counts(&queue)
                    .await
                    .ok()
                    .filter(|counts| predicate(counts))
            }
        })
        .await
    }

    /// Wait until the processor has seen at least `n` attempts.
    pub async fn wait_for_attempts(&self, n: usize) {
        let processor = self.processor.clone();
        wait_for(&format!("{n} attempts"), || {
            let processor = processor.clone();
            async move { (processor.attempt_count() >= n).then_some(()) }
        })
        .await
    }
}

/// Call `check` until it yields a value, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_for<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let polled = timeout(WAIT_TIMEOUT, async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    match polled {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
