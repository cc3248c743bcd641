use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::HeronConfig;
use crate::connection::{BrokerConnection, Connector, Topology};
use crate::events::{InProcEventBus, JobEventPublisher};
use crate::job::Payload;
use crate::ledger::{InMemoryLedger, JobLedger};
use crate::worker::JobProcessor;

use super::supervisor::HeronRuntime;

/// Builder for constructing a `HeronRuntime` with explicit dependencies.
///
/// A connector (or a ready connection) and a processor are required. The
/// ledger defaults to [`InMemoryLedger`] and the event publisher to
/// [`InProcEventBus`]; every policy comes from the [`HeronConfig`].
///
/// # Example
///
/// ```ignore
/// use heron::*;
///
/// let runtime = HeronRuntimeBuilder::<MyTask>::new(HeronConfig::load(None)?)
///     .with_connector(Arc::new(MemoryConnector::default()))
///     .with_processor(Arc::new(processor_fn(|job: Job<MyTask>| async move { handle(job).await })))
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct HeronRuntimeBuilder<P: Payload> {
    config: HeronConfig,
    connector: Option<Arc<dyn Connector>>,
    connection: Option<Arc<BrokerConnection>>,
    ledger: Option<Arc<dyn JobLedger>>,
    events: Option<Arc<dyn JobEventPublisher>>,
    processor: Option<Arc<dyn JobProcessor<P>>>,
}

impl<P: Payload> fmt::Debug for HeronRuntimeBuilder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("HeronRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("connector_set", &self.connector.is_some());
        debug.field("connection_set", &self.connection.is_some());
        debug.field("ledger_set", &self.ledger.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("processor_set", &self.processor.is_some());
        debug.field("payload_type", &type_name::<P>());

        if let Some(connector) = &self.connector {
            debug.field("endpoint", &connector.endpoint());
        }

        debug.finish()
    }
}

impl<P: Payload> HeronRuntimeBuilder<P> {
    /// Create a new builder with the given configuration.
    pub fn new(config: HeronConfig) -> Self {
        Self {
            config,
            connector: None,
            connection: None,
            ledger: None,
            events: None,
            processor: None,
        }
    }

    /// Set the transport connector. The topology comes from the config.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Share an existing connection instead of dialing a new one.
    pub fn with_connection(mut self, connection: Arc<BrokerConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Set the job status ledger.
    pub fn with_ledger(mut self, ledger: Arc<dyn JobLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the processing function.
    pub fn with_processor(mut self, processor: Arc<dyn JobProcessor<P>>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Build the `HeronRuntime` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<HeronRuntime<P>> {
        let connection = match (self.connection, self.connector) {
            (Some(connection), _) => connection,
            (None, Some(connector)) => Arc::new(BrokerConnection::new(
                connector,
                Topology::from_config(&self.config.topology),
            )),
            (None, None) => anyhow::bail!("connector dependency missing"),
        };
        let processor = self
            .processor
            .ok_or_else(|| anyhow::anyhow!("processor dependency missing"))?;
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::new()));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::default()));

        let dead_letter_policy = self
            .config
            .dead_letter
            .enabled
            .then(|| self.config.dead_letter_policy());

        Ok(HeronRuntime::new(
            self.config.worker.clone(),
            connection,
            ledger,
            events,
            processor,
            self.config.retry_policy(),
            self.config.retry.strategy,
            dead_letter_policy,
        ))
    }
}
