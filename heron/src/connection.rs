use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::broker::{QueueSpec, Retention, Transport};
use crate::config::TopologyConfig;

/// Dials a transport backend.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport handle.
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>>;

    /// Human-readable endpoint for logs and errors.
    fn endpoint(&self) -> String;
}

/// Which of the two topology queues an operation targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Main,
    DeadLetter,
}

/// The main queue and its dead-letter queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub main_queue: String,
    pub dead_letter_queue: String,
    pub stall_timeout: Duration,
    pub max_stalled: u32,
    pub completed_retention: Retention,
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&TopologyConfig::default())
    }
}

impl Topology {
    pub fn from_config(config: &TopologyConfig) -> Self {
        Self {
            main_queue: config.main_queue.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            stall_timeout: Duration::from_millis(config.stall_timeout_ms),
            max_stalled: config.max_stalled,
            completed_retention: Retention {
                max_age: Some(Duration::from_secs(config.completed_max_age_secs)),
                max_count: Some(config.completed_max_count),
            },
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn queue_name(&self, kind: QueueKind) -> &str {
        match kind {
            QueueKind::Main => &self.main_queue,
            QueueKind::DeadLetter => &self.dead_letter_queue,
        }
    }

    /// Main queue: durable, rejected messages routed to the DLQ.
    pub fn main_spec(&self) -> QueueSpec {
        QueueSpec::durable(&self.main_queue)
            .with_dead_letter(&self.dead_letter_queue)
            .with_stall_timeout(self.stall_timeout, self.max_stalled)
            .with_completed_retention(self.completed_retention.clone())
    }

    /// Dead-letter queue: durable, keeps every entry.
    pub fn dead_letter_spec(&self) -> QueueSpec {
        QueueSpec::durable(&self.dead_letter_queue)
            .with_stall_timeout(self.stall_timeout, self.max_stalled)
    }

    /// Declare the DLQ first so the main queue's binding always resolves.
    pub async fn declare(&self, transport: &dyn Transport) -> anyhow::Result<()> {
        transport
            .declare_queue(&self.dead_letter_spec())
            .await
            .with_context(|| format!("failed to declare queue {}", self.dead_letter_queue))?;
        transport
            .declare_queue(&self.main_spec())
            .await
            .with_context(|| format!("failed to declare queue {}", self.main_queue))?;
        Ok(())
    }
}

/// Process-scoped, lazily established transport handle.
///
/// The first [`acquire`](Self::acquire) dials the connector and declares the
/// topology; later calls return the cached handle. Concurrent first callers
/// are serialized so only one connection is ever made.
pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    topology: Topology,
    handle: Mutex<Option<Arc<dyn Transport>>>,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connected = self
            .handle
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true);
        f.debug_struct("BrokerConnection")
            .field("endpoint", &self.connector.endpoint())
            .field("topology", &self.topology)
            .field("connected", &connected)
            .field("handle_type", &type_name::<dyn Transport>())
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(connector: Arc<dyn Connector>, topology: Topology) -> Self {
        Self {
            connector,
            topology,
            handle: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Return the live transport, connecting and declaring the topology on
    /// first use. Connection failures are returned to the caller.
    pub async fn acquire(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let endpoint = self.connector.endpoint();
        let transport = self
            .connector
            .connect()
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        self.topology.declare(transport.as_ref()).await?;

        tracing::info!(
            endpoint = %endpoint,
            main_queue = %self.topology.main_queue,
            dead_letter_queue = %self.topology.dead_letter_queue,
            "broker connection established"
        );

        *guard = Some(Arc::clone(&transport));
        Ok(transport)
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Close the cached handle. A later `acquire` connects again.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.close().await.context("failed to close broker connection")?;
            tracing::info!(endpoint = %self.connector.endpoint(), "broker connection closed");
        }
        Ok(())
    }
}
