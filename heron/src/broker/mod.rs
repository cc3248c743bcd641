//! Transport contract shared by every queue backend.
//!
//! A backend owns durable queues of [`StoredMessage`]s and implements three
//! traits: [`Broker`] for the delivery path (publish, receive, ack, nack),
//! [`QueueInspect`] for out-of-band administration, and [`StallScanner`] for
//! returning deliveries whose consumer went quiet. Anything implementing all
//! three is a [`Transport`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{InMemoryBroker, MemoryConnector};
#[cfg(feature = "redis")]
pub use self::redis::{RedisBroker, RedisConnector};

/// Reason attached to deliveries rejected by the stall scanner.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Largest priority magnitude a transport honours; anything beyond is clamped.
pub const MAX_PRIORITY: i32 = 1_000;

/// Clamp `priority` into `-MAX_PRIORITY..=MAX_PRIORITY`.
pub fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(-MAX_PRIORITY, MAX_PRIORITY)
}

/// Lifecycle state of a message inside one queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl MessageState {
    pub const ALL: [MessageState; 5] = [
        MessageState::Waiting,
        MessageState::Delayed,
        MessageState::Active,
        MessageState::Completed,
        MessageState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Waiting => "waiting",
            MessageState::Delayed => "delayed",
            MessageState::Active => "active",
            MessageState::Completed => "completed",
            MessageState::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(MessageState::Waiting),
            "delayed" => Ok(MessageState::Delayed),
            "active" => Ok(MessageState::Active),
            "completed" => Ok(MessageState::Completed),
            "failed" => Ok(MessageState::Failed),
            other => anyhow::bail!("unknown message state: {other}"),
        }
    }
}

/// Pruning rule for completed entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Retention {
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
}

impl Retention {
    /// Never prune.
    pub fn keep_all() -> Self {
        Self::default()
    }
}

/// Declaration of a durable queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Queue receiving messages rejected without requeue.
    pub dead_letter: Option<String>,
    pub stall_timeout: Duration,
    pub max_stalled: u32,
    pub completed_retention: Retention,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
            stall_timeout: Duration::from_secs(30),
            max_stalled: 1,
            completed_retention: Retention::keep_all(),
        }
    }

    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter = Some(queue.into());
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration, max_stalled: u32) -> Self {
        self.stall_timeout = timeout;
        self.max_stalled = max_stalled;
        self
    }

    pub fn with_completed_retention(mut self, retention: Retention) -> Self {
        self.completed_retention = retention;
        self
    }
}

/// Why a message ended up in a dead-letter queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeathRecord {
    pub original_job_id: JobId,
    pub source_queue: String,
    pub failed_at: DateTime<Utc>,
    pub failure_reason: String,
    pub failure_stack: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
}

/// Failure details handed to [`Broker::nack`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailureContext {
    pub reason: String,
    pub stack: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl FailureContext {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_attempts(mut self, attempts_made: u32, max_attempts: u32) -> Self {
        self.attempts_made = attempts_made;
        self.max_attempts = max_attempts;
        self
    }

    pub(crate) fn into_death(
        self,
        original_job_id: JobId,
        source_queue: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> DeathRecord {
        DeathRecord {
            original_job_id,
            source_queue: source_queue.into(),
            failed_at,
            failure_reason: self.reason,
            failure_stack: self.stack,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
        }
    }
}

/// A message about to be published.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Explicit id; the transport assigns one when `None`.
    pub id: Option<JobId>,
    pub body: String,
    pub priority: i32,
    pub delay: Duration,
    pub persistent: bool,
    pub death: Option<DeathRecord>,
}

impl OutboundMessage {
    pub fn persistent(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            persistent: true,
            ..Default::default()
        }
    }

    /// Priorities outside [`MAX_PRIORITY`] are clamped.
    pub fn with_priority(mut self, priority: Option<i32>) -> Self {
        self.priority = clamp_priority(priority.unwrap_or_default());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_death(mut self, death: DeathRecord) -> Self {
        self.death = Some(death);
        self
    }
}

/// Identifies one specific delivery of a message to a consumer.
///
/// A tag goes stale once the delivery is settled or the message is
/// redelivered; acknowledging a stale tag fails.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag {
    pub queue: String,
    pub consumer: String,
    pub message_id: JobId,
    pub delivery: String,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.queue, self.consumer, self.message_id, self.delivery
        )
    }
}

/// Settling a delivery whose tag is no longer current: the message was
/// settled already, or the stall scanner handed it to another consumer.
#[derive(Debug, thiserror::Error)]
#[error("unknown delivery tag {0}")]
pub struct StaleDelivery(pub DeliveryTag);

/// Whether `err` was caused by settling a stale [`DeliveryTag`].
pub fn is_stale_delivery(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<StaleDelivery>())
}

/// A message as held by a queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: JobId,
    pub queue: String,
    pub body: String,
    pub priority: i32,
    pub state: MessageState,
    pub persistent: bool,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of times the message was handed to a consumer.
    pub deliveries: u32,
    pub stalled: u32,
    pub consumer: Option<String>,
    pub delivery: Option<String>,
    pub death: Option<DeathRecord>,
}

impl StoredMessage {
    pub(crate) fn from_outbound(
        id: JobId,
        queue: &str,
        message: OutboundMessage,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = chrono::Duration::from_std(message.delay).unwrap_or_default();
        let state = if delay > chrono::Duration::zero() {
            MessageState::Delayed
        } else {
            MessageState::Waiting
        };

        Self {
            id,
            queue: queue.to_string(),
            body: message.body,
            priority: message.priority,
            state,
            persistent: message.persistent,
            enqueued_at: now,
            available_at: now + delay,
            delivered_at: None,
            finished_at: None,
            deliveries: 0,
            stalled: 0,
            consumer: None,
            delivery: None,
            death: message.death,
        }
    }
}

/// A message handed to a consumer, awaiting settlement.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: StoredMessage,
}

impl Delivery {
    /// True when the message was delivered before and never settled.
    pub fn redelivered(&self) -> bool {
        self.message.deliveries > 1
    }
}

/// Per-state message counts for one queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }

    pub fn get(&self, state: MessageState) -> u64 {
        match state {
            MessageState::Waiting => self.waiting,
            MessageState::Delayed => self.delayed,
            MessageState::Active => self.active,
            MessageState::Completed => self.completed,
            MessageState::Failed => self.failed,
        }
    }

    pub(crate) fn bump(&mut self, state: MessageState) {
        match state {
            MessageState::Waiting => self.waiting += 1,
            MessageState::Delayed => self.delayed += 1,
            MessageState::Active => self.active += 1,
            MessageState::Completed => self.completed += 1,
            MessageState::Failed => self.failed += 1,
        }
    }
}

/// Result of one stall scan over a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StallReport {
    /// Deliveries returned to the queue.
    pub requeued: Vec<JobId>,
    /// Deliveries that stalled too often and were rejected.
    pub rejected: Vec<JobId>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.rejected.is_empty()
    }
}

/// Delivery path of a transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue. Redeclaring with identical settings is a no-op.
    async fn declare_queue(&self, spec: &QueueSpec) -> anyhow::Result<()>;

    /// Publish a message; resolves once the transport has accepted it.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> anyhow::Result<JobId>;

    /// Take the next available message, if any, without blocking.
    async fn receive(&self, queue: &str, consumer: &str) -> anyhow::Result<Option<Delivery>>;

    /// Settle a delivery as processed. Fails with [`StaleDelivery`] when the
    /// tag is no longer current.
    async fn ack(&self, tag: &DeliveryTag) -> anyhow::Result<()>;

    /// Settle a delivery as rejected. Without `requeue` the message follows
    /// the queue's dead-letter binding, carrying `failure` as its death record.
    async fn nack(
        &self,
        tag: &DeliveryTag,
        requeue: bool,
        failure: Option<FailureContext>,
    ) -> anyhow::Result<()>;

    /// Return every unsettled delivery held by `consumer` to its queue.
    async fn recover(&self, consumer: &str) -> anyhow::Result<u64>;

    /// Close the handle; unsettled deliveries are returned to their queues.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Administrative view over queues.
#[async_trait]
pub trait QueueInspect: Send + Sync {
    /// Messages in any of `states`, grouped in the order the states are
    /// given and in enqueue order within a state.
    async fn list(
        &self,
        queue: &str,
        states: &[MessageState],
        start: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredMessage>>;

    async fn get(&self, queue: &str, id: &JobId) -> anyhow::Result<Option<StoredMessage>>;

    /// Atomically take a waiting, delayed or failed message out of
    /// circulation as an active delivery held by `consumer`, regardless of
    /// its position in the queue. Returns `None` when the message is absent,
    /// already active, or completed. Settle the claim with [`Broker::ack`]
    /// or release it with [`Broker::nack`]. A claimed failed message keeps
    /// its `finished_at`.
    async fn claim(
        &self,
        queue: &str,
        id: &JobId,
        consumer: &str,
    ) -> anyhow::Result<Option<Delivery>>;

    /// Remove a settled or waiting message. Active messages cannot be removed.
    async fn remove(&self, queue: &str, id: &JobId) -> anyhow::Result<bool>;

    /// Mark a waiting, delayed or failed message completed without delivering
    /// it. Returns false when the message is absent or already completed.
    async fn archive(&self, queue: &str, id: &JobId) -> anyhow::Result<bool>;

    /// Remove every message in `states` atomically; active messages are never purged.
    async fn purge(&self, queue: &str, states: &[MessageState]) -> anyhow::Result<u64>;

    async fn counts(&self, queue: &str) -> anyhow::Result<QueueCounts>;
}

/// Detection of deliveries held past their queue's stall timeout.
#[async_trait]
pub trait StallScanner: Send + Sync {
    async fn requeue_stalled(&self, queue: &str) -> anyhow::Result<StallReport>;
}

/// A complete queue backend.
pub trait Transport: Broker + QueueInspect + StallScanner {}

impl<T> Transport for T where T: Broker + QueueInspect + StallScanner + ?Sized {}
