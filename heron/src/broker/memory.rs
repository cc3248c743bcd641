use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    Broker, Delivery, DeliveryTag, FailureContext, MessageState, OutboundMessage, QueueCounts,
    QueueInspect, QueueSpec, StaleDelivery, StallReport, StallScanner, StoredMessage, Transport,
    STALLED_REASON,
};
use crate::connection::Connector;
use crate::job::JobId;

/// Process-local transport.
///
/// Holds every queue in memory behind a single lock, so each operation is
/// atomic with respect to all others. Used for tests, embedded deployments
/// and as the reference behaviour for other backends.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    deliveries: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
}

struct QueueState {
    spec: QueueSpec,
    next_seq: u64,
    slots: HashMap<JobId, Slot>,
}

struct Slot {
    seq: u64,
    message: StoredMessage,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        let sizes: HashMap<&str, usize> = state
            .queues
            .iter()
            .map(|(name, queue)| (name.as_str(), queue.slots.len()))
            .collect();
        f.debug_struct("InMemoryBroker")
            .field("queues", &sizes)
            .finish()
    }
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            next_seq: 0,
            slots: HashMap::new(),
        }
    }

    fn insert(&mut self, message: StoredMessage) -> anyhow::Result<()> {
        if self.slots.contains_key(&message.id) {
            bail!("job {} already exists in queue {}", message.id, self.spec.name);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(message.id.clone(), Slot { seq, message });
        Ok(())
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        for slot in self.slots.values_mut() {
            if slot.message.state == MessageState::Delayed && slot.message.available_at <= now {
                slot.message.state = MessageState::Waiting;
            }
        }
    }

    fn next_waiting(&self) -> Option<JobId> {
        self.slots
            .values()
            .filter(|slot| slot.message.state == MessageState::Waiting)
            .max_by(|a, b| {
                a.message
                    .priority
                    .cmp(&b.message.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|slot| slot.message.id.clone())
    }

    fn active_slot(&mut self, tag: &DeliveryTag) -> anyhow::Result<&mut Slot> {
        let current = self.slots.get(&tag.message_id).is_some_and(|slot| {
            slot.message.state == MessageState::Active
                && slot.message.consumer.as_deref() == Some(tag.consumer.as_str())
                && slot.message.delivery.as_deref() == Some(tag.delivery.as_str())
        });
        match self.slots.get_mut(&tag.message_id) {
            Some(slot) if current => Ok(slot),
            _ => Err(StaleDelivery(tag.clone()).into()),
        }
    }

    fn prune_completed(&mut self, now: DateTime<Utc>) {
        let retention = self.spec.completed_retention.clone();
        if let Some(max_age) = retention.max_age {
            let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or_default();
            self.slots.retain(|_, slot| {
                slot.message.state != MessageState::Completed
                    || slot.message.finished_at.map_or(true, |at| at >= cutoff)
            });
        }
        if let Some(max_count) = retention.max_count {
            let mut completed: Vec<(DateTime<Utc>, u64, JobId)> = self
                .slots
                .values()
                .filter(|slot| slot.message.state == MessageState::Completed)
                .map(|slot| {
                    (
                        slot.message.finished_at.unwrap_or(now),
                        slot.seq,
                        slot.message.id.clone(),
                    )
                })
                .collect();
            if completed.len() > max_count {
                completed.sort();
                let excess = completed.len() - max_count;
                for (_, _, id) in completed.into_iter().take(excess) {
                    self.slots.remove(&id);
                }
            }
        }
    }

    fn release(slot: &mut Slot) {
        slot.message.state = MessageState::Waiting;
        slot.message.consumer = None;
        slot.message.delivery = None;
    }
}

impl BrokerState {
    fn queue_mut(&mut self, name: &str) -> anyhow::Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| anyhow!("queue {name} has not been declared"))
    }

    /// Move a message out of `queue` along its dead-letter binding, or mark
    /// it failed in place when the queue has none.
    fn reject(
        &mut self,
        queue: &str,
        id: &JobId,
        failure: FailureContext,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let source = self.queue_mut(queue)?;
        let target = source
            .spec
            .dead_letter
            .clone()
            .filter(|target| target != queue);

        match target {
            Some(target) if self.queues.contains_key(&target) => {
                let source = self.queue_mut(queue)?;
                let slot = source
                    .slots
                    .remove(id)
                    .ok_or_else(|| anyhow!("job {id} vanished from queue {queue}"))?;
                let death = failure.into_death(id.clone(), queue, now);

                let dead_letters = self.queue_mut(&target)?;
                let mut dead_id = JobId::dead_letter(id, now);
                let mut attempt = 1;
                while dead_letters.slots.contains_key(&dead_id) {
                    dead_id = JobId(format!("{}-{attempt}", JobId::dead_letter(id, now)));
                    attempt += 1;
                }

                let mut message = slot.message;
                message.id = dead_id;
                message.queue = target.clone();
                message.state = MessageState::Waiting;
                message.enqueued_at = now;
                message.available_at = now;
                message.delivered_at = None;
                message.finished_at = None;
                message.deliveries = 0;
                message.stalled = 0;
                message.consumer = None;
                message.delivery = None;
                message.death = Some(death);
                dead_letters.insert(message)
            }
            other => {
                if let Some(target) = other {
                    tracing::warn!(
                        queue,
                        dead_letter = %target,
                        "dead-letter target not declared; failing message in place"
                    );
                }
                let source = self.queue_mut(queue)?;
                let slot = source
                    .slots
                    .get_mut(id)
                    .ok_or_else(|| anyhow!("job {id} vanished from queue {queue}"))?;
                slot.message.state = MessageState::Failed;
                slot.message.finished_at = Some(now);
                slot.message.consumer = None;
                slot.message.delivery = None;
                // The first death record explains why the job was dead-lettered.
                if slot.message.death.is_none() {
                    slot.message.death = Some(failure.into_death(id.clone(), queue, now));
                }
                Ok(())
            }
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for handing the broker to components expecting a transport.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn next_delivery(&self) -> String {
        self.deliveries.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn ordered(queue: &QueueState, states: &[MessageState]) -> Vec<StoredMessage> {
        let mut out = Vec::new();
        for state in states {
            let mut matching: Vec<&Slot> = queue
                .slots
                .values()
                .filter(|slot| slot.message.state == *state)
                .collect();
            matching.sort_by_key(|slot| slot.seq);
            out.extend(matching.into_iter().map(|slot| slot.message.clone()));
        }
        out
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        match state.queues.get_mut(&spec.name) {
            Some(existing) => {
                if existing.spec.dead_letter != spec.dead_letter
                    || existing.spec.durable != spec.durable
                {
                    bail!(
                        "queue {} already declared with different arguments",
                        spec.name
                    );
                }
                existing.spec = spec.clone();
            }
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), QueueState::new(spec.clone()));
            }
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> anyhow::Result<JobId> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        let id = message.id.clone().unwrap_or_default();
        target.insert(StoredMessage::from_outbound(id.clone(), queue, message, now))?;
        Ok(id)
    }

    async fn receive(&self, queue: &str, consumer: &str) -> anyhow::Result<Option<Delivery>> {
        let now = Utc::now();
        let delivery = self.next_delivery();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        target.promote_due(now);

        let Some(id) = target.next_waiting() else {
            return Ok(None);
        };
        let slot = target
            .slots
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job {id} vanished from queue {queue}"))?;

        slot.message.state = MessageState::Active;
        slot.message.delivered_at = Some(now);
        slot.message.deliveries += 1;
        slot.message.consumer = Some(consumer.to_string());
        slot.message.delivery = Some(delivery.clone());

        Ok(Some(Delivery {
            tag: DeliveryTag {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                message_id: id,
                delivery,
            },
            message: slot.message.clone(),
        }))
    }

    async fn ack(&self, tag: &DeliveryTag) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let queue = state.queue_mut(&tag.queue)?;
        let slot = queue.active_slot(tag)?;
        slot.message.state = MessageState::Completed;
        slot.message.finished_at = Some(now);
        slot.message.consumer = None;
        slot.message.delivery = None;
        queue.prune_completed(now);
        Ok(())
    }

    async fn nack(
        &self,
        tag: &DeliveryTag,
        requeue: bool,
        failure: Option<FailureContext>,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let queue = state.queue_mut(&tag.queue)?;
        let slot = queue.active_slot(tag)?;

        if requeue {
            QueueState::release(slot);
            return Ok(());
        }

        let failure = failure.unwrap_or_else(|| FailureContext::new("rejected"));
        state.reject(&tag.queue, &tag.message_id, failure, now)
    }

    async fn recover(&self, consumer: &str) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let mut recovered = 0;
        for queue in state.queues.values_mut() {
            for slot in queue.slots.values_mut() {
                if slot.message.state == MessageState::Active
                    && slot.message.consumer.as_deref() == Some(consumer)
                {
                    QueueState::release(slot);
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    async fn close(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let mut released = 0u64;
        for queue in state.queues.values_mut() {
            for slot in queue.slots.values_mut() {
                if slot.message.state == MessageState::Active {
                    QueueState::release(slot);
                    released += 1;
                }
            }
        }
        if released > 0 {
            tracing::info!(released, "returned unsettled deliveries on close");
        }
        Ok(())
    }
}

#[async_trait]
impl QueueInspect for InMemoryBroker {
    async fn list(
        &self,
        queue: &str,
        states: &[MessageState],
        start: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        target.promote_due(now);
        Ok(Self::ordered(target, states)
            .into_iter()
            .skip(start)
            .take(limit)
            .collect())
    }

    async fn get(&self, queue: &str, id: &JobId) -> anyhow::Result<Option<StoredMessage>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        target.promote_due(now);
        Ok(target.slots.get(id).map(|slot| slot.message.clone()))
    }

    async fn claim(
        &self,
        queue: &str,
        id: &JobId,
        consumer: &str,
    ) -> anyhow::Result<Option<Delivery>> {
        let now = Utc::now();
        let delivery = self.next_delivery();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        target.promote_due(now);
        let Some(slot) = target.slots.get_mut(id) else {
            return Ok(None);
        };
        if matches!(
            slot.message.state,
            MessageState::Active | MessageState::Completed
        ) {
            return Ok(None);
        }

        slot.message.state = MessageState::Active;
        slot.message.delivered_at = Some(now);
        slot.message.consumer = Some(consumer.to_string());
        slot.message.delivery = Some(delivery.clone());
        Ok(Some(Delivery {
            tag: DeliveryTag {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                message_id: id.clone(),
                delivery,
            },
            message: slot.message.clone(),
        }))
    }

    async fn remove(&self, queue: &str, id: &JobId) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        match target.slots.get(id) {
            None => Ok(false),
            Some(slot) if slot.message.state == MessageState::Active => {
                bail!("job {id} is held by an active delivery")
            }
            Some(_) => {
                target.slots.remove(id);
                Ok(true)
            }
        }
    }

    async fn archive(&self, queue: &str, id: &JobId) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        let Some(slot) = target.slots.get_mut(id) else {
            return Ok(false);
        };
        match slot.message.state {
            MessageState::Active => bail!("job {id} is held by an active delivery"),
            MessageState::Completed => Ok(false),
            _ => {
                slot.message.state = MessageState::Completed;
                slot.message.finished_at = Some(now);
                Ok(true)
            }
        }
    }

    async fn purge(&self, queue: &str, states: &[MessageState]) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        target.promote_due(now);
        let before = target.slots.len();
        target.slots.retain(|_, slot| {
            slot.message.state == MessageState::Active || !states.contains(&slot.message.state)
        });
        Ok((before - target.slots.len()) as u64)
    }

    async fn counts(&self, queue: &str) -> anyhow::Result<QueueCounts> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        target.promote_due(now);
        let mut counts = QueueCounts::default();
        for slot in target.slots.values() {
            counts.bump(slot.message.state);
        }
        Ok(counts)
    }
}

#[async_trait]
impl StallScanner for InMemoryBroker {
    async fn requeue_stalled(&self, queue: &str) -> anyhow::Result<StallReport> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let target = state.queue_mut(queue)?;
        let timeout = chrono::Duration::from_std(target.spec.stall_timeout).unwrap_or_default();
        let max_stalled = target.spec.max_stalled;

        let mut report = StallReport::default();
        let mut exhausted = Vec::new();
        for slot in target.slots.values_mut() {
            let overdue = slot.message.state == MessageState::Active
                && slot
                    .message
                    .delivered_at
                    .is_some_and(|at| at + timeout <= now);
            if !overdue {
                continue;
            }
            slot.message.stalled += 1;
            if slot.message.stalled > max_stalled {
                exhausted.push((slot.message.id.clone(), slot.message.deliveries));
            } else {
                QueueState::release(slot);
                report.requeued.push(slot.message.id.clone());
            }
        }

        for (id, deliveries) in exhausted {
            let failure = FailureContext::new(STALLED_REASON).with_attempts(deliveries, deliveries);
            state.reject(queue, &id, failure, now)?;
            report.rejected.push(id);
        }

        Ok(report)
    }
}

/// Connector that always hands out the same in-memory broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryConnector {
    broker: Arc<InMemoryBroker>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> Arc<InMemoryBroker> {
        Arc::clone(&self.broker)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        Ok(self.broker.clone() as Arc<dyn Transport>)
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Retention;
    use std::time::Duration;

    async fn broker_with_topology() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueSpec::durable("dlq"))
            .await
            .unwrap();
        broker
            .declare_queue(
                &QueueSpec::durable("main")
                    .with_dead_letter("dlq")
                    .with_stall_timeout(Duration::ZERO, 1),
            )
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        let err = broker
            .publish("nowhere", OutboundMessage::persistent("{}"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not been declared"));
    }

    #[tokio::test]
    async fn test_redeclare_with_different_binding_fails() {
        let broker = broker_with_topology().await;
        assert!(broker.declare_queue(&QueueSpec::durable("main")).await.is_err());
        assert!(broker
            .declare_queue(&QueueSpec::durable("main").with_dead_letter("dlq"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_receive_honours_priority_then_fifo() {
        let broker = broker_with_topology().await;
        let low = broker
            .publish("main", OutboundMessage::persistent("low"))
            .await
            .unwrap();
        let high = broker
            .publish("main", OutboundMessage::persistent("high").with_priority(Some(5)))
            .await
            .unwrap();
        let low2 = broker
            .publish("main", OutboundMessage::persistent("low2"))
            .await
            .unwrap();

        let order: Vec<JobId> = [
            broker.receive("main", "c").await.unwrap().unwrap(),
            broker.receive("main", "c").await.unwrap().unwrap(),
            broker.receive("main", "c").await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|d| d.message.id)
        .collect();

        assert_eq!(order, vec![high, low, low2]);
        assert!(broker.receive("main", "c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_message_not_delivered_early() {
        let broker = broker_with_topology().await;
        broker
            .publish(
                "main",
                OutboundMessage::persistent("later").with_delay(Duration::from_millis(40)),
            )
            .await
            .unwrap();

        assert!(broker.receive("main", "c").await.unwrap().is_none());
        assert_eq!(broker.counts("main").await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(broker.receive("main", "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ack_completes_and_stale_tag_is_rejected() {
        let broker = broker_with_topology().await;
        broker
            .publish("main", OutboundMessage::persistent("x"))
            .await
            .unwrap();
        let delivery = broker.receive("main", "c").await.unwrap().unwrap();

        broker.ack(&delivery.tag).await.unwrap();
        let err = broker.ack(&delivery.tag).await.unwrap_err();
        assert!(crate::broker::is_stale_delivery(&err));

        let counts = broker.counts("main").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_same_message() {
        let broker = broker_with_topology().await;
        let id = broker
            .publish("main", OutboundMessage::persistent("x"))
            .await
            .unwrap();
        let first = broker.receive("main", "c").await.unwrap().unwrap();
        broker.nack(&first.tag, true, None).await.unwrap();

        let second = broker.receive("main", "c").await.unwrap().unwrap();
        assert_eq!(second.message.id, id);
        assert!(second.redelivered());
        assert!(broker.ack(&first.tag).await.is_err());
    }

    #[tokio::test]
    async fn test_nack_without_requeue_routes_to_dead_letter() {
        let broker = broker_with_topology().await;
        let id = broker
            .publish("main", OutboundMessage::persistent("body").with_priority(Some(2)))
            .await
            .unwrap();
        let delivery = broker.receive("main", "c").await.unwrap().unwrap();

        broker
            .nack(
                &delivery.tag,
                false,
                Some(FailureContext::new("boom").with_attempts(3, 3)),
            )
            .await
            .unwrap();

        assert!(broker.get("main", &id).await.unwrap().is_none());
        let dead = broker
            .list("dlq", &[MessageState::Waiting], 0, 10)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        let death = dead[0].death.clone().unwrap();
        assert_eq!(death.original_job_id, id);
        assert_eq!(death.failure_reason, "boom");
        assert_eq!(death.attempts_made, 3);
        assert_eq!(death.source_queue, "main");
        assert_eq!(dead[0].body, "body");
        assert_eq!(dead[0].priority, 2);
        assert!(dead[0].id.as_str().starts_with(&format!("dlq-{id}-")));
    }

    #[tokio::test]
    async fn test_nack_on_queue_without_binding_fails_in_place() {
        let broker = broker_with_topology().await;
        let id = broker
            .publish("dlq", OutboundMessage::persistent("x"))
            .await
            .unwrap();
        let delivery = broker.receive("dlq", "c").await.unwrap().unwrap();
        broker.nack(&delivery.tag, false, None).await.unwrap();

        let stored = broker.get("dlq", &id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Failed);
        assert_eq!(stored.death.unwrap().failure_reason, "rejected");
    }

    #[tokio::test]
    async fn test_claim_takes_message_out_of_circulation() {
        let broker = broker_with_topology().await;
        let first = broker
            .publish("main", OutboundMessage::persistent("first"))
            .await
            .unwrap();
        let second = broker
            .publish("main", OutboundMessage::persistent("second"))
            .await
            .unwrap();

        let claimed = broker.claim("main", &second, "admin").await.unwrap().unwrap();
        assert_eq!(claimed.message.state, MessageState::Active);
        assert_eq!(claimed.message.deliveries, 0);
        assert!(broker.claim("main", &second, "admin").await.unwrap().is_none());
        assert!(broker.remove("main", &second).await.is_err());

        let next = broker.receive("main", "c").await.unwrap().unwrap();
        assert_eq!(next.message.id, first);
        assert!(broker.receive("main", "c").await.unwrap().is_none());

        broker.nack(&claimed.tag, true, None).await.unwrap();
        let released = broker.receive("main", "c").await.unwrap().unwrap();
        assert_eq!(released.message.id, second);
    }

    #[tokio::test]
    async fn test_claim_skips_missing_active_and_completed() {
        let broker = broker_with_topology().await;
        assert!(broker
            .claim("main", &JobId::from("missing"), "admin")
            .await
            .unwrap()
            .is_none());

        let id = broker
            .publish("main", OutboundMessage::persistent("x"))
            .await
            .unwrap();
        let delivery = broker.receive("main", "c").await.unwrap().unwrap();
        assert!(broker.claim("main", &id, "admin").await.unwrap().is_none());

        broker.ack(&delivery.tag).await.unwrap();
        assert!(broker.claim("main", &id, "admin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_of_failed_message_then_ack_completes_it() {
        let broker = broker_with_topology().await;
        let id = broker
            .publish("dlq", OutboundMessage::persistent("x"))
            .await
            .unwrap();
        let delivery = broker.receive("dlq", "c").await.unwrap().unwrap();
        broker.nack(&delivery.tag, false, None).await.unwrap();

        let claimed = broker.claim("dlq", &id, "admin").await.unwrap().unwrap();
        broker.ack(&claimed.tag).await.unwrap();
        let stored = broker.get("dlq", &id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Completed);
        assert!(broker.remove("dlq", &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_and_close_release_unsettled() {
        let broker = broker_with_topology().await;
        for _ in 0..2 {
            broker
                .publish("main", OutboundMessage::persistent("x"))
                .await
                .unwrap();
        }
        broker.receive("main", "a").await.unwrap().unwrap();
        broker.receive("main", "b").await.unwrap().unwrap();

        assert_eq!(broker.recover("a").await.unwrap(), 1);
        assert_eq!(broker.counts("main").await.unwrap().active, 1);

        broker.close().await.unwrap();
        let counts = broker.counts("main").await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.waiting, 2);
    }

    #[tokio::test]
    async fn test_stalled_delivery_requeued_then_rejected() {
        let broker = broker_with_topology().await;
        let id = broker
            .publish("main", OutboundMessage::persistent("x"))
            .await
            .unwrap();

        broker.receive("main", "c").await.unwrap().unwrap();
        let report = broker.requeue_stalled("main").await.unwrap();
        assert_eq!(report.requeued, vec![id.clone()]);

        broker.receive("main", "c").await.unwrap().unwrap();
        let report = broker.requeue_stalled("main").await.unwrap();
        assert_eq!(report.rejected, vec![id]);

        let dead = broker.list("dlq", &[MessageState::Waiting], 0, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].death.as_ref().unwrap().failure_reason, STALLED_REASON);
    }

    #[tokio::test]
    async fn test_completed_retention_by_count() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueSpec::durable("main").with_completed_retention(Retention {
                max_age: None,
                max_count: Some(2),
            }))
            .await
            .unwrap();

        for _ in 0..4 {
            broker
                .publish("main", OutboundMessage::persistent("x"))
                .await
                .unwrap();
            let delivery = broker.receive("main", "c").await.unwrap().unwrap();
            broker.ack(&delivery.tag).await.unwrap();
        }

        assert_eq!(broker.counts("main").await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_remove_and_purge_skip_active() {
        let broker = broker_with_topology().await;
        broker
            .publish("dlq", OutboundMessage::persistent("a"))
            .await
            .unwrap();
        let active = broker.receive("dlq", "c").await.unwrap().unwrap();
        let waiting = broker
            .publish("dlq", OutboundMessage::persistent("w"))
            .await
            .unwrap();
        assert!(broker.remove("dlq", &active.message.id).await.is_err());

        let removed = broker
            .purge("dlq", &[MessageState::Waiting, MessageState::Active])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!broker.remove("dlq", &waiting).await.unwrap());
        assert_eq!(broker.counts("dlq").await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_archive_settles_without_delivery() {
        let broker = broker_with_topology().await;
        let id = broker
            .publish("dlq", OutboundMessage::persistent("x"))
            .await
            .unwrap();

        assert!(broker.archive("dlq", &id).await.unwrap());
        assert!(!broker.archive("dlq", &id).await.unwrap());
        assert!(broker.receive("dlq", "c").await.unwrap().is_none());
        let stored = broker.get("dlq", &id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Completed);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_list_paginates_in_state_order() {
        let broker = broker_with_topology().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                broker
                    .publish("dlq", OutboundMessage::persistent("x"))
                    .await
                    .unwrap(),
            );
        }
        let delivery = broker.receive("dlq", "c").await.unwrap().unwrap();
        broker.nack(&delivery.tag, false, None).await.unwrap();

        let listed = broker
            .list("dlq", &[MessageState::Waiting, MessageState::Failed], 0, 10)
            .await
            .unwrap();
        let listed: Vec<JobId> = listed.into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);

        let page = broker
            .list("dlq", &[MessageState::Waiting, MessageState::Failed], 1, 1)
            .await
            .unwrap();
        assert_eq!(page[0].id, ids[2]);
    }
}
