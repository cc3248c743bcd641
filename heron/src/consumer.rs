//! Prefetch-bounded consumption of a single queue.
//!
//! A [`Consumer`] hands out at most `prefetch` unsettled deliveries at a
//! time. Each [`InboundJob`] holds one prefetch permit until it is acked,
//! nacked or dropped, so concurrency is bounded by the transport contract
//! rather than by how many tasks happen to poll.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::Stream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::broker::{Delivery, DeliveryTag, FailureContext, StoredMessage, Transport};
use crate::job::{Envelope, JobId, Payload};
use crate::rate_limit::TokenBucket;
use crate::runtime::ShutdownToken;

pub struct Consumer {
    transport: Arc<dyn Transport>,
    queue: String,
    tag: String,
    prefetch: usize,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
    limiter: Option<TokenBucket>,
    shutdown: ShutdownToken,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .field("prefetch", &self.prefetch)
            .field("in_flight", &self.in_flight())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl Consumer {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: impl Into<String>,
        tag: impl Into<String>,
        prefetch: usize,
        shutdown: ShutdownToken,
    ) -> Self {
        let prefetch = prefetch.max(1);
        Self {
            transport,
            queue: queue.into(),
            tag: tag.into(),
            prefetch,
            permits: Arc::new(Semaphore::new(prefetch)),
            poll_interval: Duration::from_millis(50),
            limiter: None,
            shutdown,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_rate_limit(mut self, limiter: Option<TokenBucket>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.prefetch - self.permits.available_permits()
    }

    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` once shutdown has been signalled. Deliveries
    /// already handed out are unaffected and must still be settled.
    pub async fn next(&self) -> anyhow::Result<Option<InboundJob>> {
        let permit = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.context("consumer semaphore closed")?
            }
        };

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(None),
                    _ = limiter.acquire() => {}
                }
            }

            match self.transport.receive(&self.queue, &self.tag).await {
                Ok(Some(delivery)) => {
                    return Ok(Some(InboundJob {
                        delivery,
                        transport: Arc::clone(&self.transport),
                        _permit: permit,
                    }));
                }
                Ok(None) => {
                    if let Some(limiter) = &self.limiter {
                        limiter.refund().await;
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(err) => {
                    if let Some(limiter) = &self.limiter {
                        limiter.refund().await;
                    }
                    return Err(err.context(format!("receive from {} failed", self.queue)));
                }
            }
        }
    }

    /// Deliveries as a stream that ends on shutdown.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = anyhow::Result<InboundJob>> {
        futures::stream::unfold(self, |consumer| async move {
            match consumer.next().await {
                Ok(Some(job)) => Some((Ok(job), consumer)),
                Ok(None) => None,
                Err(err) => Some((Err(err), consumer)),
            }
        })
    }
}

/// An unsettled delivery.
///
/// Settling consumes the value. Dropping it unsettled releases the
/// prefetch slot but leaves the message active on the transport until
/// stall detection, `recover` or `close` returns it to its queue.
pub struct InboundJob {
    delivery: Delivery,
    transport: Arc<dyn Transport>,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for InboundJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundJob")
            .field("tag", &self.delivery.tag)
            .field("state", &self.delivery.message.state)
            .finish()
    }
}

impl InboundJob {
    pub fn id(&self) -> &JobId {
        &self.delivery.message.id
    }

    pub fn queue(&self) -> &str {
        &self.delivery.tag.queue
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.delivery.tag
    }

    pub fn message(&self) -> &StoredMessage {
        &self.delivery.message
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered()
    }

    pub fn decode<P: Payload>(&self) -> anyhow::Result<Envelope<P>> {
        Envelope::decode(&self.delivery.message.body)
            .with_context(|| format!("malformed envelope in job {}", self.id()))
    }

    pub async fn ack(self) -> anyhow::Result<()> {
        self.transport.ack(&self.delivery.tag).await
    }

    pub async fn nack(self, requeue: bool, failure: Option<FailureContext>) -> anyhow::Result<()> {
        self.transport
            .nack(&self.delivery.tag, requeue, failure)
            .await
    }
}

/// Pull deliveries from `consumer` and hand each to `handle` until shutdown.
///
/// Receive errors are logged and retried after a pause. A handler error
/// means settlement or bookkeeping failed for one delivery; it is logged and
/// the slot keeps consuming. A delivery left unsettled is returned to its
/// queue by the stall scanner.
pub(crate) async fn drive<F, Fut, T>(
    consumer: Arc<Consumer>,
    slot: String,
    handle: F,
) -> anyhow::Result<()>
where
    F: Fn(InboundJob) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    tracing::debug!(slot = %slot, queue = %consumer.queue(), "worker slot started");
    loop {
        let inbound = match consumer.next().await {
            Ok(Some(inbound)) => inbound,
            Ok(None) => {
                tracing::info!(slot = %slot, "worker slot shutting down");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(slot = %slot, "receive error: {err:#}");
                tokio::time::sleep(consumer.poll_interval.max(Duration::from_millis(100))).await;
                continue;
            }
        };

        if let Err(err) = handle(inbound).await {
            tracing::error!(slot = %slot, "failed to settle delivery: {err:#}");
            tokio::time::sleep(consumer.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker, MessageState, OutboundMessage, QueueInspect, QueueSpec};
    use futures::StreamExt;
    use tokio::time::timeout;

    async fn transport() -> Arc<InMemoryBroker> {
        let broker = InMemoryBroker::shared();
        broker.declare_queue(&QueueSpec::durable("q")).await.unwrap();
        broker
    }

    async fn publish(broker: &InMemoryBroker, body: &str) -> JobId {
        broker
            .publish("q", OutboundMessage::persistent(body))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unsettled_deliveries() {
        let broker = transport().await;
        for i in 0..3 {
            publish(&broker, &i.to_string()).await;
        }
        let consumer = Consumer::new(broker.clone(), "q", "c", 2, ShutdownToken::new())
            .with_poll_interval(Duration::from_millis(5));

        let first = consumer.next().await.unwrap().unwrap();
        let _second = consumer.next().await.unwrap().unwrap();
        assert_eq!(consumer.in_flight(), 2);

        // A third pull must wait for a settlement.
        assert!(timeout(Duration::from_millis(50), consumer.next()).await.is_err());

        first.ack().await.unwrap();
        let third = timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(third.message().body, "2");
    }

    #[tokio::test]
    async fn test_next_returns_none_on_shutdown() {
        let broker = transport().await;
        let shutdown = ShutdownToken::new();
        let consumer = Consumer::new(broker, "q", "c", 1, shutdown.clone())
            .with_poll_interval(Duration::from_millis(5));

        let pending = tokio::spawn(async move { consumer.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nack_settles_and_decode_reports_malformed() {
        let broker = transport().await;
        let id = publish(&broker, "not json").await;
        let consumer = Consumer::new(broker.clone(), "q", "c", 1, ShutdownToken::new());

        let inbound = consumer.next().await.unwrap().unwrap();
        assert_eq!(inbound.id(), &id);
        assert!(!inbound.redelivered());
        assert!(inbound.decode::<serde_json::Value>().is_err());
        inbound
            .nack(false, Some(FailureContext::new("malformed")))
            .await
            .unwrap();

        let stored = broker.get("q", &id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Failed);
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_refunds_empty_polls() {
        let broker = transport().await;
        let limiter = TokenBucket::new(1, 0.001);
        let consumer = Consumer::new(broker.clone(), "q", "c", 1, ShutdownToken::new())
            .with_poll_interval(Duration::from_millis(5))
            .with_rate_limit(Some(limiter.clone()));

        // Empty polls must not drain the bucket.
        assert!(timeout(Duration::from_millis(30), consumer.next()).await.is_err());

        publish(&broker, "x").await;
        let inbound = timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        inbound.ack().await.unwrap();
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_stream_ends_on_shutdown() {
        let broker = transport().await;
        publish(&broker, "a").await;
        publish(&broker, "b").await;
        let shutdown = ShutdownToken::new();
        let consumer = Arc::new(
            Consumer::new(broker, "q", "c", 4, shutdown.clone())
                .with_poll_interval(Duration::from_millis(5)),
        );

        let mut stream = Box::pin(consumer.into_stream());
        let mut bodies = Vec::new();
        for _ in 0..2 {
            let job = stream.next().await.unwrap().unwrap();
            bodies.push(job.message().body.clone());
            job.ack().await.unwrap();
        }
        assert_eq!(bodies, vec!["a", "b"]);

        shutdown.cancel();
        assert!(timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_drive_survives_handler_errors() {
        let broker = transport().await;
        for body in ["a", "b", "c"] {
            publish(&broker, body).await;
        }
        let shutdown = ShutdownToken::new();
        let consumer = Arc::new(
            Consumer::new(broker.clone(), "q", "c", 1, shutdown.clone())
                .with_poll_interval(Duration::from_millis(5)),
        );

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let driven = tokio::spawn(drive(consumer, "slot-0".to_string(), {
            let seen = Arc::clone(&seen);
            move |inbound: InboundJob| {
                let seen = Arc::clone(&seen);
                async move {
                    let body = inbound.message().body.clone();
                    inbound.ack().await?;
                    seen.lock().push(body.clone());
                    if body == "a" {
                        anyhow::bail!("bookkeeping failed for {body}");
                    }
                    Ok(())
                }
            }
        }));

        timeout(Duration::from_secs(2), async {
            while seen.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
        timeout(Duration::from_secs(1), driven)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
        assert_eq!(broker.counts("q").await.unwrap().completed, 3);
    }
}
