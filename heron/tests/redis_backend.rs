//! Redis transport tests. Require a running server:
//!
//! ```sh
//! HERON_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test --features redis -- --ignored
//! ```

#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use heron::*;
use heron_testkit::{fast_config, wait_for, Script, ScriptedProcessor, TestTask};

fn redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("HERON_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        // Fresh namespace per test so runs never see each other's keys.
        key_prefix: format!("heron-test-{}", uuid::Uuid::new_v4()),
    }
}

fn connection(config: &HeronConfig) -> Arc<BrokerConnection> {
    Arc::new(BrokerConnection::new(
        Arc::new(RedisConnector::new(config.redis.clone())),
        Topology::from_config(&config.topology),
    ))
}

async fn wait_for_state(
    ledger: &Arc<InMemoryLedger>,
    correlation_id: &CorrelationId,
    state: LedgerState,
) -> LedgerEntry {
    wait_for(&format!("{correlation_id} to reach {state}"), || {
        let ledger = Arc::clone(ledger);
        let id = correlation_id.clone();
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

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn redis_publish_receive_ack() {
    let mut config = fast_config();
    config.redis = redis_config();
    let connection = connection(&config);
    let transport = connection.acquire().await.expect("connect to redis");
    let queue = config.topology.main_queue.clone();

    let low = transport
        .publish(&queue, OutboundMessage::persistent("low").with_priority(Some(1)))
        .await
        .unwrap();
    let high = transport
        .publish(&queue, OutboundMessage::persistent("high").with_priority(Some(9)))
        .await
        .unwrap();

    let first = transport.receive(&queue, "c1").await.unwrap().expect("delivery");
    assert_eq!(first.message.id, high);
    assert_eq!(first.message.state, MessageState::Active);
    transport.ack(&first.tag).await.unwrap();

    let second = transport.receive(&queue, "c1").await.unwrap().expect("delivery");
    assert_eq!(second.message.id, low);
    transport.nack(&second.tag, true, None).await.unwrap();

    let counts = transport.counts(&queue).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 1);

    let requeued = transport.receive(&queue, "c2").await.unwrap().expect("delivery");
    assert!(requeued.redelivered());
    transport.ack(&requeued.tag).await.unwrap();
    connection.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn redis_reject_routes_to_dead_letter_queue() {
    let mut config = fast_config();
    config.redis = redis_config();
    let connection = connection(&config);
    let transport = connection.acquire().await.expect("connect to redis");
    let main = config.topology.main_queue.clone();
    let dlq = config.topology.dead_letter_queue.clone();

    let id = transport
        .publish(&main, OutboundMessage::persistent("{}"))
        .await
        .unwrap();
    let delivery = transport.receive(&main, "c1").await.unwrap().expect("delivery");
    transport
        .nack(
            &delivery.tag,
            false,
            Some(FailureContext::new("boom").with_attempts(3, 3)),
        )
        .await
        .unwrap();

    let dead = transport.list(&dlq, &[MessageState::Waiting], 0, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    let death = dead[0].death.as_ref().expect("death record");
    assert_eq!(death.original_job_id, id);
    assert_eq!(death.failure_reason, "boom");
    assert_eq!(death.source_queue, main);

    assert_eq!(transport.purge(&dlq, &[MessageState::Waiting]).await.unwrap(), 1);
    assert_eq!(transport.counts(&dlq).await.unwrap().total(), 0);
    connection.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn redis_stalled_delivery_returns_to_queue() {
    let mut config = fast_config();
    config.redis = redis_config();
    config.topology.stall_timeout_ms = 50;
    let connection = connection(&config);
    let transport = connection.acquire().await.expect("connect to redis");
    let queue = config.topology.main_queue.clone();

    let id = transport
        .publish(&queue, OutboundMessage::persistent("{}"))
        .await
        .unwrap();
    transport.receive(&queue, "gone").await.unwrap().expect("delivery");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = transport.requeue_stalled(&queue).await.unwrap();
    assert_eq!(report.requeued, vec![id]);
    assert_eq!(transport.counts(&queue).await.unwrap().waiting, 1);
    connection.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn redis_runtime_compounds_attempts_then_drops() {
    let mut config = fast_config();
    config.redis = redis_config();
    let ledger = Arc::new(InMemoryLedger::new());
    let processor = ScriptedProcessor::new(Script::AlwaysFail);
    let runtime = HeronRuntimeBuilder::<TestTask>::new(config.clone())
        .with_connection(connection(&config))
        .with_ledger(ledger.clone())
        .with_processor(Arc::new(processor.clone()))
        .build()
        .unwrap();
    runtime.start().await.expect("start runtime");

    let job = runtime.producer().enqueue(TestTask::new("poison")).await.unwrap();
    let entry = wait_for_state(&ledger, &job.correlation_id, LedgerState::Failed).await;
    assert_eq!(entry.attempts, 9);
    processor.assert_attempt_count_eq(9);

    runtime.shutdown().await.expect("shutdown runtime");
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn redis_extreme_priorities_keep_order() {
    let mut config = fast_config();
    config.redis = redis_config();
    let connection = connection(&config);
    let transport = connection.acquire().await.expect("connect to redis");
    let queue = config.topology.main_queue.clone();

    let mut published = Vec::new();
    for priority in [i32::MIN, i32::MAX, i32::MAX, 0] {
        let id = transport
            .publish(&queue, OutboundMessage::persistent("{}").with_priority(Some(priority)))
            .await
            .unwrap();
        published.push(id);
    }

    let mut order = Vec::new();
    while let Some(delivery) = transport.receive(&queue, "c1").await.unwrap() {
        assert!(delivery.message.priority.abs() <= MAX_PRIORITY);
        order.push(delivery.message.id.clone());
        transport.ack(&delivery.tag).await.unwrap();
    }
    let expected = vec![
        published[1].clone(),
        published[2].clone(),
        published[3].clone(),
        published[0].clone(),
    ];
    assert_eq!(order, expected);
    connection.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn redis_claim_and_stale_settlement() {
    let mut config = fast_config();
    config.redis = redis_config();
    let connection = connection(&config);
    let transport = connection.acquire().await.expect("connect to redis");
    let queue = config.topology.main_queue.clone();

    let id = transport
        .publish(&queue, OutboundMessage::persistent("{}"))
        .await
        .unwrap();
    let claimed = transport
        .claim(&queue, &id, "admin")
        .await
        .unwrap()
        .expect("claim");
    assert!(transport.claim(&queue, &id, "admin").await.unwrap().is_none());
    assert!(transport.receive(&queue, "c1").await.unwrap().is_none());

    transport.nack(&claimed.tag, true, None).await.unwrap();
    let err = transport.ack(&claimed.tag).await.unwrap_err();
    assert!(is_stale_delivery(&err));

    let delivery = transport.receive(&queue, "c1").await.unwrap().expect("delivery");
    transport.ack(&delivery.tag).await.unwrap();
    assert!(transport.claim(&queue, &id, "admin").await.unwrap().is_none());
    connection.shutdown().await.unwrap();
}
