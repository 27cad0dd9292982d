use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use txmq_domain::broker::{AckOutcome, BrokerPublisher, DeliveryAck, InMemoryBroker};
use txmq_domain::coordinator::Coordinator;
use txmq_domain::engine::{EngineConfig, PublishEngine};
use txmq_domain::error::{DomainError, DomainResult};
use txmq_domain::message::{Destination, FailureReason, MessageId, MessageState};
use txmq_domain::recovery::{Alert, AlertSink, RecoveryConfig, RecoveryScanner};
use txmq_domain::registry::CoordinatorRegistry;
use txmq_domain::staging::{InMemoryStagingStore, StagingStore};

#[derive(Default)]
struct SpyAlerts {
    raised: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for SpyAlerts {
    async fn raise(&self, alert: &Alert) -> DomainResult<()> {
        self.raised.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct Harness {
    broker: Arc<InMemoryBroker>,
    orders: Arc<Coordinator>,
    payments: Arc<Coordinator>,
    orders_store: Arc<InMemoryStagingStore>,
    publisher: Arc<BrokerPublisher>,
    scanner: Arc<RecoveryScanner>,
    alerts: Arc<SpyAlerts>,
}

fn harness(config: RecoveryConfig) -> AnyResult<Harness> {
    let broker = Arc::new(InMemoryBroker::new());
    let orders_store = Arc::new(InMemoryStagingStore::new());
    let orders = Arc::new(Coordinator::new("orders", orders_store.clone()));
    let payments = Arc::new(Coordinator::new(
        "payments",
        Arc::new(InMemoryStagingStore::new()),
    ));
    let coordinators = Arc::new(CoordinatorRegistry::new([orders.clone(), payments.clone()])?);
    let publisher = Arc::new(
        BrokerPublisher::builder()
            .client(broker.clone())
            .coordinators(coordinators.clone())
            .build(),
    );
    let alerts = Arc::new(SpyAlerts::default());
    let scanner = Arc::new(
        RecoveryScanner::builder()
            .coordinators(coordinators)
            .publisher(publisher.clone())
            .alerts(alerts.clone())
            .config(config)
            .build(),
    );
    Ok(Harness {
        broker,
        orders,
        payments,
        orders_store,
        publisher,
        scanner,
        alerts,
    })
}

fn destination() -> Destination {
    Destination::new("orders", "order.paid")
}

#[tokio::test]
async fn ack_confirms_message() -> AnyResult<()> {
    let h = harness(RecoveryConfig::default())?;
    let id = MessageId::from("order-42#T1");

    h.orders.prepare(&id).await?;
    let ready = h
        .orders
        .mark_ready(&id, destination(), json!({"total": 100}))
        .await?;
    let token = h.publisher.publish(&ready, "orders").await?;

    let outcome = h.publisher.on_ack(DeliveryAck::ack(token)).await?;
    assert_eq!(outcome, AckOutcome::Confirmed { message_id: id.clone() });

    let stored = h.orders.get(&id).await?.expect("message present");
    assert_eq!(stored.state(), MessageState::Confirmed);
    assert_eq!(stored.payload(), Some(&json!({"total": 100})));
    assert!(stored.resolved_at().is_some());
    Ok(())
}

#[tokio::test]
async fn business_failure_discards_staged_message() -> AnyResult<()> {
    let h = harness(RecoveryConfig::default())?;
    let id = MessageId::from("order-43#T2");

    h.orders.prepare(&id).await?;
    h.orders.discard(&id).await?;
    h.orders.discard(&id).await?;

    assert!(h.orders_store.load(&id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn send_failure_withdraws_the_unsent_message() -> AnyResult<()> {
    let h = harness(RecoveryConfig {
        stale_after: Duration::from_millis(1),
        ..Default::default()
    })?;
    let id = MessageId::from("order-44#T3");

    h.orders.prepare(&id).await?;
    let ready = h.orders.mark_ready(&id, destination(), json!({})).await?;
    h.broker.fail_next_sends(1);

    let err = h.publisher.publish(&ready, "orders").await.unwrap_err();
    assert!(matches!(err, DomainError::Publish { .. }));
    assert!(h.publisher.correlations().tokens_for(&id).is_empty());

    // 业务调用已收到错误：撤回后补偿扫描不会再投递这条消息
    assert!(h.orders.withdraw(&id).await?);
    assert!(h.orders.get(&id).await?.is_none());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = h.scanner.scan_once().await;
    assert_eq!(report.republished, 0);
    assert!(h.broker.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn unacknowledged_message_is_retried_then_failed() -> AnyResult<()> {
    let h = harness(RecoveryConfig {
        stale_after: Duration::from_millis(1),
        max_retries: 3,
        retention: None,
        ..Default::default()
    })?;
    let id = MessageId::from("order-45#T4");

    h.orders.prepare(&id).await?;
    let ready = h.orders.mark_ready(&id, destination(), json!({})).await?;
    h.publisher.publish(&ready, "orders").await?;

    let mut last_ready_at = ready.ready_at();
    for attempt in 1..=3u32 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = h.scanner.scan_once().await;
        assert_eq!(report.republished, 1);

        let stored = h.orders.get(&id).await?.expect("message present");
        assert_eq!(stored.attempts(), attempt);
        assert!(stored.ready_at() > last_ready_at);
        last_ready_at = stored.ready_at();
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = h.scanner.scan_once().await;
    assert_eq!(report.escalated, 1);

    let stored = h.orders.get(&id).await?.expect("message present");
    assert_eq!(stored.state(), MessageState::Failed);
    assert_eq!(
        stored.failure(),
        Some(&FailureReason::MaxRetriesExceeded { attempts: 3 })
    );
    assert_eq!(h.broker.sent().len(), 4);
    assert!(h.publisher.correlations().is_empty());

    let alerts = h.alerts.raised.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].coordinator_id, "orders");
    assert_eq!(alerts[0].destination, Some(destination()));

    // 迟到的确认：令牌已释放，丢弃且不改变终态
    let late = h.broker.last_token().expect("token sent");
    assert_eq!(
        h.publisher.on_ack(DeliveryAck::ack(late)).await?,
        AckOutcome::Unmatched
    );
    let stored = h.orders.get(&id).await?.expect("message present");
    assert_eq!(stored.state(), MessageState::Failed);
    Ok(())
}

#[tokio::test]
async fn second_ack_after_republish_is_harmless() -> AnyResult<()> {
    let h = harness(RecoveryConfig {
        stale_after: Duration::from_millis(1),
        ..Default::default()
    })?;
    let id = MessageId::from("order-46#T5");

    h.orders.prepare(&id).await?;
    let ready = h.orders.mark_ready(&id, destination(), json!({})).await?;
    let first = h.publisher.publish(&ready, "orders").await?;

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.scanner.scan_once().await;
    let second = h.broker.last_token().expect("republished");
    assert_ne!(first, second);

    assert!(matches!(
        h.publisher.on_ack(DeliveryAck::ack(first)).await?,
        AckOutcome::Confirmed { .. }
    ));
    // 第二次发送的确认：消息已确认，confirm 为空操作
    assert!(matches!(
        h.publisher.on_ack(DeliveryAck::ack(second)).await?,
        AckOutcome::Confirmed { .. }
    ));

    let stored = h.orders.get(&id).await?.expect("message present");
    assert_eq!(stored.state(), MessageState::Confirmed);
    assert_eq!(stored.attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn coordinators_share_one_publisher() -> AnyResult<()> {
    let h = harness(RecoveryConfig::default())?;
    let order = MessageId::from("order-47#T6");
    let payment = MessageId::from("payment-9#T6");

    h.orders.prepare(&order).await?;
    h.payments.prepare(&payment).await?;
    let order_msg = h.orders.mark_ready(&order, destination(), json!({})).await?;
    let payment_msg = h
        .payments
        .mark_ready(&payment, Destination::new("payments", "payment.settled"), json!({}))
        .await?;

    let order_token = h.publisher.publish(&order_msg, "orders").await?;
    let payment_token = h.publisher.publish(&payment_msg, "payments").await?;

    h.publisher
        .on_ack(DeliveryAck::nack(payment_token, "no route"))
        .await?;
    h.publisher.on_ack(DeliveryAck::ack(order_token)).await?;

    assert_eq!(
        h.orders.get(&order).await?.map(|m| m.state()),
        Some(MessageState::Confirmed)
    );
    assert_eq!(
        h.payments.get(&payment).await?.map(|m| m.state()),
        Some(MessageState::Failed)
    );
    // 每个协调者只看得到自己的消息
    assert!(h.orders.get(&payment).await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mark_ready_has_exactly_one_winner() -> AnyResult<()> {
    let h = harness(RecoveryConfig::default())?;

    for round in 0..20 {
        let id = MessageId::from(format!("race-{round}#T7"));
        h.orders.prepare(&id).await?;

        let tasks: Vec<_> = (0..8)
            .map(|n| {
                let coordinator = h.orders.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    coordinator
                        .mark_ready(&id, destination(), json!({ "writer": n }))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            match task.await? {
                Ok(_) => winners += 1,
                Err(DomainError::InvalidState { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1, "round {round}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ack_racing_the_scanner_never_corrupts_state() -> AnyResult<()> {
    let h = harness(RecoveryConfig {
        stale_after: Duration::from_millis(1),
        max_retries: 1,
        retention: None,
        ..Default::default()
    })?;

    let mut ids = Vec::new();
    for n in 0..32 {
        let id = MessageId::from(format!("order-{n}#T8"));
        h.orders.prepare(&id).await?;
        let ready = h.orders.mark_ready(&id, destination(), json!({})).await?;
        h.publisher.publish(&ready, "orders").await?;
        ids.push(id);
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    let acks: Vec<_> = h
        .broker
        .sent()
        .into_iter()
        .map(|m| DeliveryAck::ack(m.token))
        .collect();
    let publisher = h.publisher.clone();
    let acking = tokio::spawn(async move {
        for ack in acks {
            // 升级为 FAILED 与释放令牌之间到达的确认会被拒绝
            match publisher.on_ack(ack).await {
                Ok(_) | Err(DomainError::InvalidState { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok::<_, DomainError>(())
    });
    let scanner = h.scanner.clone();
    let scanning = tokio::spawn(async move {
        for _ in 0..3 {
            scanner.scan_once().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
    acking.await??;
    scanning.await?;

    for id in &ids {
        let stored = h.orders.get(id).await?.expect("message present");
        match stored.state() {
            MessageState::Confirmed => assert!(stored.failure().is_none()),
            MessageState::Failed => assert!(matches!(
                stored.failure(),
                Some(FailureReason::MaxRetriesExceeded { .. })
            )),
            other => panic!("{id} left in {}", other.as_str()),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_drives_acks_through_the_channel() -> AnyResult<()> {
    let h = harness(RecoveryConfig {
        interval: Duration::from_secs(3600),
        ..Default::default()
    })?;
    let engine = Arc::new(
        PublishEngine::builder()
            .publisher(h.publisher.clone())
            .scanner(h.scanner.clone())
            .config(EngineConfig {
                ack_concurrency: 4,
                ack_buffer: 16,
            })
            .build(),
    );
    let handle = engine.start()?;

    let mut ids = Vec::new();
    for n in 0..10 {
        let id = MessageId::generate(&format!("order-{n}"))?;
        h.orders.prepare(&id).await?;
        let ready = h.orders.mark_ready(&id, destination(), json!({ "n": n })).await?;
        let token = h.publisher.publish(&ready, "orders").await?;
        if n % 2 == 0 {
            h.broker.ack(token).await?;
        } else {
            h.broker.nack(token, "rejected").await?;
        }
        ids.push(id);
    }

    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while !h.publisher.correlations().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    // 令牌取出后协调者的写入仍可能在进行，留出余量
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();
    handle.join().await?;

    for (n, id) in ids.iter().enumerate() {
        let stored = h.orders.get(id).await?.expect("message present");
        let expected = if n % 2 == 0 {
            MessageState::Confirmed
        } else {
            MessageState::Failed
        };
        assert_eq!(stored.state(), expected, "{id}");
    }
    Ok(())
}
