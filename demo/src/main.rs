use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use txmq_application::{TransactionError, TransactionSpec, TransactionalPublisher};
use txmq_domain::broker::{BrokerPublisher, InMemoryBroker};
use txmq_domain::coordinator::Coordinator;
use txmq_domain::engine::{EngineConfig, PublishEngine};
use txmq_domain::error::DomainError;
use txmq_domain::recovery::{LogAlertSink, RecoveryConfig, RecoveryScanner};
use txmq_domain::registry::CoordinatorRegistry;
use txmq_domain::staging::InMemoryStagingStore;

#[derive(Debug, thiserror::Error)]
enum OrderError {
    #[error("order total must be positive, got {0}")]
    InvalidTotal(i64),
}

#[derive(Debug, Serialize)]
struct OrderPaid {
    order_id: String,
    total: i64,
}

async fn pay_order(order_id: &str, total: i64) -> Result<OrderPaid, OrderError> {
    if total <= 0 {
        return Err(OrderError::InvalidTotal(total));
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    Ok(OrderPaid {
        order_id: order_id.to_string(),
        total,
    })
}

fn env_u64(key: &str) -> anyhow::Result<Option<u64>> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.parse().with_context(|| format!("invalid {key}: {raw}")))
        .transpose()
}

fn recovery_config() -> anyhow::Result<RecoveryConfig> {
    let mut config = RecoveryConfig {
        interval: Duration::from_millis(200),
        stale_after: Duration::from_millis(100),
        max_retries: 3,
        ..Default::default()
    };
    if let Some(ms) = env_u64("TXMQ_SCAN_INTERVAL_MS")? {
        config.interval = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("TXMQ_STALE_AFTER_MS")? {
        config.stale_after = Duration::from_millis(ms);
    }
    if let Some(n) = env_u64("TXMQ_MAX_RETRIES")? {
        config.max_retries = u32::try_from(n).context("TXMQ_MAX_RETRIES out of range")?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let broker = Arc::new(InMemoryBroker::new().with_auto_ack());
    let orders = Arc::new(Coordinator::new(
        "orders",
        Arc::new(InMemoryStagingStore::new()),
    ));
    let coordinators = Arc::new(CoordinatorRegistry::new([orders.clone()])?);
    let publisher = Arc::new(
        BrokerPublisher::builder()
            .client(broker.clone())
            .coordinators(coordinators.clone())
            .build(),
    );
    let scanner = Arc::new(
        RecoveryScanner::builder()
            .coordinators(coordinators.clone())
            .publisher(publisher.clone())
            .alerts(Arc::new(LogAlertSink))
            .config(recovery_config()?)
            .build(),
    );
    let engine = Arc::new(
        PublishEngine::builder()
            .publisher(publisher.clone())
            .scanner(scanner)
            .config(EngineConfig::default())
            .build(),
    );
    let handle = engine.start()?;

    let interceptor = TransactionalPublisher::builder()
        .coordinators(coordinators)
        .publisher(publisher)
        .build();

    let mut staged = Vec::new();
    for (order_id, total) in [("order-1", 100), ("order-2", -5), ("order-3", 42)] {
        // order-3 的发送失败：消息被撤回，由调用方决定是否重新发起
        if order_id == "order-3" {
            broker.fail_next_sends(1);
        }

        let spec = TransactionSpec::builder()
            .coordinator("orders")
            .exchange("orders")
            .route_key("order.paid")
            .biz_id(order_id)
            .build();

        match interceptor.execute(&spec, || pay_order(order_id, total)).await {
            Ok(receipt) => {
                info!(id = %receipt.message_id, total = receipt.output.total, "order paid");
                staged.push(receipt.message_id);
            }
            Err(TransactionError::Business(err)) => {
                warn!(order_id, error = %err, "order rejected");
            }
            Err(TransactionError::Protocol(DomainError::Publish { id, reason })) => {
                warn!(id = %id, reason = %reason, "order paid but message not sent");
            }
            Err(err) => return Err(err.into()),
        }
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    for id in &staged {
        let state = orders.get(id).await?.map(|m| m.state());
        info!(id = %id, state = state.map(|s| s.as_str()), "final state");
    }
    info!(sent = broker.sent().len(), "broker deliveries");

    handle.shutdown();
    handle.join().await?;
    Ok(())
}
