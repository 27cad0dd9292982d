//! 补偿扫描器（RecoveryScanner）
//!
//! 所有改写都经由协调者的流转接口完成，与确认回调并发运行时同样受
//! 版本号条件写入保护：对方先行一步时，扫描器的流转以 `InvalidState` 失败并跳过该消息。
//!
use super::{Alert, AlertSink};
use crate::broker::BrokerPublisher;
use crate::coordinator::{Coordinator, cutoff};
use crate::error::{DomainError, DomainResult as Result};
use crate::message::{FailureReason, MessageState, StagedMessage};
use crate::registry::CoordinatorRegistry;
use bon::Builder;
use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt, future};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 补偿扫描配置
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// 扫描间隔
    pub interval: Duration,
    /// READY 超过该时长未确认即视为滞留；同时作为 FAILED 重新提升前的等待时长
    pub stale_after: Duration,
    /// 最大重投次数
    pub max_retries: u32,
    /// 关联登记的存活时长
    pub correlation_ttl: Duration,
    /// 终态消息保留期；None 表示不清理
    pub retention: Option<Duration>,
    /// 是否重新提升可重试的 FAILED 消息
    pub requeue_failed: bool,
}

impl RecoveryConfig {
    /// 扫描间隔必须为正；其余时长为零表示"立即视为过期"
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(DomainError::invalid_value("recovery interval must be positive"));
        }
        Ok(())
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            max_retries: 5,
            correlation_ttl: Duration::from_secs(600),
            retention: Some(Duration::from_secs(7 * 24 * 3600)),
            requeue_failed: true,
        }
    }
}

/// 单轮扫描结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub republished: usize,
    pub requeued: usize,
    pub escalated: usize,
    pub expired_correlations: usize,
    pub purged: usize,
    pub errors: usize,
}

impl ScanReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Builder)]
pub struct RecoveryScanner {
    coordinators: Arc<CoordinatorRegistry>,
    publisher: Arc<BrokerPublisher>,
    alerts: Arc<dyn AlertSink>,
    #[builder(default)]
    config: RecoveryConfig,
}

impl RecoveryScanner {
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// 执行一轮完整扫描
    pub async fn scan_once(&self) -> ScanReport {
        let mut report = ScanReport::default();

        for coordinator in self.coordinators.iter() {
            self.recover_stale(coordinator, &mut report).await;

            if self.config.requeue_failed {
                self.requeue_failed(coordinator, &mut report).await;
            }

            if let Some(retention) = self.config.retention {
                match coordinator.purge_resolved(retention).await {
                    Ok(n) => report.purged += n,
                    Err(err) => {
                        report.errors += 1;
                        warn!(coordinator = coordinator.id(), error = %err, "purge failed");
                    }
                }
            }
        }

        report.expired_correlations = self.expire_correlations();

        if !report.is_idle() {
            info!(
                republished = report.republished,
                requeued = report.requeued,
                escalated = report.escalated,
                expired_correlations = report.expired_correlations,
                purged = report.purged,
                errors = report.errors,
                "recovery scan finished"
            );
        }
        report
    }

    async fn recover_stale(&self, coordinator: &Arc<Coordinator>, report: &mut ScanReport) {
        let mut stale = coordinator.list_stale(self.config.stale_after);

        while let Some(next) = stale.next().await {
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    report.errors += 1;
                    warn!(coordinator = coordinator.id(), error = %err, "stale scan aborted");
                    return;
                }
            };

            let result = if message.attempts() >= self.config.max_retries {
                self.escalate(coordinator, &message)
                    .await
                    .map(|done| report.escalated += usize::from(done))
            } else {
                self.republish(coordinator, &message)
                    .await
                    .map(|done| report.republished += usize::from(done))
            };

            if let Err(err) = result {
                report.errors += 1;
                warn!(
                    coordinator = coordinator.id(),
                    id = %message.id(),
                    error = %err,
                    "stale message recovery failed"
                );
            }
        }
    }

    async fn requeue_failed(&self, coordinator: &Arc<Coordinator>, report: &mut ScanReport) {
        let cutoff = cutoff(self.config.stale_after);

        let retryable: Vec<StagedMessage> = match coordinator
            .list_in_state(MessageState::Failed)
            .try_filter(|m| {
                future::ready(
                    m.failure().is_some_and(FailureReason::is_retryable)
                        && m.resolved_at().is_some_and(|at| at < cutoff),
                )
            })
            .try_collect()
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                report.errors += 1;
                warn!(coordinator = coordinator.id(), error = %err, "failed scan aborted");
                return;
            }
        };

        for message in retryable {
            let result = if message.attempts() >= self.config.max_retries {
                self.escalate_failed(coordinator, &message)
                    .await
                    .map(|done| report.escalated += usize::from(done))
            } else {
                self.requeue(coordinator, &message)
                    .await
                    .map(|done| report.requeued += usize::from(done))
            };

            if let Err(err) = result {
                report.errors += 1;
                warn!(
                    coordinator = coordinator.id(),
                    id = %message.id(),
                    error = %err,
                    "failed message recovery failed"
                );
            }
        }
    }

    /// READY → READY 后重投；消息已被并发推进时跳过
    async fn republish(&self, coordinator: &Coordinator, message: &StagedMessage) -> Result<bool> {
        let Some(retried) = skip_if_advanced(coordinator.record_retry(message.id()).await)? else {
            return Ok(false);
        };

        self.publisher.publish(&retried, coordinator.id()).await?;
        info!(
            coordinator = coordinator.id(),
            id = %message.id(),
            attempts = retried.attempts(),
            "stale message republished"
        );
        Ok(true)
    }

    /// FAILED → READY 后重投
    async fn requeue(&self, coordinator: &Coordinator, message: &StagedMessage) -> Result<bool> {
        let Some(requeued) = skip_if_advanced(coordinator.requeue(message.id()).await)? else {
            return Ok(false);
        };

        self.publisher.publish(&requeued, coordinator.id()).await?;
        info!(
            coordinator = coordinator.id(),
            id = %message.id(),
            attempts = requeued.attempts(),
            "failed message requeued"
        );
        Ok(true)
    }

    /// READY 消息达到重投上限：READY → FAILED(MaxRetriesExceeded) 并告警
    async fn escalate(&self, coordinator: &Coordinator, message: &StagedMessage) -> Result<bool> {
        let reason = FailureReason::MaxRetriesExceeded {
            attempts: message.attempts(),
        };
        let applied = skip_if_advanced(coordinator.fail(message.id(), reason.clone()).await)?;
        if applied != Some(true) {
            return Ok(false);
        }

        self.publisher.correlations().release_message(message.id());
        self.raise(coordinator, message, reason).await;
        Ok(true)
    }

    /// 可重试的 FAILED 消息达到上限：经 READY 再转为 FAILED(MaxRetriesExceeded)，
    /// 保持状态机不跳步
    async fn escalate_failed(
        &self,
        coordinator: &Coordinator,
        message: &StagedMessage,
    ) -> Result<bool> {
        let Some(requeued) = skip_if_advanced(coordinator.requeue(message.id()).await)? else {
            return Ok(false);
        };
        self.escalate(coordinator, &requeued).await
    }

    async fn raise(&self, coordinator: &Coordinator, message: &StagedMessage, reason: FailureReason) {
        let alert = Alert {
            coordinator_id: coordinator.id().to_string(),
            message_id: message.id().clone(),
            destination: message.destination().cloned(),
            reason,
            raised_at: Utc::now(),
        };

        if let Err(err) = self.alerts.raise(&alert).await {
            warn!(id = %message.id(), error = %err, "alert delivery failed");
        }
    }

    fn expire_correlations(&self) -> usize {
        let expired = self
            .publisher
            .correlations()
            .expire(cutoff(self.config.correlation_ttl));
        for (token, entry) in &expired {
            debug!(
                token = %token,
                coordinator = %entry.coordinator_id,
                id = %entry.message_id,
                "correlation entry expired"
            );
        }
        expired.len()
    }
}

/// 流转因并发推进而失效时返回 None，其余错误原样上抛
fn skip_if_advanced<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(DomainError::InvalidState { id, actual, .. }) => {
            debug!(id = %id, state = actual.as_str(), "message advanced concurrently, skipped");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
