//! 事务协调者（Coordinator）
//!
//! 独占暂存消息的状态流转：prepare → ready → confirmed/failed。
//! 每次流转都是对暂存仓储的一次版本号条件写入；并发写入冲突时重新读取并
//! 重新校验状态，因此竞争失败的一方会看到 `InvalidState` 而不是静默覆盖。
//!
//! 一个协调者独占一个暂存仓储（或仓储中的独立命名空间），`list_stale`
//! 只会看到本协调者的消息。
//!
use crate::error::{DomainError, DomainResult as Result};
use crate::message::{Destination, FailureReason, MessageId, MessageState, StagedMessage};
use crate::staging::StagingStore;
use bon::Builder;
use chrono::{DateTime, TimeDelta, Utc};
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt, future, stream};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 协调者配置
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// 扫描暂存仓储时的分页大小
    pub page_size: usize,
    /// 版本冲突时的最大重读次数
    pub cas_retries: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            page_size: 128,
            cas_retries: 8,
        }
    }
}

#[derive(Builder)]
pub struct Coordinator {
    #[builder(into)]
    id: String,
    store: Arc<dyn StagingStore>,
    #[builder(default)]
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(id: impl Into<String>, store: Arc<dyn StagingStore>) -> Self {
        Self {
            id: id.into(),
            store,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn get(&self, id: &MessageId) -> Result<Option<StagedMessage>> {
        self.store.load(id).await
    }

    /// 在业务调用之前暂存消息（PREPARING）
    pub async fn prepare(&self, id: &MessageId) -> Result<()> {
        let message = StagedMessage::preparing(id.clone(), Utc::now());
        self.store
            .insert(&message)
            .await
            .inspect_err(|err| self.log_violation("prepare", id, err))?;

        debug!(coordinator = %self.id, id = %id, "message staged");
        Ok(())
    }

    /// 业务调用成功后：PREPARING → READY，写入投递目标与负载
    pub async fn mark_ready(
        &self,
        id: &MessageId,
        destination: Destination,
        payload: Value,
    ) -> Result<StagedMessage> {
        let applied = self
            .transition(id, "mark_ready", |current, now| {
                current
                    .into_ready(destination.clone(), payload.clone(), now)
                    .map(Some)
            })
            .await?;

        Self::applied(id, applied)
    }

    /// 业务调用失败后删除 PREPARING 消息。
    ///
    /// 幂等：消息不存在时直接返回；消息已越过 PREPARING 时保留原状并记录日志。
    pub async fn discard(&self, id: &MessageId) -> Result<()> {
        for _ in 0..=self.config.cas_retries {
            let Some(current) = self.store.load(id).await? else {
                debug!(coordinator = %self.id, id = %id, "discard: message already gone");
                return Ok(());
            };

            if current.state() != MessageState::Preparing {
                warn!(
                    coordinator = %self.id,
                    id = %id,
                    state = current.state().as_str(),
                    "discard ignored: message already advanced past PREPARING"
                );
                return Ok(());
            }

            match self.store.remove(id, current.version()).await {
                Ok(()) => {
                    info!(coordinator = %self.id, id = %id, "staged message discarded");
                    return Ok(());
                }
                Err(DomainError::VersionConflict { .. } | DomainError::NotFound { .. }) => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(self.retries_exhausted(id))
    }

    /// 首次同步发送失败后撤回 READY 消息。
    ///
    /// 只删除从未投递出去的记录（`attempts == 0`）；补偿扫描已接手重投时保留，
    /// 返回 `false`。消息不存在同样返回 `false`。
    pub async fn withdraw(&self, id: &MessageId) -> Result<bool> {
        for _ in 0..=self.config.cas_retries {
            let Some(current) = self.store.load(id).await? else {
                return Ok(false);
            };

            if current.state() != MessageState::Ready {
                let err = DomainError::InvalidState {
                    id: id.clone(),
                    operation: "withdraw",
                    expected: MessageState::Ready,
                    actual: current.state(),
                };
                self.log_violation("withdraw", id, &err);
                return Err(err);
            }
            if current.attempts() > 0 {
                debug!(coordinator = %self.id, id = %id, "withdraw skipped: already retried");
                return Ok(false);
            }

            match self.store.remove(id, current.version()).await {
                Ok(()) => {
                    info!(coordinator = %self.id, id = %id, "unsent message withdrawn");
                    return Ok(true);
                }
                Err(DomainError::VersionConflict { .. } | DomainError::NotFound { .. }) => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(self.retries_exhausted(id))
    }

    /// Broker 正向确认：READY → CONFIRMED；重复确认为无副作用的空操作。
    ///
    /// 返回本次调用是否实际发生了流转。
    pub async fn confirm(&self, id: &MessageId) -> Result<bool> {
        let applied = self
            .transition(id, "confirm", |current, now| {
                if current.state() == MessageState::Confirmed {
                    debug!(coordinator = %self.id, id = %id, "confirm: already confirmed");
                    return Ok(None);
                }
                current.into_confirmed(now).map(Some)
            })
            .await?;

        Ok(applied.is_some())
    }

    /// Broker 拒收或发送不可恢复失败：READY → FAILED；重复失败为空操作
    pub async fn fail(&self, id: &MessageId, reason: FailureReason) -> Result<bool> {
        let applied = self
            .transition(id, "fail", |current, now| {
                if current.state() == MessageState::Failed {
                    debug!(coordinator = %self.id, id = %id, "fail: already failed");
                    return Ok(None);
                }
                current.into_failed(reason.clone(), now).map(Some)
            })
            .await?;

        if applied.is_some() {
            warn!(coordinator = %self.id, id = %id, reason = %reason, "message failed");
        }
        Ok(applied.is_some())
    }

    /// 补偿重投前调用：READY → READY，刷新 `ready_at` 并累加次数
    pub async fn record_retry(&self, id: &MessageId) -> Result<StagedMessage> {
        let applied = self
            .transition(id, "record_retry", |current, now| {
                current.into_retried(now).map(Some)
            })
            .await?;

        Self::applied(id, applied)
    }

    /// 补偿扫描重新提升：FAILED → READY
    pub async fn requeue(&self, id: &MessageId) -> Result<StagedMessage> {
        let applied = self
            .transition(id, "requeue", |current, now| {
                current.into_requeued(now).map(Some)
            })
            .await?;

        Self::applied(id, applied)
    }

    /// READY 且 `ready_at` 早于 `now - older_than` 的消息。
    ///
    /// 惰性分页读取；每次调用都从头开始一轮新的扫描。
    pub fn list_stale(&self, older_than: Duration) -> BoxStream<'static, Result<StagedMessage>> {
        let store = self.store.clone();
        let page_size = self.config.page_size.max(1);
        let cutoff = cutoff(older_than);

        Self::paged(page_size, move |after| {
            let store = store.clone();
            async move { store.scan_stale(cutoff, after.as_ref(), page_size).await }
        })
    }

    /// 处于指定状态的全部消息（按 ID 升序分页读取）
    pub fn list_in_state(&self, state: MessageState) -> BoxStream<'static, Result<StagedMessage>> {
        let store = self.store.clone();
        let page_size = self.config.page_size.max(1);

        Self::paged(page_size, move |after| {
            let store = store.clone();
            async move { store.scan(state, after.as_ref(), page_size).await }
        })
    }

    /// 删除终态且超过保留期的消息，返回删除数量
    pub async fn purge_resolved(&self, retention: Duration) -> Result<usize> {
        let cutoff = cutoff(retention);
        let mut purged = 0;

        for state in [MessageState::Confirmed, MessageState::Failed] {
            let expired: Vec<StagedMessage> = self
                .list_in_state(state)
                .try_filter(|m| future::ready(m.resolved_at().is_some_and(|at| at < cutoff)))
                .try_collect()
                .await?;

            for message in expired {
                match self.store.remove(message.id(), message.version()).await {
                    Ok(()) => purged += 1,
                    // 期间被其他流转改写或删除，留待下一轮
                    Err(DomainError::VersionConflict { .. } | DomainError::NotFound { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        if purged > 0 {
            info!(coordinator = %self.id, purged, "resolved messages purged");
        }
        Ok(purged)
    }

    async fn transition<F>(
        &self,
        id: &MessageId,
        operation: &'static str,
        step: F,
    ) -> Result<Option<StagedMessage>>
    where
        F: Fn(&StagedMessage, DateTime<Utc>) -> Result<Option<StagedMessage>> + Send + Sync,
    {
        let result = self.try_transition(id, operation, step).await;
        if let Err(err) = &result {
            self.log_violation(operation, id, err);
        }
        result
    }

    async fn try_transition<F>(
        &self,
        id: &MessageId,
        operation: &'static str,
        step: F,
    ) -> Result<Option<StagedMessage>>
    where
        F: Fn(&StagedMessage, DateTime<Utc>) -> Result<Option<StagedMessage>> + Send + Sync,
    {
        for _ in 0..=self.config.cas_retries {
            let current = self
                .store
                .load(id)
                .await?
                .ok_or_else(|| DomainError::not_found(id))?;

            let Some(next) = step(&current, Utc::now())? else {
                return Ok(None);
            };

            match self.store.compare_and_swap(current.version(), &next).await {
                Ok(()) => {
                    debug!(
                        coordinator = %self.id,
                        id = %id,
                        operation,
                        from = current.state().as_str(),
                        to = next.state().as_str(),
                        version = next.version(),
                        "transition applied"
                    );
                    return Ok(Some(next));
                }
                Err(DomainError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(self.retries_exhausted(id))
    }

    fn applied(id: &MessageId, applied: Option<StagedMessage>) -> Result<StagedMessage> {
        applied.ok_or_else(|| DomainError::Store {
            reason: format!("transition on {id} produced no record"),
        })
    }

    fn retries_exhausted(&self, id: &MessageId) -> DomainError {
        DomainError::Store {
            reason: format!(
                "gave up on {id} after {} conflicting writes",
                self.config.cas_retries + 1
            ),
        }
    }

    fn log_violation(&self, operation: &'static str, id: &MessageId, err: &DomainError) {
        if err.is_protocol_violation() {
            warn!(coordinator = %self.id, id = %id, operation, error = %err, "protocol violation");
        }
    }

    /// 以 `fetch(after)` 逐页读取，某页不足 `page_size` 条即结束
    fn paged<F, Fut>(page_size: usize, fetch: F) -> BoxStream<'static, Result<StagedMessage>>
    where
        F: Fn(Option<MessageId>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<StagedMessage>>> + Send + 'static,
    {
        // 外层 None 表示已读完；内层为分页游标
        stream::try_unfold(Some(None::<MessageId>), move |cursor| {
            let page = cursor.map(&fetch);
            async move {
                let Some(page) = page else {
                    return Ok::<_, DomainError>(None);
                };
                let page = page.await?;
                let next = (page.len() == page_size)
                    .then(|| page.last().map(|m| m.id().clone()))
                    .flatten()
                    .map(Some);

                let items = page.into_iter().map(Ok::<StagedMessage, DomainError>);
                Ok(Some((stream::iter(items), next)))
            }
        })
        .try_flatten()
        .boxed()
    }
}

/// `now - older_than`；超出时间范围时取最早可表示时刻
pub(crate) fn cutoff(older_than: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(older_than)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
