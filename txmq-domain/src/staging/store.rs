//! 暂存仓储协议
//!
use crate::error::DomainResult as Result;
use crate::message::{MessageId, MessageState, StagedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// 暂存仓储：单键读写一致，支持按版本号的原子条件更新
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// 插入新记录；ID 已存在时返回 `DuplicateId`
    async fn insert(&self, message: &StagedMessage) -> Result<()>;

    async fn load(&self, id: &MessageId) -> Result<Option<StagedMessage>>;

    /// 当且仅当存储中记录的版本号等于 `expected_version` 时写入 `message`。
    ///
    /// - 记录不存在：`NotFound`
    /// - 版本号不匹配：`VersionConflict`
    async fn compare_and_swap(&self, expected_version: u64, message: &StagedMessage)
    -> Result<()>;

    /// 当且仅当版本号匹配时删除记录，错误语义同 `compare_and_swap`
    async fn remove(&self, id: &MessageId, expected_version: u64) -> Result<()>;

    /// 按 ID 升序返回处于 `state` 的记录，从 `after`（不含）之后开始，最多 `limit` 条
    async fn scan(
        &self,
        state: MessageState,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<StagedMessage>>;

    /// 按 ID 升序返回 `ready_at` 早于 `cutoff` 的 READY 记录，分页语义同 `scan`
    async fn scan_stale(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<StagedMessage>>;
}

#[async_trait]
impl<T> StagingStore for Arc<T>
where
    T: StagingStore + ?Sized,
{
    async fn insert(&self, message: &StagedMessage) -> Result<()> {
        (**self).insert(message).await
    }

    async fn load(&self, id: &MessageId) -> Result<Option<StagedMessage>> {
        (**self).load(id).await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        message: &StagedMessage,
    ) -> Result<()> {
        (**self).compare_and_swap(expected_version, message).await
    }

    async fn remove(&self, id: &MessageId, expected_version: u64) -> Result<()> {
        (**self).remove(id, expected_version).await
    }

    async fn scan(
        &self,
        state: MessageState,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<StagedMessage>> {
        (**self).scan(state, after, limit).await
    }

    async fn scan_stale(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<StagedMessage>> {
        (**self).scan_stale(cutoff, after, limit).await
    }
}
