//! 内存版暂存仓储（InMemoryStagingStore）
//!
//! 基于 `DashMap` 的分片锁保证单键原子条件更新；记录以序列化 JSON 保存，
//! 与持久化实现保持相同的存储形态。典型用途：测试、示例与单进程部署。
//!
//! 注意：进程退出即丢失，不提供崩溃恢复能力。

use super::StagingStore;
use crate::error::{DomainError, DomainResult as Result};
use crate::message::{MessageId, MessageState, StagedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredRecord {
    state: MessageState,
    version: u64,
    ready_at: Option<DateTime<Utc>>,
    json: String,
}

impl StoredRecord {
    fn encode(message: &StagedMessage) -> Result<Self> {
        Ok(Self {
            state: message.state(),
            version: message.version(),
            ready_at: message.ready_at(),
            json: serde_json::to_string(message)?,
        })
    }

    fn decode(&self) -> Result<StagedMessage> {
        Ok(serde_json::from_str(&self.json)?)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStagingStore {
    records: Arc<DashMap<MessageId, StoredRecord>>,
}

impl InMemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.records.contains_key(id)
    }

    fn page(
        &self,
        after: Option<&MessageId>,
        limit: usize,
        keep: impl Fn(&StoredRecord) -> bool,
    ) -> Result<Vec<StagedMessage>> {
        let mut page: Vec<(MessageId, StoredRecord)> = self
            .records
            .iter()
            .filter(|r| keep(r.value()))
            .filter(|r| after.is_none_or(|cursor| r.key() > cursor))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        page.sort_by(|a, b| a.0.cmp(&b.0));
        page.truncate(limit);
        page.iter().map(|(_, r)| r.decode()).collect()
    }

    fn conflict(id: &MessageId, expected: u64, actual: u64) -> DomainError {
        DomainError::VersionConflict {
            id: id.clone(),
            expected,
            actual,
        }
    }
}

#[async_trait]
impl StagingStore for InMemoryStagingStore {
    async fn insert(&self, message: &StagedMessage) -> Result<()> {
        let record = StoredRecord::encode(message)?;
        match self.records.entry(message.id().clone()) {
            Entry::Occupied(_) => Err(DomainError::DuplicateId {
                id: message.id().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn load(&self, id: &MessageId) -> Result<Option<StagedMessage>> {
        let record = self.records.get(id).map(|r| r.value().clone());
        record.map(|r| r.decode()).transpose()
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        message: &StagedMessage,
    ) -> Result<()> {
        let next = StoredRecord::encode(message)?;
        let Some(mut current) = self.records.get_mut(message.id()) else {
            return Err(DomainError::not_found(message.id()));
        };

        if current.version != expected_version {
            return Err(Self::conflict(
                message.id(),
                expected_version,
                current.version,
            ));
        }

        *current = next;
        Ok(())
    }

    async fn remove(&self, id: &MessageId, expected_version: u64) -> Result<()> {
        match self.records.entry(id.clone()) {
            Entry::Vacant(_) => Err(DomainError::not_found(id)),
            Entry::Occupied(slot) => {
                let actual = slot.get().version;
                if actual != expected_version {
                    return Err(Self::conflict(id, expected_version, actual));
                }
                slot.remove();
                Ok(())
            }
        }
    }

    async fn scan(
        &self,
        state: MessageState,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<StagedMessage>> {
        self.page(after, limit, |r| r.state == state)
    }

    async fn scan_stale(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<StagedMessage>> {
        self.page(after, limit, |r| {
            r.state == MessageState::Ready && r.ready_at.is_some_and(|at| at < cutoff)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Destination;
    use chrono::Utc;
    use serde_json::json;

    fn prepared(id: &str) -> StagedMessage {
        StagedMessage::preparing(id.into(), Utc::now())
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let store = InMemoryStagingStore::new();
        store.insert(&prepared("a#1")).await.unwrap();

        let err = store.insert(&prepared("a#1")).await.unwrap_err();
        assert!(matches!(err, DomainError::DuplicateId { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_swap_checks_version() {
        let store = InMemoryStagingStore::new();
        let msg = prepared("a#1");
        store.insert(&msg).await.unwrap();

        let ready = msg
            .into_ready(Destination::new("e", "r"), json!({"k": 1}), Utc::now())
            .unwrap();
        store.compare_and_swap(0, &ready).await.unwrap();

        // 以过期版本号再次写入应冲突
        let err = store.compare_and_swap(0, &ready).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        let loaded = store.load(ready.id()).await.unwrap().unwrap();
        assert_eq!(loaded, ready);
    }

    #[tokio::test]
    async fn compare_and_swap_on_missing_record_is_not_found() {
        let store = InMemoryStagingStore::new();
        let err = store
            .compare_and_swap(0, &prepared("ghost#1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound { .. }));
    }

    #[tokio::test]
    async fn remove_is_conditional() {
        let store = InMemoryStagingStore::new();
        store.insert(&prepared("a#1")).await.unwrap();

        assert!(matches!(
            store.remove(&"a#1".into(), 7).await,
            Err(DomainError::VersionConflict { .. })
        ));
        store.remove(&"a#1".into(), 0).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.remove(&"a#1".into(), 0).await,
            Err(DomainError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn scan_pages_in_id_order() {
        let store = InMemoryStagingStore::new();
        for id in ["c#1", "a#1", "e#1", "b#1", "d#1"] {
            store.insert(&prepared(id)).await.unwrap();
        }
        let ready = prepared("f#1")
            .into_ready(Destination::new("e", "r"), json!(null), Utc::now())
            .unwrap();
        store.insert(&ready).await.unwrap();

        let first = store.scan(MessageState::Preparing, None, 2).await.unwrap();
        let ids: Vec<&str> = first.iter().map(|m| m.id().as_str()).collect();
        assert_eq!(ids, ["a#1", "b#1"]);

        let rest = store
            .scan(MessageState::Preparing, Some(first[1].id()), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = rest.iter().map(|m| m.id().as_str()).collect();
        assert_eq!(ids, ["c#1", "d#1", "e#1"]);

        let ready_only = store.scan(MessageState::Ready, None, 10).await.unwrap();
        assert_eq!(ready_only.len(), 1);
    }

    #[tokio::test]
    async fn scan_stale_filters_by_ready_at() {
        let store = InMemoryStagingStore::new();
        let now = Utc::now();
        let old = now - chrono::TimeDelta::minutes(5);
        for (id, at) in [("b#1", old), ("a#1", old), ("c#1", now)] {
            let ready = prepared(id)
                .into_ready(Destination::new("e", "r"), json!({}), at)
                .unwrap();
            store.insert(&ready).await.unwrap();
        }
        store.insert(&prepared("d#1")).await.unwrap();

        let cutoff = now - chrono::TimeDelta::minutes(1);
        let stale = store.scan_stale(cutoff, None, 10).await.unwrap();
        let ids: Vec<&str> = stale.iter().map(|m| m.id().as_str()).collect();
        assert_eq!(ids, ["a#1", "b#1"]);
        assert!(stale.iter().all(|m| m.is_stale(cutoff)));

        let rest = store
            .scan_stale(cutoff, Some(stale[0].id()), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
    }
}
