use super::CorrelationToken;
use crate::message::MessageId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// 一次出站发送的关联记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub message_id: MessageId,
    pub coordinator_id: String,
    pub issued_at: DateTime<Utc>,
}

impl CorrelationEntry {
    pub fn new(message_id: MessageId, coordinator_id: impl Into<String>) -> Self {
        Self {
            message_id,
            coordinator_id: coordinator_id.into(),
            issued_at: Utc::now(),
        }
    }
}

/// 关联登记：投递适配器与确认回调共享，支持按令牌原子取出
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    entries: Arc<DashMap<CorrelationToken, CorrelationEntry>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: CorrelationToken, entry: CorrelationEntry) {
        self.entries.insert(token, entry);
    }

    /// 原子地移除并返回令牌对应的记录；同一令牌只会被取出一次
    pub fn take(&self, token: &CorrelationToken) -> Option<CorrelationEntry> {
        self.entries.remove(token).map(|(_, entry)| entry)
    }

    pub fn lookup(&self, token: &CorrelationToken) -> Option<CorrelationEntry> {
        self.entries.get(token).map(|e| e.value().clone())
    }

    /// 移除某条消息的全部在途记录，返回移除数量
    pub fn release_message(&self, message_id: &MessageId) -> usize {
        let mut released = 0;
        self.entries.retain(|_, e| {
            let keep = &e.message_id != message_id;
            released += usize::from(!keep);
            keep
        });
        released
    }

    /// 移除并返回 `cutoff` 之前签发的记录
    pub fn expire(&self, cutoff: DateTime<Utc>) -> Vec<(CorrelationToken, CorrelationEntry)> {
        let expired: Vec<CorrelationToken> = self
            .entries
            .iter()
            .filter(|e| e.value().issued_at < cutoff)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|token| self.entries.remove(&token))
            .collect()
    }

    pub fn tokens_for(&self, message_id: &MessageId) -> Vec<CorrelationToken> {
        self.entries
            .iter()
            .filter(|e| &e.value().message_id == message_id)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
