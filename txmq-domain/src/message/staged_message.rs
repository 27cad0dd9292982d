use super::{FailureReason, MessageId};
use crate::error::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 暂存消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Preparing,
    Ready,
    Confirmed,
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Preparing => "PREPARING",
            MessageState::Ready => "READY",
            MessageState::Confirmed => "CONFIRMED",
            MessageState::Failed => "FAILED",
        }
    }
}

/// 投递目标（对协议而言是不透明字符串）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub exchange: String,
    pub route_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, route_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            route_key: route_key.into(),
        }
    }
}

/// 暂存仓储中的一条消息记录
///
/// 所有状态流转都返回新的记录（版本号 +1），由协调者以 CAS 方式写回仓储。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedMessage {
    id: MessageId,
    state: MessageState,
    /// PREPARING 阶段为空
    destination: Option<Destination>,
    /// PREPARING 阶段为空
    payload: Option<Value>,
    created_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
    /// 进入终态（CONFIRMED/FAILED）的时间，用于保留期清理
    resolved_at: Option<DateTime<Utc>>,
    /// 补偿重投次数
    attempts: u32,
    failure: Option<FailureReason>,
    /// 记录修订号，每次写入递增
    version: u64,
}

impl StagedMessage {
    /// 新建 PREPARING 记录
    pub fn preparing(id: MessageId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: MessageState::Preparing,
            destination: None,
            payload: None,
            created_at: now,
            ready_at: None,
            resolved_at: None,
            attempts: 0,
            failure: None,
            version: 0,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.ready_at
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// READY 且 `ready_at` 早于截止时间
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == MessageState::Ready && self.ready_at.is_some_and(|at| at < cutoff)
    }

    /// 发送所需的目标与负载；仅 READY 记录可发送
    pub fn outbound(&self) -> DomainResult<(&Destination, &Value)> {
        self.expect_state(MessageState::Ready, "publish")?;
        match (&self.destination, &self.payload) {
            (Some(destination), Some(payload)) => Ok((destination, payload)),
            _ => Err(DomainError::Store {
                reason: format!("ready message {} has no destination or payload", self.id),
            }),
        }
    }

    /// PREPARING → READY
    pub fn into_ready(
        &self,
        destination: Destination,
        payload: Value,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        self.expect_state(MessageState::Preparing, "mark_ready")?;
        Ok(Self {
            state: MessageState::Ready,
            destination: Some(destination),
            payload: Some(payload),
            ready_at: Some(now),
            ..self.next_revision()
        })
    }

    /// READY → CONFIRMED
    pub fn into_confirmed(&self, now: DateTime<Utc>) -> DomainResult<Self> {
        self.expect_state(MessageState::Ready, "confirm")?;
        Ok(Self {
            state: MessageState::Confirmed,
            resolved_at: Some(now),
            ..self.next_revision()
        })
    }

    /// READY → FAILED
    pub fn into_failed(&self, reason: FailureReason, now: DateTime<Utc>) -> DomainResult<Self> {
        self.expect_state(MessageState::Ready, "fail")?;
        Ok(Self {
            state: MessageState::Failed,
            resolved_at: Some(now),
            failure: Some(reason),
            ..self.next_revision()
        })
    }

    /// READY → READY：补偿重投，刷新 `ready_at` 并累加重投次数
    pub fn into_retried(&self, now: DateTime<Utc>) -> DomainResult<Self> {
        self.expect_state(MessageState::Ready, "record_retry")?;
        Ok(Self {
            ready_at: Some(now),
            attempts: self.attempts.saturating_add(1),
            ..self.next_revision()
        })
    }

    /// FAILED → READY：补偿扫描重新提升
    pub fn into_requeued(&self, now: DateTime<Utc>) -> DomainResult<Self> {
        self.expect_state(MessageState::Failed, "requeue")?;
        Ok(Self {
            state: MessageState::Ready,
            ready_at: Some(now),
            resolved_at: None,
            failure: None,
            attempts: self.attempts.saturating_add(1),
            ..self.next_revision()
        })
    }

    pub(crate) fn expect_state(
        &self,
        expected: MessageState,
        operation: &'static str,
    ) -> DomainResult<()> {
        if self.state == expected {
            return Ok(());
        }

        Err(DomainError::InvalidState {
            id: self.id.clone(),
            operation,
            expected,
            actual: self.state,
        })
    }

    fn next_revision(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }
}
