//! 协议层统一错误定义
//!
//! 覆盖暂存、状态流转、投递与协调者解析的最小必要集合，
//! 便于应用层统一转换与上抛。
//!
use crate::message::{MessageId, MessageState};
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 协议时序 ---
    #[error("duplicate message id: {id}")]
    DuplicateId { id: MessageId },
    #[error("message not found: {id}")]
    NotFound { id: MessageId },
    #[error(
        "invalid state: id={id}, operation={operation}, expected={expected:?}, actual={actual:?}"
    )]
    InvalidState {
        id: MessageId,
        operation: &'static str,
        expected: MessageState,
        actual: MessageState,
    },
    #[error("version conflict: id={id}, expected={expected}, actual={actual}")]
    VersionConflict {
        id: MessageId,
        expected: u64,
        actual: u64,
    },

    // --- 投递 ---
    #[error("publish failed: id={id}, reason={reason}")]
    Publish { id: MessageId, reason: String },
    #[error("broker error: {reason}")]
    Broker { reason: String },

    // --- 协调者 ---
    #[error("coordinator not found: {coordinator}")]
    CoordinatorNotFound { coordinator: String },
    #[error("coordinator already registered: {coordinator}")]
    CoordinatorAlreadyRegistered { coordinator: String },

    // --- 存储/序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("staging store error: {reason}")]
    Store { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },

    // --- 通用 ---
    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },
}

impl DomainError {
    pub fn not_found(id: &MessageId) -> Self {
        DomainError::NotFound { id: id.clone() }
    }

    pub fn publish(id: &MessageId, reason: impl Into<String>) -> Self {
        DomainError::Publish {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    pub fn broker(reason: impl Into<String>) -> Self {
        DomainError::Broker {
            reason: reason.into(),
        }
    }

    pub fn invalid_value(reason: impl Into<String>) -> Self {
        DomainError::InvalidValue {
            reason: reason.into(),
        }
    }

    /// 是否属于协议时序错误（调用方编程错误，不应重试）
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DomainError::DuplicateId { .. }
                | DomainError::NotFound { .. }
                | DomainError::InvalidState { .. }
        )
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Database {
            reason: err.to_string(),
        }
    }
}
