use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// 消息进入 FAILED 时记录的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Broker 异步拒收（negative ack）
    DeliveryNack { reason: String },
    /// 发送不可恢复地失败
    PublishFailed { reason: String },
    /// 补偿重投达到上限
    MaxRetriesExceeded { attempts: u32 },
}

impl FailureReason {
    pub fn delivery_nack(reason: impl Into<String>) -> Self {
        FailureReason::DeliveryNack {
            reason: reason.into(),
        }
    }

    pub fn publish_failed(reason: impl Into<String>) -> Self {
        FailureReason::PublishFailed {
            reason: reason.into(),
        }
    }

    /// 是否可由补偿扫描重新提升为 READY
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::MaxRetriesExceeded { .. })
    }
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeliveryNack { reason } => write!(f, "DeliveryNegativeAck: {reason}"),
            Self::PublishFailed { reason } => write!(f, "PublishError: {reason}"),
            Self::MaxRetriesExceeded { attempts } => {
                write!(f, "MaxRetriesExceeded: attempts={attempts}")
            }
        }
    }
}
