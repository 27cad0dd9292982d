//! 投递确认通道
//!
use crate::correlation::CorrelationToken;
use crate::error::{DomainError, DomainResult as Result};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack,
    Nack { reason: String },
}

/// Broker 对一次发送的确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub token: CorrelationToken,
    pub outcome: DeliveryOutcome,
}

impl DeliveryAck {
    pub fn ack(token: CorrelationToken) -> Self {
        Self {
            token,
            outcome: DeliveryOutcome::Ack,
        }
    }

    pub fn nack(token: CorrelationToken, reason: impl Into<String>) -> Self {
        Self {
            token,
            outcome: DeliveryOutcome::Nack {
                reason: reason.into(),
            },
        }
    }

    pub fn is_ack(&self) -> bool {
        self.outcome == DeliveryOutcome::Ack
    }
}

/// 确认通道发送端，交给 Broker 客户端持有
#[derive(Clone, Debug)]
pub struct AckSender {
    tx: mpsc::Sender<DeliveryAck>,
}

impl AckSender {
    pub async fn deliver(&self, ack: DeliveryAck) -> Result<()> {
        self.tx
            .send(ack)
            .await
            .map_err(|_| DomainError::broker("ack channel closed"))
    }

    /// 非异步上下文（如 Broker 库自身的回调线程）中使用
    pub fn try_deliver(&self, ack: DeliveryAck) -> Result<()> {
        self.tx
            .try_send(ack)
            .map_err(|e| DomainError::broker(e.to_string()))
    }
}

/// 确认通道接收端，由引擎的确认工作池消费
#[derive(Debug)]
pub struct AckReceiver {
    rx: mpsc::Receiver<DeliveryAck>,
}

impl AckReceiver {
    pub async fn recv(&mut self) -> Option<DeliveryAck> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<DeliveryAck> {
        ReceiverStream::new(self.rx)
    }
}

/// 创建有界确认通道；缓冲满时 `deliver` 会等待，形成对 Broker 回调的背压
pub fn ack_channel(capacity: usize) -> (AckSender, AckReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AckSender { tx }, AckReceiver { rx })
}
