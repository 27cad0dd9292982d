//! 投递适配器（BrokerPublisher）
//!
//! 发送前签发关联令牌并登记 `(令牌 → 消息 ID, 协调者 ID)`，确认到达后
//! 原子取出登记并回调对应协调者。未知令牌（已对账或已过期）记录日志后丢弃：
//! 补偿重投可能为已确认的消息再产生一次确认。
//!
use super::{AckReceiver, BrokerClient, DeliveryAck, DeliveryOutcome, OutboundMessage, ack_channel};
use crate::correlation::{CorrelationEntry, CorrelationRegistry, CorrelationToken};
use crate::error::{DomainError, DomainResult as Result};
use crate::message::{FailureReason, MessageId, StagedMessage};
use crate::registry::CoordinatorRegistry;
use bon::Builder;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一次确认的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Confirmed { message_id: MessageId },
    Failed { message_id: MessageId },
    /// 令牌未登记，已丢弃
    Unmatched,
}

#[derive(Builder)]
pub struct BrokerPublisher {
    client: Arc<dyn BrokerClient>,
    coordinators: Arc<CoordinatorRegistry>,
    #[builder(default)]
    correlations: CorrelationRegistry,
}

impl BrokerPublisher {
    /// 创建确认通道并注册到 Broker 客户端，返回接收端供引擎消费
    pub fn subscribe_acks(&self, capacity: usize) -> AckReceiver {
        let (tx, rx) = ack_channel(capacity);
        self.client.on_delivery(tx);
        rx
    }

    pub fn correlations(&self) -> &CorrelationRegistry {
        &self.correlations
    }

    pub fn coordinators(&self) -> &Arc<CoordinatorRegistry> {
        &self.coordinators
    }

    /// 发送一条 READY 消息，返回本次发送的关联令牌。
    ///
    /// 同步发送失败时撤销关联登记并返回 `Publish` 错误，此时没有消息在途。
    pub async fn publish(
        &self,
        message: &StagedMessage,
        coordinator_id: &str,
    ) -> Result<CorrelationToken> {
        let (destination, payload) = message.outbound()?;
        let token = CorrelationToken::generate();

        // 先登记再发送：确认可能先于 send 返回到达
        self.correlations.register(
            token.clone(),
            CorrelationEntry::new(message.id().clone(), coordinator_id),
        );

        let outbound = OutboundMessage {
            message_id: message.id().clone(),
            destination: destination.clone(),
            token: token.clone(),
            payload: payload.clone(),
        };

        if let Err(err) = self.client.send(&outbound).await {
            self.correlations.take(&token);
            warn!(
                coordinator = coordinator_id,
                id = %message.id(),
                exchange = %destination.exchange,
                route_key = %destination.route_key,
                error = %err,
                "broker send failed"
            );
            return Err(DomainError::publish(message.id(), err.to_string()));
        }

        debug!(
            coordinator = coordinator_id,
            id = %message.id(),
            token = %token,
            attempts = message.attempts(),
            "message handed to broker"
        );
        Ok(token)
    }

    /// 处理 Broker 确认
    pub async fn on_ack(&self, ack: DeliveryAck) -> Result<AckOutcome> {
        let Some(entry) = self.correlations.take(&ack.token) else {
            debug!(token = %ack.token, ack = ack.is_ack(), "ack for unknown token dropped");
            return Ok(AckOutcome::Unmatched);
        };

        let coordinator = self.coordinators.resolve(&entry.coordinator_id)?;
        match ack.outcome {
            DeliveryOutcome::Ack => {
                coordinator.confirm(&entry.message_id).await?;
                info!(
                    coordinator = %entry.coordinator_id,
                    id = %entry.message_id,
                    "delivery confirmed"
                );
                Ok(AckOutcome::Confirmed {
                    message_id: entry.message_id,
                })
            }
            DeliveryOutcome::Nack { reason } => {
                coordinator
                    .fail(&entry.message_id, FailureReason::delivery_nack(reason))
                    .await?;
                Ok(AckOutcome::Failed {
                    message_id: entry.message_id,
                })
            }
        }
    }
}
