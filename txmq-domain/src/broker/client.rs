//! Broker 客户端协议
//!
use super::AckSender;
use crate::correlation::CorrelationToken;
use crate::error::DomainResult as Result;
use crate::message::{Destination, MessageId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一次出站发送的完整内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// 随消息携带，供幂等消费者去重
    pub message_id: MessageId,
    pub destination: Destination,
    pub token: CorrelationToken,
    pub payload: Value,
}

/// Broker 客户端：连接管理与线协议由实现方负责
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// 发送消息；返回即表示 Broker 已受理，确认结果经确认通道异步回传
    async fn send(&self, message: &OutboundMessage) -> Result<()>;

    /// 注册确认通道（启动时调用一次）
    fn on_delivery(&self, sink: AckSender);
}
