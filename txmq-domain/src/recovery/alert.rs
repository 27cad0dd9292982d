//! 运维告警协议
//!
use crate::error::DomainResult as Result;
use crate::message::{Destination, FailureReason, MessageId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

/// 业务侧已成功、但消息最终未能送达的告警
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub coordinator_id: String,
    pub message_id: MessageId,
    pub destination: Option<Destination>,
    pub reason: FailureReason,
    pub raised_at: DateTime<Utc>,
}

/// 告警通道：运维可见的外部协作方
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: &Alert) -> Result<()>;
}

/// 仅写日志的告警通道
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: &Alert) -> Result<()> {
        error!(
            coordinator = %alert.coordinator_id,
            id = %alert.message_id,
            exchange = alert.destination.as_ref().map(|d| d.exchange.as_str()),
            route_key = alert.destination.as_ref().map(|d| d.route_key.as_str()),
            reason = %alert.reason,
            "message undeliverable, operator action required"
        );
        Ok(())
    }
}
