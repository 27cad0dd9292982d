//! 内存版 Broker 客户端（InMemoryBroker）
//!
//! 记录所有已受理的发送，支持注入同步发送失败，并可手动或自动回传确认。
//! 典型用途：测试环境、示例与本地开发。
//!
use super::{AckSender, BrokerClient, DeliveryAck, OutboundMessage};
use crate::correlation::CorrelationToken;
use crate::error::{DomainError, DomainResult as Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct InMemoryBroker {
    sent: Mutex<Vec<OutboundMessage>>,
    sink: Mutex<Option<AckSender>>,
    failing_sends: AtomicUsize,
    auto_ack: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次发送成功后立即回传正向确认
    pub fn with_auto_ack(self) -> Self {
        self.auto_ack.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// 接下来的 `n` 次发送同步失败
    pub fn fail_next_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.sent).clone()
    }

    pub fn last_token(&self) -> Option<CorrelationToken> {
        lock(&self.sent).last().map(|m| m.token.clone())
    }

    pub async fn ack(&self, token: CorrelationToken) -> Result<()> {
        self.sink()?.deliver(DeliveryAck::ack(token)).await
    }

    pub async fn nack(&self, token: CorrelationToken, reason: impl Into<String>) -> Result<()> {
        self.sink()?.deliver(DeliveryAck::nack(token, reason)).await
    }

    fn sink(&self) -> Result<AckSender> {
        lock(&self.sink)
            .clone()
            .ok_or_else(|| DomainError::broker("no delivery callback registered"))
    }

    fn take_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        if self.take_failure() {
            return Err(DomainError::broker("connection refused"));
        }

        lock(&self.sent).push(message.clone());

        if self.auto_ack.load(Ordering::SeqCst) {
            self.sink()?.deliver(DeliveryAck::ack(message.token.clone())).await?;
        }
        Ok(())
    }

    fn on_delivery(&self, sink: AckSender) {
        *lock(&self.sink) = Some(sink);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
