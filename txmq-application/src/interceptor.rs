//! 事务拦截器（TransactionalPublisher）
//!
//! 以显式的高阶函数包裹一次业务调用，驱动协调者的生命周期：
//! 解析协调者 → 生成消息 ID → prepare → 业务调用 → ready → 投递。
//! 业务失败时删除暂存消息并原样返回业务错误；同步投递失败时撤回 READY 记录，
//! 协议错误以 `TransactionError::Protocol` 返回，不吞掉任何一侧的失败。
//!
use crate::error::TransactionError;
use crate::transaction::{TransactionReceipt, TransactionSpec};
use bon::Builder;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};
use txmq_domain::broker::BrokerPublisher;
use txmq_domain::coordinator::Coordinator;
use txmq_domain::error::DomainError;
use txmq_domain::message::MessageId;
use txmq_domain::registry::CoordinatorRegistry;

/// 业务调用返回空结果（`null`）时使用的占位负载
pub fn placeholder_payload() -> Value {
    Value::Object(Default::default())
}

#[derive(Builder, Clone)]
pub struct TransactionalPublisher {
    coordinators: Arc<CoordinatorRegistry>,
    publisher: Arc<BrokerPublisher>,
}

impl TransactionalPublisher {
    /// 在事务消息协议内执行一次业务调用。
    ///
    /// 业务调用成功后消息先转为 READY 再投递；同步投递失败时撤回这条从未发出的
    /// READY 记录，并把投递错误返回给调用方，由调用方决定是否重新发起。
    pub async fn execute<T, E, F, Fut>(
        &self,
        spec: &TransactionSpec,
        business: F,
    ) -> Result<TransactionReceipt<T>, TransactionError<E>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        info!(
            coordinator = spec.coordinator(),
            biz_id = spec.biz_id(),
            "distributed transaction started"
        );

        let coordinator = self.coordinators.resolve(spec.coordinator()).inspect_err(|err| {
            error!(coordinator = spec.coordinator(), error = %err, "coordinator unavailable");
        })?;

        let message_id = MessageId::generate(spec.biz_id())?;
        coordinator.prepare(&message_id).await?;

        let output = match business().await {
            Ok(output) => output,
            Err(err) => {
                warn!(id = %message_id, "business call failed, discarding staged message");
                Self::discard(&coordinator, &message_id).await;
                return Err(TransactionError::Business(err));
            }
        };

        let payload = match serde_json::to_value(&output) {
            Ok(Value::Null) => placeholder_payload(),
            Ok(payload) => payload,
            Err(err) => {
                Self::discard(&coordinator, &message_id).await;
                return Err(DomainError::from(err).into());
            }
        };

        let ready = coordinator
            .mark_ready(&message_id, spec.destination(), payload)
            .await?;

        match self.publisher.publish(&ready, coordinator.id()).await {
            Ok(token) => Ok(TransactionReceipt {
                message_id,
                token,
                output,
            }),
            Err(err) => {
                error!(id = %message_id, error = %err, "message failed to be sent");
                Self::withdraw(&coordinator, &message_id).await;
                Err(err.into())
            }
        }
    }

    async fn discard(coordinator: &Coordinator, id: &MessageId) {
        if let Err(err) = coordinator.discard(id).await {
            error!(coordinator = coordinator.id(), id = %id, error = %err, "discard failed");
        }
    }

    async fn withdraw(coordinator: &Coordinator, id: &MessageId) {
        if let Err(err) = coordinator.withdraw(id).await {
            error!(coordinator = coordinator.id(), id = %id, error = %err, "withdraw failed");
        }
    }
}
