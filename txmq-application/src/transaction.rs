use bon::Builder;
use serde::{Deserialize, Serialize};
use txmq_domain::correlation::CorrelationToken;
use txmq_domain::message::{Destination, MessageId};

/// 一次受保护调用的事务元数据
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSpec {
    #[builder(into)]
    coordinator: String,
    #[builder(into)]
    exchange: String,
    #[builder(into)]
    route_key: String,
    #[builder(into)]
    biz_id: String,
}

impl TransactionSpec {
    pub fn coordinator(&self) -> &str {
        &self.coordinator
    }

    pub fn biz_id(&self) -> &str {
        &self.biz_id
    }

    pub fn destination(&self) -> Destination {
        Destination::new(self.exchange.clone(), self.route_key.clone())
    }
}

/// 受保护调用成功后的回执
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionReceipt<T> {
    pub message_id: MessageId,
    pub token: CorrelationToken,
    pub output: T,
}
