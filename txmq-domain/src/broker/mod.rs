//! 消息投递（broker）
//!
//! - `BrokerClient`：外部 Broker 客户端协议（发送 + 一次性注册确认通道）；
//! - `BrokerPublisher`：投递适配器，签发关联令牌、登记关联并发送，
//!   收到确认后按关联记录回调对应协调者的 confirm/fail；
//! - `AckSender`/`AckReceiver`：Broker 回调线程到确认处理工作池之间的消息通道；
//! - `InMemoryBroker`：内存版 Broker 客户端，用于测试与示例。
//!
//! 确认查找与协调者解耦，多个协调者可共享同一个适配器与 Broker 连接。
//!
mod ack;
mod client;
mod in_memory;
mod publisher;

pub use ack::{AckReceiver, AckSender, DeliveryAck, DeliveryOutcome, ack_channel};
pub use client::{BrokerClient, OutboundMessage};
pub use in_memory::InMemoryBroker;
pub use publisher::{AckOutcome, BrokerPublisher};
