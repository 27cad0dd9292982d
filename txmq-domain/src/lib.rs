//! 事务消息领域层（txmq-domain）
//!
//! 实现“业务提交后再投递”的事务消息协议：
//! - 消息模型（`message`）：消息 ID、投递目标、状态机与失败原因
//! - 暂存仓储（`staging`）：按消息 ID 持久化暂存记录，版本号条件写入
//! - 事务协调者（`coordinator`）：prepare / ready / discard / confirm / fail 与滞留扫描
//! - 关联登记（`correlation`）：发送令牌到“消息 ID + 协调者 ID”的映射
//! - 投递适配（`broker`）：发送、确认通道与确认对账
//! - 补偿扫描（`recovery`）：重投、升级为失败并告警、过期清理
//! - 投递引擎（`engine`）：确认消费与周期扫描的长驻任务
//! - 协调者登记表（`registry`）：启动时显式构建的只读映射
//!
//! 典型用法：
//! 1. 为每类业务构建 `Coordinator` 并注册进 `CoordinatorRegistry`；
//! 2. 以 Broker 客户端构建 `BrokerPublisher`，再构建 `RecoveryScanner`；
//! 3. 启动 `PublishEngine`，由应用层的事务拦截器驱动单次事务。
//!
pub mod broker;
pub mod coordinator;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod message;
pub mod recovery;
pub mod registry;
pub mod staging;
