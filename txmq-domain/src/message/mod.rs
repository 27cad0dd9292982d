//! 暂存消息模型（message）
//!
//! 定义一条待发布事件在暂存仓储中的标准形态：
//! - `MessageId`：`<bizId>#<时间戳>` 形式的全局唯一标识；
//! - `MessageState`：PREPARING → READY → CONFIRMED/FAILED 状态机；
//! - `StagedMessage`：带版本号的持久化记录，所有状态流转都以纯函数形式定义在其上；
//! - `FailureReason`：进入 FAILED 时记录的原因，决定补偿扫描是否可重投。
//!
mod failure;
mod message_id;
mod staged_message;

pub use failure::FailureReason;
pub use message_id::{ID_DELIMITER, MessageId, TIMESTAMP_FORMAT};
pub use staged_message::{Destination, MessageState, StagedMessage};
