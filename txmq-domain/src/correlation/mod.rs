//! 关联登记（correlation）
//!
//! 出站关联令牌 → (消息 ID, 协调者 ID) 的内存映射，由投递适配器写入、
//! 由确认回调以“原子取出”的方式消费；过期清理由补偿扫描驱动，登记本身只负责存取。
//!
mod registry;
mod token;

pub use registry::{CorrelationEntry, CorrelationRegistry};
pub use token::CorrelationToken;
