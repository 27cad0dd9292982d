//! 补偿扫描（recovery）
//!
//! 周期性对账“已就绪但未确认”的消息：
//! - 超时未确认的 READY 消息重新投递，并刷新 `ready_at`、累加重投次数；
//! - 达到重投上限仍未确认的消息转为 FAILED（`MaxRetriesExceeded`）并告警；
//! - 可重试原因的 FAILED 消息重新提升为 READY 后重投；
//! - 清理过期关联登记与超过保留期的终态消息。
//!
mod alert;
mod scanner;

pub use alert::{Alert, AlertSink, LogAlertSink};
pub use scanner::{RecoveryConfig, RecoveryScanner, ScanReport};
