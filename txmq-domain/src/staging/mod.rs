//! 暂存仓储（staging）
//!
//! 消息 ID → 暂存记录的持久化映射，是协调者与补偿扫描共享的唯一状态：
//! - `StagingStore`：插入、按版本号条件更新/删除、按状态分页扫描；
//! - `InMemoryStagingStore`：基于并发 Map 的实现，记录以序列化 JSON 保存；
//! - `PgStagingStore`（`infra-sqlx`）：基于 Postgres 条件 UPDATE 的实现。
//!
mod in_memory;
#[cfg(feature = "infra-sqlx")]
mod postgres;
mod store;

pub use in_memory::InMemoryStagingStore;
#[cfg(feature = "infra-sqlx")]
pub use postgres::PgStagingStore;
pub use store::StagingStore;
