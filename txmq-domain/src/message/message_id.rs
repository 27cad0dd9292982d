use crate::error::{DomainError, DomainResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// 业务键与时间戳之间的分隔符（全系统固定）
pub const ID_DELIMITER: char = '#';

/// 消息 ID 中时间戳部分的格式：精确到纳秒，无分隔符
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%9f";

/// 消息唯一标识：`<bizId>#<yyyyMMddHHmmss + 9 位纳秒>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// 以原始字符串构造（通常来自存储层或测试）
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// 以业务键与当前时间生成新的消息 ID
    pub fn generate(biz_id: &str) -> DomainResult<Self> {
        Self::generate_at(biz_id, Utc::now())
    }

    pub fn generate_at(biz_id: &str, at: DateTime<Utc>) -> DomainResult<Self> {
        if biz_id.trim().is_empty() {
            return Err(DomainError::invalid_value("biz id must not be empty"));
        }

        Ok(Self(format!(
            "{biz_id}{ID_DELIMITER}{}",
            at.format(TIMESTAMP_FORMAT)
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 业务键部分；业务键本身允许包含分隔符，因此按最后一个分隔符切分
    pub fn biz_id(&self) -> &str {
        self.0
            .rsplit_once(ID_DELIMITER)
            .map(|(biz, _)| biz)
            .unwrap_or(&self.0)
    }

    /// 时间戳部分（非本系统生成的 ID 返回 None）
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let (_, ts) = self.0.rsplit_once(ID_DELIMITER)?;
        NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
