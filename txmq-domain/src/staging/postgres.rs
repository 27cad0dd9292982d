//! Postgres 版暂存仓储（PgStagingStore）
//!
//! 表结构见 `migrations/0001_staged_messages.sql`。条件更新依赖
//! `UPDATE ... WHERE id = $1 AND version = $2` 的行级原子性。
//!
use super::StagingStore;
use crate::error::{DomainError, DomainResult as Result};
use crate::message::{MessageId, MessageState, StagedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

pub struct PgStagingStore {
    pool: PgPool,
    table: String,
}

impl PgStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: "staged_messages".to_string(),
        }
    }

    /// 每个协调者可使用独立的表，避免扫描到其他协调者的记录。
    ///
    /// 表名会直接拼入 SQL，只接受 `[A-Za-z_][A-Za-z0-9_]*`，可带一级 schema 前缀。
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_valid_table_name(&table) {
            return Err(DomainError::invalid_value(format!(
                "invalid staging table name: {table:?}"
            )));
        }
        Ok(Self { pool, table })
    }

    async fn current_version(&self, id: &MessageId) -> Result<Option<u64>> {
        let sql = format!("SELECT version FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.try_get::<i64, _>("version").map(|v| v as u64))
            .transpose()
            .map_err(DomainError::from)
    }

    async fn explain_miss(&self, id: &MessageId, expected_version: u64) -> DomainError {
        match self.current_version(id).await {
            Ok(Some(actual)) => DomainError::VersionConflict {
                id: id.clone(),
                expected: expected_version,
                actual,
            },
            Ok(None) => DomainError::not_found(id),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn insert(&self, message: &StagedMessage) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, state, version, ready_at, record) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING",
            self.table
        );
        let done = sqlx::query(&sql)
            .bind(message.id().as_str())
            .bind(message.state().as_str())
            .bind(message.version() as i64)
            .bind(message.ready_at())
            .bind(serde_json::to_string(message)?)
            .execute(&self.pool)
            .await?;

        if done.rows_affected() == 0 {
            return Err(DomainError::DuplicateId {
                id: message.id().clone(),
            });
        }
        Ok(())
    }

    async fn load(&self, id: &MessageId) -> Result<Option<StagedMessage>> {
        let sql = format!("SELECT record FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("record")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        message: &StagedMessage,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET state = $3, version = $4, ready_at = $5, record = $6 \
             WHERE id = $1 AND version = $2",
            self.table
        );
        let done = sqlx::query(&sql)
            .bind(message.id().as_str())
            .bind(expected_version as i64)
            .bind(message.state().as_str())
            .bind(message.version() as i64)
            .bind(message.ready_at())
            .bind(serde_json::to_string(message)?)
            .execute(&self.pool)
            .await?;

        if done.rows_affected() == 0 {
            return Err(self.explain_miss(message.id(), expected_version).await);
        }
        Ok(())
    }

    async fn remove(&self, id: &MessageId, expected_version: u64) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1 AND version = $2", self.table);
        let done = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?;

        if done.rows_affected() == 0 {
            return Err(self.explain_miss(id, expected_version).await);
        }
        Ok(())
    }

    async fn scan(
        &self,
        state: MessageState,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<StagedMessage>> {
        let sql = format!(
            "SELECT record FROM {} WHERE state = $1 AND ($2::TEXT IS NULL OR id > $2) \
             ORDER BY id LIMIT $3",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(after.map(|id| id.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        decode_rows(rows)
    }

    async fn scan_stale(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<StagedMessage>> {
        let sql = format!(
            "SELECT record FROM {} WHERE state = $1 AND ready_at < $2 \
             AND ($3::TEXT IS NULL OR id > $3) ORDER BY id LIMIT $4",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(MessageState::Ready.as_str())
            .bind(cutoff)
            .bind(after.map(|id| id.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        decode_rows(rows)
    }
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<StagedMessage>> {
    rows.into_iter()
        .map(|row| -> Result<StagedMessage> {
            let raw: String = row.try_get("record")?;
            Ok(serde_json::from_str(&raw)?)
        })
        .collect()
}

fn is_valid_table_name(table: &str) -> bool {
    let ident = |part: &str| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    match table.split_once('.') {
        Some((schema, name)) => ident(schema) && ident(name),
        None => ident(table),
    }
}
