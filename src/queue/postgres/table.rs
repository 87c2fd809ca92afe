//! Physical table backing one logical polling queue.
//!
//! Table structure (`"q_<name>"`):
//! - `queueid` - claim anchor, assigned at insert
//! - `dt_scheduled` - visibility threshold, `NULL` for immediate
//! - `locked` - claim flag
//! - `attempts` - redelivery counter
//! - `reply_to`, `correlation_id` - RPC metadata
//! - `message` - JSON payload

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;
use crate::queue::Envelope;

const TABLE_PREFIX: &str = "q_";
const STATUS_INDEX_PREFIX: &str = "qs_";
const CORRELATION_INDEX_PREFIX: &str = "qc_";

/// SQLSTATE `undefined_table`.
const UNDEFINED_TABLE: &str = "42P01";

/// Quote an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Whether `err` reports a missing table.
pub(crate) fn is_undefined_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNDEFINED_TABLE),
        _ => false,
    }
}

/// Row returned by a successful claim.
type ClaimedRow = (i64, String, i32, Option<String>, Option<String>);

/// SQL for one queue table. Names are validated by the caller.
#[derive(Debug, Clone)]
pub(crate) struct QueueTable {
    table: String,
    status_index: String,
    correlation_index: String,
}

impl QueueTable {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            table: quote_ident(&format!("{}{}", TABLE_PREFIX, name)),
            status_index: quote_ident(&format!("{}{}", STATUS_INDEX_PREFIX, name)),
            correlation_index: quote_ident(&format!("{}{}", CORRELATION_INDEX_PREFIX, name)),
        }
    }

    /// Quoted table identifier.
    pub(crate) fn ident(&self) -> &str {
        &self.table
    }

    fn create_table_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                queueid BIGSERIAL PRIMARY KEY,
                dt_created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                dt_scheduled TIMESTAMPTZ NULL,
                reply_to VARCHAR(255) NULL,
                message TEXT NOT NULL,
                locked BOOLEAN NOT NULL DEFAULT FALSE,
                attempts INTEGER NOT NULL DEFAULT 0,
                correlation_id VARCHAR(255) NULL
            )
            "#,
            self.table
        )
    }

    fn create_status_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (locked, dt_scheduled)",
            self.status_index, self.table
        )
    }

    fn create_correlation_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (correlation_id, locked)",
            self.correlation_index, self.table
        )
    }

    fn claim_sql(&self, by_correlation: bool) -> String {
        let correlation_filter = if by_correlation {
            " AND correlation_id = $1"
        } else {
            ""
        };
        format!(
            r#"
            UPDATE {table} SET locked = TRUE
            WHERE queueid = (
                SELECT queueid FROM {table}
                WHERE locked = FALSE
                  AND (dt_scheduled IS NULL OR dt_scheduled < NOW()){correlation_filter}
                ORDER BY queueid
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ) AND locked = FALSE
            RETURNING queueid, message, attempts, reply_to, correlation_id
            "#,
            table = self.table,
            correlation_filter = correlation_filter,
        )
    }

    fn ready_count_sql(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {} WHERE locked = FALSE AND (dt_scheduled IS NULL OR dt_scheduled < NOW())",
            self.table
        )
    }

    fn total_count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {} WHERE locked = FALSE", self.table)
    }

    /// Create the table and its indexes if missing.
    pub(crate) async fn create(&self, pool: &PgPool, with_correlation_index: bool) -> Result<()> {
        sqlx::query(&self.create_table_sql()).execute(pool).await?;
        sqlx::query(&self.create_status_index_sql())
            .execute(pool)
            .await?;
        if with_correlation_index {
            sqlx::query(&self.create_correlation_index_sql())
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    /// Insert one row; returns its `queueid`.
    pub(crate) async fn insert(
        &self,
        pool: &PgPool,
        envelope: &Envelope,
        correlation_id: Option<&str>,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let message = serde_json::to_string(envelope.payload())?;

        let queueid = sqlx::query_scalar::<_, i64>(&format!(
            r#"
            INSERT INTO {} (dt_scheduled, reply_to, message, correlation_id)
            VALUES ($1, $2, $3, $4)
            RETURNING queueid
            "#,
            self.table
        ))
        .bind(visible_at)
        .bind(envelope.reply_to())
        .bind(message)
        .bind(correlation_id)
        .fetch_one(pool)
        .await?;
        Ok(queueid)
    }

    /// Atomically lock the oldest visible row and return it as an envelope.
    ///
    /// With `correlation_id` set only rows carrying that id qualify. A
    /// missing table yields `None`.
    pub(crate) async fn claim(
        &self,
        pool: &PgPool,
        correlation_id: Option<&str>,
    ) -> Result<Option<Envelope>> {
        let sql = self.claim_sql(correlation_id.is_some());
        let mut query = sqlx::query_as::<_, ClaimedRow>(&sql);
        if let Some(correlation_id) = correlation_id {
            query = query.bind(correlation_id);
        }

        let row = match query.fetch_optional(pool).await {
            Ok(row) => row,
            Err(e) if is_undefined_table(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some((queueid, message, attempts, reply_to, correlation_id)) = row else {
            return Ok(None);
        };

        let payload: serde_json::Value = serde_json::from_str(&message)?;
        Ok(Some(
            Envelope::new(payload)
                .with_id(queueid as u64)
                .with_attempts(attempts.max(0) as u32)
                .with_reply_to(reply_to)
                .with_correlation_id(correlation_id),
        ))
    }

    /// Delete a row; returns whether it existed.
    pub(crate) async fn delete(&self, pool: &PgPool, queueid: u64) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE queueid = $1", self.table))
            .bind(queueid as i64)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unlock a row and record one more attempt.
    pub(crate) async fn release(&self, pool: &PgPool, queueid: u64) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET locked = FALSE, attempts = attempts + 1 WHERE queueid = $1",
            self.table
        ))
        .bind(queueid as i64)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn count_ready(&self, pool: &PgPool) -> Result<u64> {
        self.count(pool, &self.ready_count_sql()).await
    }

    pub(crate) async fn count_total(&self, pool: &PgPool) -> Result<u64> {
        self.count(pool, &self.total_count_sql()).await
    }

    async fn count(&self, pool: &PgPool, sql: &str) -> Result<u64> {
        match sqlx::query_scalar::<_, i64>(sql).fetch_one(pool).await {
            Ok(count) => Ok(count.max(0) as u64),
            Err(e) if is_undefined_table(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn truncate(&self, pool: &PgPool) -> Result<()> {
        match sqlx::query(&format!("TRUNCATE TABLE {}", self.table))
            .execute(pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_undefined_table(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("q_jobs"), "\"q_jobs\"");
        assert_eq!(quote_ident("q_we\"ird"), "\"q_we\"\"ird\"");
    }

    #[test]
    fn test_identifiers() {
        let table = QueueTable::new("jobs");
        assert_eq!(table.ident(), "\"q_jobs\"");
        assert!(table
            .create_status_index_sql()
            .starts_with("CREATE INDEX IF NOT EXISTS \"qs_jobs\" ON \"q_jobs\""));
        assert!(table
            .create_correlation_index_sql()
            .contains("\"qc_jobs\" ON \"q_jobs\" (correlation_id, locked)"));
    }

    #[test]
    fn test_claim_sql_filters() {
        let table = QueueTable::new("jobs");

        let any = table.claim_sql(false);
        assert!(any.contains("FOR UPDATE SKIP LOCKED"));
        assert!(any.contains("AND locked = FALSE"));
        assert!(!any.contains("$1"));

        let scoped = table.claim_sql(true);
        assert!(scoped.contains("correlation_id = $1"));
    }

    #[test]
    fn test_count_sql() {
        let table = QueueTable::new("jobs");
        assert!(table.ready_count_sql().contains("dt_scheduled < NOW()"));
        assert!(!table.total_count_sql().contains("dt_scheduled"));
    }

    #[test]
    fn test_non_database_error_is_not_undefined_table() {
        assert!(!is_undefined_table(&sqlx::Error::RowNotFound));
    }
}
