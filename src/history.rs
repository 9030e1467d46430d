//! Persistent query history
//!
//! Every answered question is stored as one row in a SQLite table, together
//! with the serialized response metadata, so past runs can be listed, summarized
//! and exported.

use crate::nl_sql::QueryResponse;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("History serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("History export error: {0}")]
    Csv(#[from] csv::Error),

    #[error("History IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS query_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id TEXT NOT NULL,
        question TEXT NOT NULL,
        sql TEXT,
        answer TEXT NOT NULL,
        success INTEGER NOT NULL,
        execution_time_ms INTEGER NOT NULL DEFAULT 0,
        rows_returned INTEGER NOT NULL DEFAULT 0,
        user_id TEXT,
        timestamp TEXT NOT NULL,
        llm_mode TEXT NOT NULL,
        tokens_used INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        metadata TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_query_history_trace_id ON query_history(trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_query_history_user_id ON query_history(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_query_history_timestamp ON query_history(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_query_history_success ON query_history(success)",
];

/// One stored question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub trace_id: String,
    pub question: String,
    pub sql: Option<String>,
    pub answer: String,
    pub success: bool,
    pub execution_time_ms: i64,
    pub rows_returned: i64,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub llm_mode: String,
    pub tokens_used: i64,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct HistoryFilter {
    pub user_id: Option<String>,
    pub success_only: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            success_only: None,
            since: None,
            until: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total_queries: i64,
    pub successful_queries: i64,
    pub success_rate: f64,
    pub avg_execution_time_ms: f64,
    pub total_tokens: i64,
    pub llm_modes: BTreeMap<String, i64>,
    /// Query count per calendar day (`YYYY-MM-DD`)
    pub daily: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

pub struct QueryHistory {
    pool: SqlitePool,
}

impl QueryHistory {
    /// Open (and create when missing) the history database at `path`
    pub async fn open(path: impl AsRef<Path>) -> HistoryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        info!("Query history at {}", path.display());
        Self::with_pool(pool).await
    }

    pub async fn in_memory() -> HistoryResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> HistoryResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Store one response; `question` should be the sanitized text
    pub async fn save(
        &self,
        response: &QueryResponse,
        question: &str,
        user_id: Option<&str>,
    ) -> HistoryResult<i64> {
        let metadata = serde_json::to_string(&response.meta)?;
        let result = sqlx::query(
            "INSERT INTO query_history
                (trace_id, question, sql, answer, success, execution_time_ms, rows_returned,
                 user_id, timestamp, llm_mode, tokens_used, error, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(response.meta.trace_id.to_string())
        .bind(question)
        .bind(response.sql.as_deref())
        .bind(&response.answer)
        .bind(response.success)
        .bind(i64::try_from(response.execution_ms()).unwrap_or(i64::MAX))
        .bind(i64::try_from(response.rows_returned()).unwrap_or(i64::MAX))
        .bind(user_id)
        .bind(response.meta.timestamp.to_rfc3339())
        .bind(&response.meta.llm.effective_mode)
        .bind(i64::from(response.total_tokens()))
        .bind(response.error.as_deref())
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Saved query {} to history", id);
        Ok(id)
    }

    /// Newest first
    pub async fn list(&self, filter: &HistoryFilter) -> HistoryResult<Vec<HistoryEntry>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM query_history WHERE 1 = 1");
        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(success) = filter.success_only {
            builder.push(" AND success = ").push_bind(success);
        }
        if let Some(since) = filter.since {
            builder.push(" AND timestamp >= ").push_bind(since.to_rfc3339());
        }
        if let Some(until) = filter.until {
            builder.push(" AND timestamp <= ").push_bind(until.to_rfc3339());
        }
        builder
            .push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn get(&self, id: i64) -> HistoryResult<Option<HistoryEntry>> {
        let row = sqlx::query("SELECT * FROM query_history WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Aggregates over the last `days` days
    pub async fn stats(&self, user_id: Option<&str>, days: i64) -> HistoryResult<HistoryStats> {
        let since = (Utc::now() - Duration::days(days)).to_rfc3339();

        let totals = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(success), 0) AS successful,
                    AVG(CASE WHEN success = 1 THEN execution_time_ms END) AS avg_ms,
                    COALESCE(SUM(tokens_used), 0) AS tokens
             FROM query_history
             WHERE timestamp >= ? AND (? IS NULL OR user_id = ?)",
        )
        .bind(&since)
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = totals.try_get("total")?;
        let successful: i64 = totals.try_get("successful")?;
        let avg_ms: Option<f64> = totals.try_get("avg_ms")?;

        let modes = sqlx::query(
            "SELECT llm_mode, COUNT(*) AS n FROM query_history
             WHERE timestamp >= ? AND (? IS NULL OR user_id = ?)
             GROUP BY llm_mode",
        )
        .bind(&since)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let daily = sqlx::query(
            "SELECT substr(timestamp, 1, 10) AS day, COUNT(*) AS n FROM query_history
             WHERE timestamp >= ? AND (? IS NULL OR user_id = ?)
             GROUP BY day ORDER BY day",
        )
        .bind(&since)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(HistoryStats {
            total_queries: total,
            successful_queries: successful,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 * 100.0 / total as f64
            },
            avg_execution_time_ms: avg_ms.unwrap_or(0.0),
            total_tokens: totals.try_get("tokens")?,
            llm_modes: count_map(&modes, "llm_mode")?,
            daily: count_map(&daily, "day")?,
        })
    }

    pub async fn delete(&self, id: i64) -> HistoryResult<bool> {
        let result = sqlx::query("DELETE FROM query_history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove entries, optionally only one user's or only those older than `older_than_days`
    pub async fn clear(&self, user_id: Option<&str>, older_than_days: Option<i64>) -> HistoryResult<u64> {
        let cutoff = older_than_days.map(|days| (Utc::now() - Duration::days(days)).to_rfc3339());
        let result = sqlx::query(
            "DELETE FROM query_history
             WHERE (? IS NULL OR user_id = ?) AND (? IS NULL OR timestamp < ?)",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(cutoff.as_deref())
        .bind(cutoff.as_deref())
        .execute(&self.pool)
        .await?;
        info!("Cleared {} history entries", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Every entry matching `filter`, rendered as JSON or CSV
    pub async fn export(&self, format: ExportFormat, filter: &HistoryFilter) -> HistoryResult<String> {
        let entries = self.list(filter).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)?),
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                writer.write_record([
                    "id",
                    "trace_id",
                    "timestamp",
                    "user_id",
                    "question",
                    "sql",
                    "answer",
                    "success",
                    "execution_time_ms",
                    "rows_returned",
                    "llm_mode",
                    "tokens_used",
                    "error",
                ])?;
                for e in &entries {
                    writer.write_record([
                        e.id.to_string(),
                        e.trace_id.clone(),
                        e.timestamp.to_rfc3339(),
                        e.user_id.clone().unwrap_or_default(),
                        e.question.clone(),
                        e.sql.clone().unwrap_or_default(),
                        e.answer.clone(),
                        e.success.to_string(),
                        e.execution_time_ms.to_string(),
                        e.rows_returned.to_string(),
                        e.llm_mode.clone(),
                        e.tokens_used.to_string(),
                        e.error.clone().unwrap_or_default(),
                    ])?;
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| HistoryError::Io(e.into_error()))?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn entry_from_row(row: &SqliteRow) -> HistoryResult<HistoryEntry> {
    let timestamp: String = row.try_get("timestamp")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(HistoryEntry {
        id: row.try_get("id")?,
        trace_id: row.try_get("trace_id")?,
        question: row.try_get("question")?,
        sql: row.try_get("sql")?,
        answer: row.try_get("answer")?,
        success: row.try_get("success")?,
        execution_time_ms: row.try_get("execution_time_ms")?,
        rows_returned: row.try_get("rows_returned")?,
        user_id: row.try_get("user_id")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| HistoryError::Database(sqlx::Error::Decode(Box::new(e))))?,
        llm_mode: row.try_get("llm_mode")?,
        tokens_used: row.try_get("tokens_used")?,
        error: row.try_get("error")?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn count_map(rows: &[SqliteRow], key: &str) -> HistoryResult<BTreeMap<String, i64>> {
    rows.iter()
        .map(|row| Ok((row.try_get::<String, _>(key)?, row.try_get::<i64, _>("n")?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nl_sql::config::LlmMode;
    use crate::nl_sql::response::{ResponseMeta, SecurityMeta, TokenCounters};
    use tempfile::TempDir;

    fn response(success: bool, mode: &str, ms: u64, tokens: u32) -> QueryResponse {
        let mut meta = ResponseMeta::new(LlmMode::Auto, "en", SecurityMeta::default());
        meta.llm.effective_mode = mode.to_string();
        meta.performance.execution_ms = ms;
        meta.performance.rows_returned = 1;
        meta.set_tokens(TokenCounters {
            generation_prompt: tokens,
            ..TokenCounters::default()
        });
        QueryResponse {
            sql: Some("SELECT COUNT(*) FROM json_patients".into()),
            answer: "There are 5 patients.".into(),
            meta,
            success,
            error: (!success).then(|| "no such table: x".to_string()),
            result: None,
        }
    }

    #[tokio::test]
    async fn test_save_get_and_list() {
        let history = QueryHistory::in_memory().await.unwrap();
        let first = history
            .save(&response(true, "openai", 12, 50), "How many patients?", Some("alice"))
            .await
            .unwrap();
        let second = history
            .save(&response(false, "fallback", 0, 0), "Show x", None)
            .await
            .unwrap();

        let entry = history.get(first).await.unwrap().unwrap();
        assert_eq!(entry.question, "How many patients?");
        assert!(entry.success);
        assert_eq!(entry.tokens_used, 50);
        assert_eq!(entry.metadata["llm"]["effective_mode"], "openai");

        let all = history.list(&HistoryFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second, first]);

        let failed = history
            .list(&HistoryFilter {
                success_only: Some(false),
                ..HistoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("no such table: x"));

        let alice = history
            .list(&HistoryFilter {
                user_id: Some("alice".into()),
                ..HistoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert!(history.get(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let history = QueryHistory::in_memory().await.unwrap();
        history.save(&response(true, "openai", 10, 40), "a", None).await.unwrap();
        history.save(&response(true, "local", 30, 60), "b", None).await.unwrap();
        history.save(&response(false, "fallback", 500, 0), "c", None).await.unwrap();

        let stats = history.stats(None, 30).await.unwrap();
        assert_eq!(stats.total_queries, 3);
        assert_eq!(stats.successful_queries, 2);
        assert!((stats.success_rate - 66.666).abs() < 0.01);
        assert_eq!(stats.avg_execution_time_ms, 20.0);
        assert_eq!(stats.total_tokens, 100);
        assert_eq!(stats.llm_modes.get("fallback"), Some(&1));
        assert_eq!(stats.daily.values().sum::<i64>(), 3);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let history = QueryHistory::in_memory().await.unwrap();
        let id = history.save(&response(true, "openai", 1, 1), "a", Some("bob")).await.unwrap();
        history.save(&response(true, "openai", 1, 1), "b", Some("carol")).await.unwrap();
        history.save(&response(true, "openai", 1, 1), "c", Some("carol")).await.unwrap();

        assert!(history.delete(id).await.unwrap());
        assert!(!history.delete(id).await.unwrap());

        assert_eq!(history.clear(None, Some(1)).await.unwrap(), 0);
        assert_eq!(history.clear(Some("carol"), None).await.unwrap(), 2);
        assert!(history.list(&HistoryFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_formats() {
        let history = QueryHistory::in_memory().await.unwrap();
        history
            .save(&response(true, "openai", 5, 10), "Patients, by gender", None)
            .await
            .unwrap();

        let csv = history
            .export(ExportFormat::Csv, &HistoryFilter::default())
            .await
            .unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,trace_id,timestamp"));
        assert!(lines.next().unwrap().contains("\"Patients, by gender\""));

        let json = history
            .export(ExportFormat::Json, &HistoryFilter::default())
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["question"], "Patients, by gender");
    }

    #[tokio::test]
    async fn test_file_backed_history_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history.db");

        let history = QueryHistory::open(&path).await.unwrap();
        history.save(&response(true, "local", 3, 0), "a", None).await.unwrap();
        history.close().await;

        let reopened = QueryHistory::open(&path).await.unwrap();
        assert_eq!(reopened.list(&HistoryFilter::default()).await.unwrap().len(), 1);
    }
}
