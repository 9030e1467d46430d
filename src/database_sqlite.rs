//! SQLite implementation of the datastore layer
use crate::database::{
    ColumnInfo, DatabaseClient, DatabaseError, MetadataProvider, QueryResult, SessionFactory,
    TableDetails,
};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection settings for [`SqliteDatabase::open`]
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub read_only: bool,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            max_connections: 5, // SQLite doesn't need as many connections as network databases
            acquire_timeout_secs: 10,
        }
    }
}

/// Pooled SQLite database
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
    location: String,
}

impl SqliteDatabase {
    /// Open a database file (or a `sqlite:` URL)
    pub async fn open(path: &str, options: &SqliteOptions) -> Result<Self, DatabaseError> {
        debug!("[SqliteDatabase::open] Opening {}", path);

        let connect_options = if path.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(path)
                .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?
        } else {
            if !std::path::Path::new(path).exists() {
                return Err(DatabaseError::ConnectionError(format!(
                    "Database file not found: {path}"
                )));
            }
            SqliteConnectOptions::new().filename(path)
        };
        let connect_options =
            Self::apply_sqlite_optimizations(connect_options.read_only(options.read_only), options.read_only);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(options.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Ok(Self {
            pool,
            location: path.to_string(),
        })
    }

    /// Private in-memory database backed by a single connection that never idles out
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(Self::apply_sqlite_optimizations(connect_options, true))
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Ok(Self {
            pool,
            location: ":memory:".to_string(),
        })
    }

    fn apply_sqlite_optimizations(
        options: SqliteConnectOptions,
        read_only: bool,
    ) -> SqliteConnectOptions {
        let options = options
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if read_only {
            options
        } else {
            options.journal_mode(SqliteJournalMode::Wal)
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn metadata_provider(&self) -> SqliteMetadataProvider {
        SqliteMetadataProvider::new(self.pool.clone())
    }

    /// Acquire one connection for the duration of a request
    pub async fn session(&self) -> Result<SqliteSession, DatabaseError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("[SqliteSession] session {} acquired connection", id);
        Ok(SqliteSession {
            conn: Some(conn),
            id,
        })
    }

    /// Number of connections currently checked out of the pool
    pub fn connections_in_use(&self) -> usize {
        (self.pool.size() as usize).saturating_sub(self.pool.num_idle())
    }

    pub async fn close(&self) {
        debug!("[SqliteDatabase::close] Closing SQLite pool");
        self.pool.close().await;
    }
}

#[async_trait]
impl SessionFactory for SqliteDatabase {
    async fn open_session(&self) -> Result<Box<dyn DatabaseClient>, DatabaseError> {
        Ok(Box::new(self.session().await?))
    }
}

/// SQLite metadata provider implementation
pub struct SqliteMetadataProvider {
    pool: SqlitePool,
}

impl SqliteMetadataProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataProvider for SqliteMetadataProvider {
    async fn get_tables(&self) -> Result<Vec<String>, DatabaseError> {
        debug!("[SqliteMetadataProvider::get_tables] Starting query");

        // sqlite_master is scanned in creation order
        let rows = sqlx::query(
            r#"
            SELECT name AS table_name
            FROM sqlite_master
            WHERE type IN ('table', 'view')
              AND name NOT LIKE 'sqlite_%'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let tables: Vec<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("table_name"))
            .collect();

        debug!(
            "[SqliteMetadataProvider::get_tables] Found {} tables",
            tables.len()
        );
        Ok(tables)
    }

    async fn get_table_details(&self, table: &str) -> Result<TableDetails, DatabaseError> {
        debug!(
            "[SqliteMetadataProvider::get_table_details] Getting details for table: {}",
            table
        );

        let exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_none() {
            return Err(DatabaseError::MetadataError(format!(
                "Table '{table}' does not exist"
            )));
        }

        let quoted = quote_identifier(table);
        let rows = sqlx::query(&format!("PRAGMA table_info({quoted})"))
            .fetch_all(&self.pool)
            .await?;

        let columns = rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get::<String, _>("name"),
                data_type: row.get::<String, _>("type"),
                nullable: row.get::<i64, _>("notnull") == 0,
                is_primary_key: row.get::<i64, _>("pk") > 0,
                default_value: row
                    .try_get::<Option<String>, _>("dflt_value")
                    .unwrap_or(None),
            })
            .collect();

        // Row counts are informational only
        let row_count = self.get_row_count(table).await.ok();

        Ok(TableDetails {
            name: table.to_string(),
            columns,
            row_count,
        })
    }

    async fn get_row_count(&self, table: &str) -> Result<i64, DatabaseError> {
        let quoted = quote_identifier(table);
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {quoted}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// One pooled connection owned by a single request
pub struct SqliteSession {
    conn: Option<PoolConnection<Sqlite>>,
    id: u64,
}

impl SqliteSession {
    fn connection(&mut self) -> Result<&mut PoolConnection<Sqlite>, DatabaseError> {
        self.conn.as_mut().ok_or_else(|| {
            DatabaseError::ConnectionError(format!("session {} is already closed", self.id))
        })
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            debug!("[SqliteSession] session {} released connection", self.id);
        }
    }
}

#[async_trait]
impl DatabaseClient for SqliteSession {
    async fn execute_query(&mut self, sql: &str) -> Result<QueryResult, DatabaseError> {
        debug!("[SqliteSession::execute_query] Executing query");
        let conn = self.connection()?;

        let rows = sqlx::query(sql)
            .fetch_all(&mut **conn)
            .await
            .map_err(query_error)?;

        let columns: Vec<String> = match rows.first() {
            Some(first_row) => first_row
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            // No rows: ask the statement itself for its result columns
            None => match (&mut **conn).describe(sql).await {
                Ok(describe) => describe
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
                Err(e) => {
                    debug!("[SqliteSession::execute_query] describe failed: {}", e);
                    Vec::new()
                }
            },
        };

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut string_row = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                string_row.push(format_sqlite_value(row, i)?);
            }
            results.push(string_row);
        }

        debug!(
            "[SqliteSession::execute_query] Query completed with {} rows",
            results.len()
        );
        Ok(QueryResult {
            columns,
            rows: results,
        })
    }

    async fn explain(&mut self, sql: &str) -> Result<(), DatabaseError> {
        let conn = self.connection()?;
        sqlx::query(&format!("EXPLAIN {sql}"))
            .fetch_all(&mut **conn)
            .await
            .map(|_| ())
            .map_err(query_error)
    }

    async fn probe(&mut self, sql: &str) -> Result<(), DatabaseError> {
        let conn = self.connection()?;
        // Newlines keep a trailing line comment from swallowing the closing parenthesis
        let probe_sql = format!("SELECT * FROM (\n{sql}\n) LIMIT 1");
        sqlx::query(&probe_sql)
            .fetch_optional(&mut **conn)
            .await
            .map(|_| ())
            .map_err(query_error)
    }

    async fn close(&mut self) -> Result<(), DatabaseError> {
        if self.conn.take().is_some() {
            debug!("[SqliteSession::close] session {} released connection", self.id);
        }
        Ok(())
    }
}

fn query_error(e: sqlx::Error) -> DatabaseError {
    match e {
        sqlx::Error::Database(db_err) => DatabaseError::QueryError(db_err.message().to_string()),
        other => DatabaseError::SqlxError(other),
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Format a SQLite value to string representation
fn format_sqlite_value(row: &SqliteRow, column_index: usize) -> Result<String, DatabaseError> {
    use sqlx::ValueRef;

    if let Ok(value_ref) = row.try_get_raw(column_index) {
        if value_ref.is_null() {
            return Ok(String::new());
        }
    }

    // SQLite is dynamically typed: try the storage classes in order of likelihood
    if let Ok(val) = row.try_get::<i64, _>(column_index) {
        return Ok(val.to_string());
    }
    if let Ok(val) = row.try_get::<f64, _>(column_index) {
        return Ok(val.to_string());
    }
    if let Ok(val) = row.try_get::<String, _>(column_index) {
        return Ok(val);
    }
    if let Ok(val) = row.try_get::<Vec<u8>, _>(column_index) {
        return Ok(format!("\\x{}", hex::encode(val)));
    }

    Err(DatabaseError::QueryError(format!(
        "Unable to format value at column {column_index}"
    )))
}
