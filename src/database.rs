//! Datastore abstraction used by the question-to-SQL pipeline
//!
//! The pipeline never talks to sqlx directly: schema introspection goes through
//! [`MetadataProvider`] and every per-request statement (dry-run, probe, execution)
//! goes through a request-scoped [`DatabaseClient`].
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Metadata error: {0}")]
    MetadataError(String),

    #[error("Statement rejected before execution: {0}")]
    Rejected(String),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Message text as reported by the datastore, without wrapper prefixes.
    pub fn datastore_message(&self) -> String {
        match self {
            DatabaseError::QueryError(msg)
            | DatabaseError::MetadataError(msg)
            | DatabaseError::ConnectionError(msg)
            | DatabaseError::Rejected(msg) => msg.clone(),
            DatabaseError::SqlxError(sqlx::Error::Database(db_err)) => db_err.message().to_string(),
            DatabaseError::SqlxError(e) => e.to_string(),
        }
    }
}

/// Column description returned by introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub default_value: Option<String>,
}

/// Table description returned by introspection
#[derive(Debug, Clone)]
pub struct TableDetails {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: Option<i64>,
}

/// Rows returned by a SELECT, rendered as strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The single cell of a one-row, one-column result (e.g. `COUNT(*)`).
    pub fn scalar(&self) -> Option<&str> {
        match (self.columns.len(), self.rows.as_slice()) {
            (1, [row]) => row.first().map(String::as_str),
            _ => None,
        }
    }
}

/// Read-only schema introspection
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// User tables and views, in catalog order
    async fn get_tables(&self) -> Result<Vec<String>, DatabaseError>;

    /// Columns of one table with declared type and primary-key flag
    async fn get_table_details(&self, table: &str) -> Result<TableDetails, DatabaseError>;

    /// Number of rows currently stored in `table`
    async fn get_row_count(&self, table: &str) -> Result<i64, DatabaseError>;
}

/// Request-scoped datastore session.
///
/// A session owns exactly one live connection for its lifetime and gives it back
/// when dropped, so the connection is released on every exit path.
#[async_trait]
pub trait DatabaseClient: Send {
    /// Execute a statement and return all rows
    async fn execute_query(&mut self, sql: &str) -> Result<QueryResult, DatabaseError>;

    /// Dry-run the statement through the datastore's EXPLAIN
    async fn explain(&mut self, sql: &str) -> Result<(), DatabaseError>;

    /// Run the statement fetching at most one row
    async fn probe(&mut self, sql: &str) -> Result<(), DatabaseError>;

    /// Release the connection early; dropping the session has the same effect
    async fn close(&mut self) -> Result<(), DatabaseError>;
}

/// Source of request-scoped sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn DatabaseClient>, DatabaseError>;
}
