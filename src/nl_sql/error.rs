//! Error types for the question-to-SQL pipeline

use thiserror::Error;

/// Result type for pipeline operations
pub type NlSqlResult<T> = Result<T, NlSqlError>;

/// Errors that can occur inside the pipeline
#[derive(Error, Debug)]
pub enum NlSqlError {
    #[error("LLM provider error: {0}")]
    ProviderError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error: {status_code} - {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Timeout error: operation took longer than {timeout_secs}s")]
    TimeoutError { timeout_secs: u64 },

    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    #[error("No compatible entity recognition model: {0}")]
    ModelUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] crate::database::DatabaseError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl NlSqlError {
    /// Check if the error is transient
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NlSqlError::NetworkError(_) | NlSqlError::TimeoutError { .. }
        )
    }

    /// Map a reqwest failure, keeping timeouts distinguishable
    pub fn from_request(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            NlSqlError::TimeoutError { timeout_secs }
        } else if err.is_connect() {
            NlSqlError::NetworkError(format!("Connection failed: {err}"))
        } else {
            NlSqlError::NetworkError(format!("Request failed: {err}"))
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            NlSqlError::ConfigurationError(msg) => {
                format!("Configuration issue: {msg}. Check your config file or environment variables.")
            }
            NlSqlError::SchemaError(msg) => {
                format!("Schema introspection failed: {msg}. Ensure the database file is reachable.")
            }
            NlSqlError::NetworkError(msg) => {
                format!("Network error: {msg}. Check that the LLM endpoint is reachable.")
            }
            NlSqlError::ApiError {
                status_code,
                message,
            } => format!("API error ({status_code}): {message}"),
            NlSqlError::TimeoutError { timeout_secs } => {
                format!("Request timed out after {timeout_secs} seconds. Increase timeout_seconds in config.")
            }
            NlSqlError::ModelUnavailable(msg) => format!(
                "Entity extraction is unavailable: {msg}. Configure an NER backend or set entities.backend = \"disabled\"."
            ),
            _ => self.to_string(),
        }
    }
}
