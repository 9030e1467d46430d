//! Statement validation: read-only SELECT checks followed by a dry-run and probe

use crate::database::DatabaseClient;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

/// Keywords that may not appear anywhere in a generated statement
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "REPLACE", "ATTACH",
    "DETACH", "PRAGMA", "VACUUM", "REINDEX", "GRANT", "REVOKE",
];

static LIMIT_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\b").expect("limit regex"));

static ORDER_BY_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bORDER\s+BY\b").expect("order by regex"));

/// Outcome of validating one generation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub error: Option<String>,
    pub retried: bool,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error: None,
            retried: false,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error: Some(error.into()),
            retried: false,
        }
    }

    pub fn with_retried(mut self, retried: bool) -> Self {
        self.retried = retried;
        self
    }
}

/// First forbidden keyword found as a case-insensitive substring
pub fn forbidden_keyword(sql: &str) -> Option<&'static str> {
    let upper = sql.to_uppercase();
    FORBIDDEN_KEYWORDS.iter().copied().find(|kw| upper.contains(kw))
}

/// Static checks that need no datastore, in order:
/// SELECT prefix, forbidden keywords, single statement, LIMIT needs ORDER BY.
pub fn check_statement(sql: &str) -> Result<(), String> {
    let trimmed = sql.trim();

    if !trimmed.to_uppercase().starts_with("SELECT") {
        return Err("Only SELECT queries are allowed.".to_string());
    }

    if let Some(keyword) = forbidden_keyword(trimmed) {
        return Err(format!("Forbidden SQL keyword detected: {keyword}."));
    }

    if trimmed.contains(';') {
        return Err("Multiple statements are not allowed.".to_string());
    }

    if LIMIT_CLAUSE.is_match(trimmed) && !ORDER_BY_CLAUSE.is_match(trimmed) {
        return Err(
            "LIMIT requires an ORDER BY clause on a numeric or date column.".to_string(),
        );
    }

    Ok(())
}

/// Executor pre-flight: SELECT prefix, no forbidden keyword, a single statement
pub fn is_safe_select(sql: &str) -> bool {
    let trimmed = sql.trim();
    trimmed.to_uppercase().starts_with("SELECT")
        && forbidden_keyword(trimmed).is_none()
        && !trimmed.contains(';')
}

/// Run every check, ending with a dry-run and a one-row probe on `session`.
///
/// Datastore errors are reported verbatim. Never fails: every problem becomes
/// an invalid outcome.
pub async fn validate(sql: &str, session: &mut dyn DatabaseClient) -> ValidationOutcome {
    if let Err(reason) = check_statement(sql) {
        debug!("Static validation failed: {}", reason);
        return ValidationOutcome::invalid(reason);
    }

    let statement = sql.trim();
    if let Err(e) = session.explain(statement).await {
        debug!("EXPLAIN rejected statement: {}", e);
        return ValidationOutcome::invalid(e.datastore_message());
    }
    if let Err(e) = session.probe(statement).await {
        debug!("Probe rejected statement: {}", e);
        return ValidationOutcome::invalid(e.datastore_message());
    }

    ValidationOutcome::valid()
}
