//! Response envelope and statement classification

use crate::database::QueryResult;
use crate::nl_sql::allowlist::{SecurityDecision, SecurityInfo};
use crate::nl_sql::client::TokenUsage;
use crate::nl_sql::config::LlmMode;
use crate::nl_sql::generator::SqlSource;
use crate::nl_sql::retriever::RetrievalMode;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

/// Rows copied into `meta.results.sample_rows`
const SAMPLE_ROWS: usize = 3;

static JOIN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bJOIN\b").expect("join regex"));
static GROUP_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bGROUP\s+BY\b").expect("group by regex"));
static ORDER_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bORDER\s+BY\b").expect("order by regex"));
static HAVING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bHAVING\b").expect("having regex"));
static WHERE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bWHERE\b").expect("where regex"));
static COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bCOUNT\s*\(").expect("count regex"));
static SELECT_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SELECT\s+COUNT\b").expect("select count regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    CountQuery,
    GroupByQuery,
    OrderedQuery,
    JoinQuery,
    SelectQuery,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlSafety {
    Passed,
    Failed,
    BlockedDataModification,
}

pub fn classify_query(sql: &str) -> QueryType {
    let upper = sql.trim().to_uppercase();
    if SELECT_COUNT.is_match(&upper) {
        QueryType::CountQuery
    } else if GROUP_BY.is_match(&upper) {
        QueryType::GroupByQuery
    } else if ORDER_BY.is_match(&upper) {
        QueryType::OrderedQuery
    } else if JOIN.is_match(&upper) {
        QueryType::JoinQuery
    } else if upper.starts_with("SELECT") {
        QueryType::SelectQuery
    } else {
        QueryType::Other
    }
}

/// Weighted clause count
pub fn complexity_score(sql: &str) -> u32 {
    let upper = sql.to_uppercase();
    let mut score = 0;
    if JOIN.is_match(&upper) {
        score += 2;
    }
    for clause in [&*GROUP_BY, &*ORDER_BY, &*HAVING, &*WHERE, &*COUNT] {
        if clause.is_match(&upper) {
            score += 1;
        }
    }
    score
}

pub fn complexity(sql: &str) -> Complexity {
    match complexity_score(sql) {
        0..=1 => Complexity::Simple,
        2..=3 => Complexity::Medium,
        _ => Complexity::Complex,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMeta {
    pub is_valid: bool,
    pub error: Option<String>,
    pub retried: bool,
    pub sql_safety: SqlSafety,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub tables_used: Vec<String>,
    pub query_type: QueryType,
    pub complexity: Complexity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounters {
    pub generation_prompt: u32,
    pub generation_completion: u32,
    pub summary_prompt: u32,
    pub summary_completion: u32,
}

impl TokenCounters {
    pub fn add_generation(&mut self, usage: TokenUsage) {
        self.generation_prompt += usage.prompt_tokens;
        self.generation_completion += usage.completion_tokens;
    }

    pub fn add_summary(&mut self, usage: TokenUsage) {
        self.summary_prompt += usage.prompt_tokens;
        self.summary_completion += usage.completion_tokens;
    }

    pub fn total(&self) -> u32 {
        self.generation_prompt + self.generation_completion + self.summary_prompt + self.summary_completion
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMeta {
    pub rows_returned: usize,
    pub columns_returned: usize,
    pub execution_ms: u64,
    pub tokens: TokenCounters,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityMeta {
    pub allowed_tables: Vec<String>,
    pub blocked_operations: Vec<String>,
    pub data_modification_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<SecurityDecision>,
}

impl From<SecurityInfo> for SecurityMeta {
    fn from(info: SecurityInfo) -> Self {
        Self {
            allowed_tables: info.allowed_tables,
            blocked_operations: info.blocked_operations,
            data_modification_blocked: false,
            decision: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMeta {
    pub selected_mode: LlmMode,
    /// `openai`, `local`, or `fallback`
    pub effective_mode: String,
    pub model_used: Option<String>,
    pub sql_source: Option<SqlSource>,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalMeta {
    pub mode: RetrievalMode,
    /// Snippets handed to generation, as `table.column`
    pub snippets: Vec<String>,
    pub entities: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsMeta {
    pub columns: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
}

impl ResultsMeta {
    pub fn from_result(result: &QueryResult) -> Self {
        Self {
            columns: result.columns.clone(),
            sample_rows: result.rows.iter().take(SAMPLE_ROWS).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub validation: ValidationMeta,
    pub database: DatabaseMeta,
    pub performance: PerformanceMeta,
    pub security: SecurityMeta,
    pub llm: LlmMeta,
    pub retrieval: Option<RetrievalMeta>,
    pub results: ResultsMeta,
    pub language: String,
    /// Question as it was sent onwards, after masking
    pub question: String,
    pub trace_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Envelope returned for every question, successful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub sql: Option<String>,
    pub answer: String,
    pub meta: ResponseMeta,
    pub success: bool,
    pub error: Option<String>,
    /// Full result rows; not part of the serialized envelope
    #[serde(skip)]
    pub result: Option<QueryResult>,
}

impl QueryResponse {
    pub fn total_tokens(&self) -> u32 {
        self.meta.performance.total_tokens
    }

    pub fn execution_ms(&self) -> u64 {
        self.meta.performance.execution_ms
    }

    pub fn rows_returned(&self) -> usize {
        self.meta.performance.rows_returned
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl ResponseMeta {
    /// Metadata with every block at its empty value
    pub fn new(selected_mode: LlmMode, language: &str, security: SecurityMeta) -> Self {
        Self {
            validation: ValidationMeta {
                is_valid: false,
                error: None,
                retried: false,
                sql_safety: SqlSafety::Failed,
            },
            database: DatabaseMeta {
                tables_used: Vec::new(),
                query_type: QueryType::Other,
                complexity: Complexity::Simple,
            },
            performance: PerformanceMeta::default(),
            security,
            llm: LlmMeta {
                selected_mode,
                effective_mode: "none".to_string(),
                model_used: None,
                sql_source: None,
                cached: false,
            },
            retrieval: None,
            results: ResultsMeta::default(),
            language: language.to_string(),
            question: String::new(),
            trace_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    pub fn describe_sql(&mut self, sql: &str, tables_used: Vec<String>) {
        self.database = DatabaseMeta {
            tables_used,
            query_type: classify_query(sql),
            complexity: complexity(sql),
        };
    }

    pub fn set_tokens(&mut self, tokens: TokenCounters) {
        self.performance.tokens = tokens;
        self.performance.total_tokens = tokens.total();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("SELECT COUNT(*) FROM json_patients", QueryType::CountQuery)]
    #[case("select count(*) from json_patients group by gender", QueryType::CountQuery)]
    #[case("SELECT gender, COUNT(*) FROM json_patients GROUP BY gender", QueryType::GroupByQuery)]
    #[case("SELECT * FROM json_admissions ORDER BY admittime", QueryType::OrderedQuery)]
    #[case(
        "SELECT p.gender FROM json_patients p JOIN json_admissions a ON p.subject_id = a.subject_id",
        QueryType::JoinQuery
    )]
    #[case("SELECT * FROM json_providers", QueryType::SelectQuery)]
    #[case("PRAGMA table_info(x)", QueryType::Other)]
    fn test_classify_query(#[case] sql: &str, #[case] expected: QueryType) {
        assert_eq!(classify_query(sql), expected);
    }

    #[rstest]
    #[case("SELECT * FROM json_patients", 0, Complexity::Simple)]
    #[case("SELECT COUNT(*) FROM json_patients", 1, Complexity::Simple)]
    #[case("SELECT COUNT(*) FROM json_patients WHERE gender = 'F'", 2, Complexity::Medium)]
    #[case(
        "SELECT a.subject_id FROM json_admissions a JOIN json_patients p ON a.subject_id = p.subject_id WHERE p.gender = 'F'",
        3,
        Complexity::Medium
    )]
    #[case(
        "SELECT subject_id, COUNT(*) FROM json_admissions a JOIN json_patients p USING (subject_id) GROUP BY subject_id HAVING COUNT(*) > 1 ORDER BY 2 DESC",
        6,
        Complexity::Complex
    )]
    fn test_complexity(#[case] sql: &str, #[case] score: u32, #[case] expected: Complexity) {
        assert_eq!(complexity_score(sql), score);
        assert_eq!(complexity(sql), expected);
    }

    #[test]
    fn test_token_counters_total() {
        let mut tokens = TokenCounters::default();
        tokens.add_generation(TokenUsage::new(100, 20));
        tokens.add_generation(TokenUsage::new(110, 25));
        tokens.add_summary(TokenUsage::new(50, 30));
        assert_eq!(tokens.generation_prompt, 210);
        assert_eq!(tokens.total(), 335);
    }

    #[test]
    fn test_envelope_serializes_expected_shape() {
        let mut meta = ResponseMeta::new(LlmMode::Auto, "en", SecurityMeta::default());
        meta.describe_sql("SELECT COUNT(*) FROM json_patients", vec!["json_patients".into()]);
        meta.set_tokens(TokenCounters {
            generation_prompt: 10,
            generation_completion: 5,
            ..TokenCounters::default()
        });
        let response = QueryResponse {
            sql: Some("SELECT COUNT(*) FROM json_patients".into()),
            answer: "There are 5 patients.".into(),
            meta,
            success: true,
            error: None,
            result: None,
        };

        let value: serde_json::Value = serde_json::from_str(&response.to_json_pretty().unwrap()).unwrap();
        assert_eq!(value["meta"]["database"]["query_type"], "COUNT_QUERY");
        assert_eq!(value["meta"]["database"]["complexity"], "SIMPLE");
        assert_eq!(value["meta"]["validation"]["sql_safety"], "FAILED");
        assert_eq!(value["meta"]["performance"]["total_tokens"], 15);
        assert_eq!(value["meta"]["llm"]["selected_mode"], "auto");
        assert!(value["meta"]["trace_id"].as_str().unwrap().len() == 36);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_results_meta_samples_three_rows() {
        let result = QueryResult {
            columns: vec!["n".into()],
            rows: (0..5).map(|i| vec![i.to_string()]).collect(),
        };
        let meta = ResultsMeta::from_result(&result);
        assert_eq!(meta.sample_rows.len(), 3);
        assert_eq!(meta.columns, vec!["n".to_string()]);
    }
}
