//! SQL generation with model output cleanup and a heuristic fallback

use crate::nl_sql::cache::{CachedSql, QueryCache};
use crate::nl_sql::client::{ChatMessage, CompletionProvider, TokenUsage};
use crate::nl_sql::config::LlmMode;
use crate::nl_sql::error::{NlSqlError, NlSqlResult};
use crate::nl_sql::prompt::{GenerationConstraints, PromptGenerator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SqlSource {
    Model,
    Fallback,
}

/// One generation attempt; a retry produces a new value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub usage: TokenUsage,
    #[serde(serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub source: SqlSource,
    /// `<backend>:<model>` for model output
    pub model: Option<String>,
    pub mode: Option<LlmMode>,
    pub truncated: bool,
    pub cached: bool,
    /// Cache slot for a first attempt; filled only after the statement passes the checks
    #[serde(skip)]
    pub cache_key: Option<String>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_sql_length: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            temperature: 0.1,
            max_sql_length: 1000,
        }
    }
}

/// Turns a question plus schema context into one SELECT statement
pub struct SqlGenerator {
    llm: Option<Arc<dyn CompletionProvider>>,
    cache: Option<Arc<QueryCache>>,
    params: GenerationParams,
}

impl SqlGenerator {
    pub fn new(
        llm: Option<Arc<dyn CompletionProvider>>,
        cache: Option<Arc<QueryCache>>,
        params: GenerationParams,
    ) -> Self {
        Self { llm, cache, params }
    }

    /// First attempt; may be served from the cache.
    ///
    /// Nothing is stored here: call [`SqlGenerator::remember`] once the
    /// statement has passed the allowlist and validator.
    pub async fn generate(
        &self,
        question: &str,
        schema_context: &str,
        constraints: &GenerationConstraints,
    ) -> GeneratedSql {
        self.run(question, schema_context, constraints, true).await
    }

    /// Retry attempt; never cached
    pub async fn regenerate(
        &self,
        question: &str,
        schema_context: &str,
        constraints: &GenerationConstraints,
    ) -> GeneratedSql {
        self.run(question, schema_context, constraints, false).await
    }

    async fn run(
        &self,
        question: &str,
        schema_context: &str,
        constraints: &GenerationConstraints,
        use_cache: bool,
    ) -> GeneratedSql {
        let started = Instant::now();
        let cache = self.cache.as_ref().filter(|_| use_cache);
        let key = cache.map(|_| QueryCache::key(question, schema_context, constraints));

        if let (Some(cache), Some(key)) = (cache, key.as_deref())
            && let Some(hit) = cache.get(key)
        {
            debug!("Using cached SQL ({})", hit.model);
            return GeneratedSql {
                sql: hit.sql,
                usage: TokenUsage::default(),
                latency: started.elapsed(),
                source: SqlSource::Model,
                model: Some(hit.model),
                mode: hit.mode,
                truncated: hit.truncated,
                cached: true,
                cache_key: Some(key.to_string()),
            };
        }

        match self.ask_model(question, schema_context, constraints).await {
            Ok(generated) => {
                info!(
                    "Generated SQL with {} ({} prompt + {} completion tokens)",
                    generated.model.as_deref().unwrap_or("model"),
                    generated.usage.prompt_tokens,
                    generated.usage.completion_tokens
                );
                GeneratedSql {
                    latency: started.elapsed(),
                    cache_key: key,
                    ..generated
                }
            }
            Err(e) => {
                warn!("SQL generation unavailable, using heuristic fallback: {}", e);
                let sql = fallback_sql(question, &constraints.allowed_tables);
                GeneratedSql {
                    sql,
                    usage: TokenUsage::default(),
                    latency: started.elapsed(),
                    source: SqlSource::Fallback,
                    model: None,
                    mode: None,
                    truncated: false,
                    cached: false,
                    cache_key: None,
                }
            }
        }
    }

    /// Store a checked first-attempt statement; fallback and retry output is ignored
    pub fn remember(&self, generated: &GeneratedSql) {
        let (Some(cache), Some(key)) = (&self.cache, &generated.cache_key) else {
            return;
        };
        if generated.cached || generated.source != SqlSource::Model {
            return;
        }
        cache.insert(
            key.clone(),
            CachedSql {
                sql: generated.sql.clone(),
                model: generated.model.clone().unwrap_or_default(),
                mode: generated.mode,
                truncated: generated.truncated,
            },
        );
    }

    /// Evict a cached statement that no longer passes the checks
    pub fn forget(&self, generated: &GeneratedSql) {
        if let (Some(cache), Some(key)) = (&self.cache, &generated.cache_key)
            && generated.cached
            && cache.remove(key)
        {
            debug!("Evicted cached SQL that failed the checks");
        }
    }

    async fn ask_model(
        &self,
        question: &str,
        schema_context: &str,
        constraints: &GenerationConstraints,
    ) -> NlSqlResult<GeneratedSql> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| NlSqlError::ConfigurationError("SQL generation is disabled".to_string()))?;

        let messages = [
            ChatMessage::system(PromptGenerator::system_prompt(schema_context, constraints)),
            ChatMessage::user(PromptGenerator::user_prompt(question)),
        ];
        let completion = llm
            .complete(&messages, self.params.max_tokens, self.params.temperature)
            .await?;

        let (sql, truncated) = extract_sql(&completion.content, self.params.max_sql_length);
        if sql.is_empty() {
            return Err(NlSqlError::ProviderError(
                "model returned no SQL statement".to_string(),
            ));
        }

        Ok(GeneratedSql {
            sql,
            usage: completion.usage,
            latency: Duration::ZERO,
            source: SqlSource::Model,
            model: Some(completion.model),
            mode: Some(completion.mode),
            truncated,
            cached: false,
            cache_key: None,
        })
    }
}

/// Strip code fences, keep the first statement, and cap the length in characters.
///
/// Returns the statement and whether it was truncated.
pub fn extract_sql(raw: &str, max_len: usize) -> (String, bool) {
    let mut text = raw.trim();

    // Prose around a fenced block: keep the block
    if let Some(open) = text.find("```") {
        let after = &text[open + 3..];
        let body_start = after
            .get(..3)
            .filter(|tag| tag.eq_ignore_ascii_case("sql"))
            .map_or(0, |_| 3);
        let body = &after[body_start..];
        text = match body.find("```") {
            Some(close) => &body[..close],
            None => body,
        };
    }

    let first = text.split(';').next().unwrap_or_default().trim();

    if max_len > 0 && first.chars().count() > max_len {
        warn!("SQL query truncated to {} characters", max_len);
        let cut: String = first.chars().take(max_len).collect();
        return (cut.trim_end().to_string(), true);
    }
    (first.to_string(), false)
}

const COUNT_WORDS: &[&str] = &["how many", "count", "number of", "total", "kaç", "sayı", "toplam"];
const GENDER_WORDS: &[&str] = &["gender", "sex", "cinsiyet"];
const AGE_WORDS: &[&str] = &["age", "yaş"];
const ADMISSION_WORDS: &[&str] = &["admission", "admitted", "hospitaliz", "yatış", "yatan"];
const PROVIDER_WORDS: &[&str] = &["provider", "doctor", "physician", "doktor", "hekim", "personel"];
const TRANSFER_WORDS: &[&str] = &["transfer", "careunit", "care unit", "servis", "birim"];

fn mentions(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Deterministic question→SQL templates in English and Turkish.
///
/// Always returns a single SELECT that passes the static checks. Falls back to
/// the first allowed table when the topic table is not allowed.
pub fn fallback_sql(question: &str, allowed_tables: &[String]) -> String {
    let q = question.to_lowercase();

    let topic = if mentions(&q, ADMISSION_WORDS) {
        "json_admissions"
    } else if mentions(&q, PROVIDER_WORDS) {
        "json_providers"
    } else if mentions(&q, TRANSFER_WORDS) {
        "json_transfers"
    } else {
        "json_patients"
    };
    let topic_allowed = allowed_tables.is_empty() || allowed_tables.iter().any(|t| t == topic);
    if !topic_allowed {
        if let Some(first) = allowed_tables.first() {
            return format!("SELECT COUNT(*) AS total FROM {first}");
        }
    }

    if topic == "json_patients" && mentions(&q, GENDER_WORDS) {
        return "SELECT gender, COUNT(*) AS patient_count FROM json_patients GROUP BY gender ORDER BY patient_count DESC"
            .to_string();
    }
    if topic == "json_patients" && mentions(&q, AGE_WORDS) {
        return "SELECT anchor_age, COUNT(*) AS patient_count FROM json_patients GROUP BY anchor_age ORDER BY anchor_age"
            .to_string();
    }
    if mentions(&q, COUNT_WORDS) {
        return format!("SELECT COUNT(*) AS total FROM {topic}");
    }

    match topic {
        "json_admissions" => "SELECT hadm_id, subject_id, admittime, admission_type FROM json_admissions ORDER BY admittime DESC LIMIT 10".to_string(),
        "json_providers" => "SELECT provider_id, npi FROM json_providers ORDER BY npi LIMIT 20".to_string(),
        "json_transfers" => "SELECT careunit, COUNT(*) AS transfer_count FROM json_transfers GROUP BY careunit ORDER BY transfer_count DESC".to_string(),
        _ => "SELECT COUNT(*) AS total FROM json_patients".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nl_sql::allowlist::DEFAULT_ALLOWED_TABLES;
    use crate::nl_sql::client::tests::ScriptedProvider;
    use crate::nl_sql::validator::{check_statement, validate};
    use crate::test_support::seeded_database;
    use rstest::rstest;

    fn constraints() -> GenerationConstraints {
        GenerationConstraints {
            allowed_tables: DEFAULT_ALLOWED_TABLES.iter().map(|s| s.to_string()).collect(),
            entity_context: None,
            max_sql_length: 1000,
        }
    }

    fn generator(provider: Arc<ScriptedProvider>, cache: Option<Arc<QueryCache>>) -> SqlGenerator {
        SqlGenerator::new(Some(provider), cache, GenerationParams::default())
    }

    #[rstest]
    #[case("```sql\nSELECT * FROM json_patients;\n```", "SELECT * FROM json_patients")]
    #[case("```\nSELECT 1\n```", "SELECT 1")]
    #[case("```SQL\nSELECT 1\n```", "SELECT 1")]
    #[case("Here you go:\n```sql\nSELECT 2\n```\nEnjoy", "SELECT 2")]
    #[case("  SELECT 1; DROP TABLE json_patients;  ", "SELECT 1")]
    #[case("SELECT 1;;", "SELECT 1")]
    #[case("", "")]
    fn test_extract_sql(#[case] raw: &str, #[case] expected: &str) {
        let (sql, truncated) = extract_sql(raw, 1000);
        assert_eq!(sql, expected);
        assert!(!truncated);
    }

    #[test]
    fn test_extract_sql_truncates_by_characters() {
        let (sql, truncated) = extract_sql("SELECT 'çççççç' FROM t", 10);
        assert!(truncated);
        assert_eq!(sql.chars().count(), 10);
        assert_eq!(sql, "SELECT 'çç");
    }

    #[rstest]
    #[case("How many patients are there?", "SELECT COUNT(*) AS total FROM json_patients")]
    #[case("Kaç hasta var?", "SELECT COUNT(*) AS total FROM json_patients")]
    #[case("Kaç yatış var?", "SELECT COUNT(*) AS total FROM json_admissions")]
    #[case("Count the doctors", "SELECT COUNT(*) AS total FROM json_providers")]
    #[case("Patients by gender", "GROUP BY gender")]
    #[case("Cinsiyet dağılımı nedir?", "GROUP BY gender")]
    #[case("Hastaların yaş dağılımı", "GROUP BY anchor_age")]
    #[case("List recent admissions", "FROM json_admissions ORDER BY admittime DESC LIMIT 10")]
    #[case("Show providers", "FROM json_providers")]
    #[case("Hangi servislerde transfer var", "FROM json_transfers")]
    #[case("¿qué?", "SELECT COUNT(*) AS total FROM json_patients")]
    fn test_fallback_templates(#[case] question: &str, #[case] expected: &str) {
        let sql = fallback_sql(question, &constraints().allowed_tables);
        assert!(sql.contains(expected), "{sql}");
        assert_eq!(check_statement(&sql), Ok(()), "{sql}");
    }

    #[test]
    fn test_fallback_respects_allowlist() {
        let sql = fallback_sql("list admissions", &["json_patients".to_string()]);
        assert_eq!(sql, "SELECT COUNT(*) AS total FROM json_patients");
    }

    #[tokio::test]
    async fn test_every_fallback_template_runs_against_schema() {
        let db = seeded_database().await;
        let mut session = db.session().await.unwrap();
        for question in [
            "How many patients?",
            "gender",
            "age",
            "admissions",
            "providers",
            "transfers",
            "kaç transfer",
        ] {
            let sql = fallback_sql(question, &[]);
            let outcome = validate(&sql, &mut session).await;
            assert!(outcome.is_valid, "{sql}: {:?}", outcome.error);
        }
    }

    #[tokio::test]
    async fn test_model_output_is_cleaned() {
        let provider = Arc::new(ScriptedProvider::replying(&[
            "```sql\nSELECT COUNT(*) FROM json_patients;\n```",
        ]));
        let generated = generator(provider.clone(), None)
            .generate("How many patients?", "ctx", &constraints())
            .await;

        assert_eq!(generated.sql, "SELECT COUNT(*) FROM json_patients");
        assert_eq!(generated.source, SqlSource::Model);
        assert_eq!(generated.usage.total_tokens, 50);
        assert!(!generated.cached);
        assert!(
            provider
                .last_user_message()
                .unwrap()
                .contains("User Question: How many patients?")
        );
    }

    #[tokio::test]
    async fn test_backend_failure_uses_fallback() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(NlSqlError::TimeoutError {
            timeout_secs: 30,
        })]));
        let cache = Arc::new(QueryCache::new());
        let generated = generator(provider, Some(cache.clone()))
            .generate("How many patients are there?", "ctx", &constraints())
            .await;

        assert_eq!(generated.source, SqlSource::Fallback);
        assert!(generated.sql.starts_with("SELECT COUNT(*)"));
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn test_empty_model_reply_uses_fallback() {
        let provider = Arc::new(ScriptedProvider::replying(&["```\n```"]));
        let generated = generator(provider, None)
            .generate("Kaç hasta var?", "ctx", &constraints())
            .await;
        assert_eq!(generated.source, SqlSource::Fallback);
    }

    #[tokio::test]
    async fn test_disabled_generation_uses_fallback() {
        let generated = SqlGenerator::new(None, None, GenerationParams::default())
            .generate("How many admissions?", "ctx", &constraints())
            .await;
        assert_eq!(generated.source, SqlSource::Fallback);
        assert_eq!(generated.sql, "SELECT COUNT(*) AS total FROM json_admissions");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend_and_retry_bypasses_cache() {
        let provider = Arc::new(ScriptedProvider::replying(&[
            "SELECT COUNT(*) FROM json_patients",
            "SELECT COUNT(*) FROM json_admissions",
        ]));
        let cache = Arc::new(QueryCache::new());
        let generator = generator(provider.clone(), Some(cache.clone()));

        let first = generator.generate("q", "ctx", &constraints()).await;
        assert_eq!(cache.stats().size, 0, "unchecked output must not be cached");
        generator.remember(&first);

        let second = generator.generate("q", "ctx", &constraints()).await;
        assert_eq!(provider.call_count(), 1);
        assert!(second.cached);
        assert_eq!(first.sql, second.sql);
        assert_eq!(second.usage, TokenUsage::default());

        let retry = generator.regenerate("q", "ctx", &constraints()).await;
        assert_eq!(provider.call_count(), 2);
        assert_eq!(retry.sql, "SELECT COUNT(*) FROM json_admissions");
        assert!(!retry.cached);
        generator.remember(&retry);
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test]
    async fn test_forget_evicts_cached_statement() {
        let provider = Arc::new(ScriptedProvider::replying(&[
            "SELECT COUNT(*) FROM json_patients",
            "SELECT COUNT(*) FROM json_patients",
        ]));
        let cache = Arc::new(QueryCache::new());
        let generator = generator(provider.clone(), Some(cache.clone()));

        let first = generator.generate("q", "ctx", &constraints()).await;
        generator.forget(&first);
        generator.remember(&first);
        let hit = generator.generate("q", "ctx", &constraints()).await;
        assert!(hit.cached);

        generator.forget(&hit);
        assert_eq!(cache.stats().size, 0);
        let fresh = generator.generate("q", "ctx", &constraints()).await;
        assert!(!fresh.cached);
        assert_eq!(provider.call_count(), 2);
    }
}
