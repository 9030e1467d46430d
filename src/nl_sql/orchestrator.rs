//! Request pipeline: guard, extract, retrieve, generate, check, retry once, execute, summarize
//!
//! One request owns one datastore session from the first check to the final
//! execution. Every terminal outcome, including failures, is a [`QueryResponse`].

use crate::database::{DatabaseClient, SessionFactory};
use crate::nl_sql::allowlist::{SecurityDecision, TableAllowlist, tables_used};
use crate::nl_sql::config::LlmMode;
use crate::nl_sql::entities::{EntityExtractor, ExtractionResult, MaskStrategy, context_block, mask_pii};
use crate::nl_sql::error::NlSqlError;
use crate::nl_sql::generator::{GeneratedSql, SqlGenerator, SqlSource};
use crate::nl_sql::prompt::{GenerationConstraints, PromptGenerator};
use crate::nl_sql::response::{
    QueryResponse, ResponseMeta, ResultsMeta, RetrievalMeta, SqlSafety, TokenCounters,
};
use crate::nl_sql::retriever::{RetrievalHints, RetrievalMode, Retriever};
use crate::nl_sql::schema::SchemaIndex;
use crate::nl_sql::summarizer::AnswerSummarizer;
use crate::nl_sql::validator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const INTENT_WORDS_EN: &[&str] = &[
    "delete", "drop", "truncate", "insert", "update", "alter", "remove", "modify", "erase", "overwrite",
];

const INTENT_STEMS_TR: &[&str] = &["sil", "güncelle", "ekle", "kaldır", "değiştir", "boşalt"];

/// Words that share a stem prefix but carry no modification intent
const INTENT_FALSE_FRIENDS: &[&str] = &[
    "silver", "silent", "silenc", "silic", "silk", "silly", "silhouet", "silo", "silah", "eklem",
];

/// First modification phrase found in the question, if any.
///
/// English verbs must match whole words; Turkish stems match words that start with them.
pub fn modification_intent(question: &str) -> Option<String> {
    let lowered = question.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .find(|word| {
            INTENT_WORDS_EN.contains(word)
                || (INTENT_STEMS_TR.iter().any(|stem| word.starts_with(stem))
                    && !INTENT_FALSE_FRIENDS.iter().any(|f| word.starts_with(f)))
        })
        .map(str::to_string)
}

/// One question as it moves through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub raw: String,
    pub language: String,
    /// Raw text after entity masking; the only form that leaves the process or reaches logs
    pub sanitized: String,
}

/// Entity extraction per language, or explicitly switched off
pub enum EntityStage {
    Disabled,
    Enabled(HashMap<String, EntityExtractor>),
}

impl EntityStage {
    async fn extract(&self, raw: &str, language: &str) -> Result<ExtractionResult, NlSqlError> {
        match self {
            EntityStage::Disabled => Ok(ExtractionResult::passthrough(raw)),
            EntityStage::Enabled(extractors) => {
                let extractor = extractors.get(language).ok_or_else(|| {
                    NlSqlError::ModelUnavailable(format!("no recognizer configured for language '{language}'"))
                })?;
                extractor.extract(raw).await
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub top_k: usize,
    pub retrieval_mode: RetrievalMode,
    pub use_entity_hints: bool,
    pub max_sql_length: usize,
    pub selected_mode: LlmMode,
}

/// Result of running the checks on one attempt
enum CheckOutcome {
    Passed,
    SecurityBlocked {
        message: String,
        decision: SecurityDecision,
    },
    Invalid(String),
}

impl CheckOutcome {
    fn error(&self) -> Option<&str> {
        match self {
            CheckOutcome::Passed => None,
            CheckOutcome::SecurityBlocked { message, .. } => Some(message),
            CheckOutcome::Invalid(reason) => Some(reason),
        }
    }
}

/// Per-request mutable state
struct RequestContext {
    meta: ResponseMeta,
    tokens: TokenCounters,
    started: Instant,
}

impl RequestContext {
    fn fail(mut self, sql: Option<String>, answer: String, error: String) -> QueryResponse {
        self.meta.set_tokens(self.tokens);
        warn!(
            "Request {} failed after {} ms: {}",
            self.meta.trace_id,
            self.started.elapsed().as_millis(),
            error
        );
        QueryResponse {
            sql,
            answer,
            meta: self.meta,
            success: false,
            error: Some(error),
            result: None,
        }
    }
}

/// Wires the pipeline stages together
pub struct Orchestrator {
    entities: EntityStage,
    retriever: Retriever,
    generator: SqlGenerator,
    allowlist: Arc<TableAllowlist>,
    summarizer: AnswerSummarizer,
    sessions: Arc<dyn SessionFactory>,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        entities: EntityStage,
        retriever: Retriever,
        generator: SqlGenerator,
        allowlist: Arc<TableAllowlist>,
        summarizer: AnswerSummarizer,
        sessions: Arc<dyn SessionFactory>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            entities,
            retriever,
            generator,
            allowlist,
            summarizer,
            sessions,
            settings,
        }
    }

    pub fn allowlist(&self) -> &TableAllowlist {
        &self.allowlist
    }

    pub async fn ask(&self, schema: &SchemaIndex, raw_question: &str, language: &str) -> QueryResponse {
        let mut ctx = RequestContext {
            meta: ResponseMeta::new(
                self.settings.selected_mode,
                language,
                self.allowlist.security_info().into(),
            ),
            tokens: TokenCounters::default(),
            started: Instant::now(),
        };
        ctx.meta.question = mask_pii(raw_question, MaskStrategy::Placeholder);

        // Pre-generation guard on the raw text
        if let Some(phrase) = modification_intent(raw_question) {
            info!("Request {} blocked: modification intent '{}'", ctx.meta.trace_id, phrase);
            let error = format!("Data modification request detected ('{phrase}'); only read-only questions are allowed.");
            ctx.meta.validation.error = Some(error.clone());
            ctx.meta.validation.sql_safety = SqlSafety::BlockedDataModification;
            ctx.meta.security.data_modification_blocked = true;
            ctx.meta.llm.effective_mode = "none".to_string();
            return ctx.fail(
                None,
                "This request asks to modify data. Only read-only questions can be answered.".to_string(),
                error,
            );
        }

        let extraction = match self.entities.extract(raw_question, language).await {
            Ok(extraction) => extraction,
            Err(e) => {
                error!("Entity extraction failed: {}", e);
                let message = e.user_message();
                ctx.meta.validation.error = Some(message.clone());
                return ctx.fail(None, message.clone(), message);
            }
        };
        let question = Question {
            raw: raw_question.to_string(),
            language: language.to_string(),
            sanitized: extraction.sanitized_text.clone(),
        };
        ctx.meta.question = question.sanitized.clone();
        info!(
            "Request {} [{}]: {}",
            ctx.meta.trace_id, question.language, question.sanitized
        );

        let hints = if self.settings.use_entity_hints {
            extraction.hints()
        } else {
            RetrievalHints::default()
        };
        let snippets = self
            .retriever
            .retrieve(
                schema,
                &question.sanitized,
                self.settings.top_k,
                self.settings.retrieval_mode,
                &hints,
            )
            .await;
        ctx.meta.retrieval = Some(RetrievalMeta {
            mode: self.settings.retrieval_mode,
            snippets: snippets
                .iter()
                .map(|s| format!("{}.{}", s.table, s.column_label()))
                .collect(),
            entities: extraction.entities.len(),
        });

        let schema_context = PromptGenerator::schema_context(&snippets);
        let constraints = GenerationConstraints {
            allowed_tables: self.allowlist.allowed_tables(),
            entity_context: context_block(&extraction.entities),
            max_sql_length: self.settings.max_sql_length,
        };

        let mut session = match self.sessions.open_session().await {
            Ok(session) => session,
            Err(e) => {
                error!("Could not open a database session: {}", e);
                let message = e.datastore_message();
                return ctx.fail(None, format!("Database connection failed: {message}"), message);
            }
        };

        let response = self
            .run_attempts(&mut ctx, session.as_mut(), &question, &schema_context, &constraints)
            .await;
        let response = match response {
            Ok(sql) => self.execute(ctx, session.as_mut(), &question, sql).await,
            Err((sql, error)) => ctx.fail(
                Some(sql),
                format!("Could not produce a valid SQL query: {error}"),
                error,
            ),
        };

        if let Err(e) = session.close().await {
            warn!("Closing session failed: {}", e);
        }
        response
    }

    /// Generate and check, retrying once with guidance.
    ///
    /// Returns the checked statement, or the last statement with its error.
    async fn run_attempts(
        &self,
        ctx: &mut RequestContext,
        session: &mut dyn DatabaseClient,
        question: &Question,
        schema_context: &str,
        constraints: &GenerationConstraints,
    ) -> Result<String, (String, String)> {
        let first = self
            .generator
            .generate(&question.sanitized, schema_context, constraints)
            .await;
        let (mut sql, mut outcome) = self.check_attempt(ctx, session, &first).await;
        if matches!(outcome, CheckOutcome::Passed) {
            self.generator.remember(&first);
        } else {
            self.generator.forget(&first);
        }
        let mut last = first;

        if let Some(error) = outcome.error().map(str::to_string) {
            info!("Attempt 1 rejected, retrying with guidance: {}", error);
            let retry_question = PromptGenerator::retry_question(&question.sanitized, &error);
            let second = self
                .generator
                .regenerate(&retry_question, schema_context, constraints)
                .await;
            (sql, outcome) = self.check_attempt(ctx, session, &second).await;
            last = second;
            ctx.meta.validation.retried = true;
        }

        self.record_generation(ctx, &last);
        ctx.meta.describe_sql(&sql, tables_used(&sql));

        match outcome {
            CheckOutcome::Passed => {
                ctx.meta.validation.is_valid = true;
                ctx.meta.validation.error = None;
                ctx.meta.validation.sql_safety = SqlSafety::Passed;
                ctx.meta.security.decision = None;
                Ok(sql)
            }
            CheckOutcome::SecurityBlocked { message, decision } => {
                ctx.meta.validation.error = Some(message.clone());
                ctx.meta.security.decision = Some(decision);
                Err((sql, message))
            }
            CheckOutcome::Invalid(reason) => {
                ctx.meta.validation.error = Some(reason.clone());
                Err((sql, reason))
            }
        }
    }

    /// Normalize at the generation/checker boundary, then run security and syntax checks
    async fn check_attempt(
        &self,
        ctx: &mut RequestContext,
        session: &mut dyn DatabaseClient,
        generated: &GeneratedSql,
    ) -> (String, CheckOutcome) {
        ctx.tokens.add_generation(generated.usage);
        let sql = self.allowlist.normalize_sql_tables(&generated.sql);
        if sql != generated.sql {
            debug!("Normalized table names: {} -> {}", generated.sql, sql);
        }

        let (allowed, message, decision) = self.allowlist.validate_query(&sql);
        if !allowed {
            warn!("Allowlist blocked statement: {}", message);
            ctx.meta.security.blocked_operations = self.allowlist.security_info().blocked_operations;
            return (sql, CheckOutcome::SecurityBlocked { message, decision });
        }

        let validation = validator::validate(&sql, session).await;
        if !validation.is_valid {
            let reason = validation
                .error
                .unwrap_or_else(|| "Statement failed validation".to_string());
            warn!("Validation failed: {}", reason);
            return (sql, CheckOutcome::Invalid(reason));
        }

        (sql, CheckOutcome::Passed)
    }

    fn record_generation(&self, ctx: &mut RequestContext, generated: &GeneratedSql) {
        let llm = &mut ctx.meta.llm;
        llm.sql_source = Some(generated.source);
        llm.model_used = generated.model.clone();
        llm.cached = generated.cached;
        llm.effective_mode = match (generated.source, generated.mode) {
            (SqlSource::Fallback, _) => "fallback".to_string(),
            (SqlSource::Model, Some(mode)) => mode.to_string(),
            (SqlSource::Model, None) => "model".to_string(),
        };
        if generated.truncated {
            warn!("Generated statement was truncated to {} characters", self.settings.max_sql_length);
        }
    }

    async fn execute(
        &self,
        mut ctx: RequestContext,
        session: &mut dyn DatabaseClient,
        question: &Question,
        sql: String,
    ) -> QueryResponse {
        // Executor pre-flight, independent of the checks above
        if !validator::is_safe_select(&sql) {
            let error = "Statement rejected by executor: only read-only SELECT statements run.".to_string();
            return ctx.fail(Some(sql), error.clone(), error);
        }

        let started = Instant::now();
        let result = match session.execute_query(&sql).await {
            Ok(result) => result,
            Err(e) => {
                let message = e.datastore_message();
                error!("Execution failed: {}", message);
                ctx.meta.performance.execution_ms = elapsed_ms(started);
                return ctx.fail(Some(sql), format!("Query execution failed: {message}"), message);
            }
        };
        ctx.meta.performance.execution_ms = elapsed_ms(started);
        ctx.meta.performance.rows_returned = result.row_count();
        ctx.meta.performance.columns_returned = result.columns.len();
        ctx.meta.results = ResultsMeta::from_result(&result);
        info!(
            "Executed in {} ms, {} rows",
            ctx.meta.performance.execution_ms,
            result.row_count()
        );

        let summary = self
            .summarizer
            .summarize(&question.sanitized, &sql, &result)
            .await;
        ctx.tokens.add_summary(summary.usage);
        ctx.meta.set_tokens(ctx.tokens);

        debug!(
            "Request {} finished in {} ms",
            ctx.meta.trace_id,
            ctx.started.elapsed().as_millis()
        );
        QueryResponse {
            sql: Some(sql),
            answer: summary.answer,
            meta: ctx.meta,
            success: true,
            error: None,
            result: Some(result),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
