//! Natural-language questions answered with read-only SQL
//!
//! The engine wires the pipeline stages from configuration: schema retrieval,
//! entity masking, LLM-backed generation with a heuristic fallback, allowlist
//! and syntax checks with one guided retry, execution and answer summarization.
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn run() -> querybot::nl_sql::NlSqlResult<()> {
//! use querybot::database_sqlite::{SqliteDatabase, SqliteOptions};
//! use querybot::nl_sql::{NlSqlConfig, NlSqlEngine};
//! use std::sync::Arc;
//!
//! let db = Arc::new(SqliteDatabase::open("medical.db", &SqliteOptions::default()).await?);
//! let engine = NlSqlEngine::with_sqlite(NlSqlConfig::default(), db).await?;
//! let response = engine.ask("How many patients are there?", None).await?;
//! println!("{}", response.answer);
//! # Ok(())
//! # }
//! ```

pub mod allowlist;
pub mod cache;
pub mod client;
pub mod config;
pub mod embedding;
pub mod entities;
pub mod error;
pub mod generator;
pub mod orchestrator;
pub mod prompt;
pub mod response;
pub mod retriever;
pub mod schema;
pub mod summarizer;
pub mod validator;

pub use allowlist::{SecurityDecision, SecurityInfo, TableAllowlist};
pub use cache::{CacheStats, QueryCache};
pub use client::{CompletionProvider, LlmManager};
pub use config::{EntityBackendKind, LlmMode, NlSqlConfig};
pub use entities::{EntityExtractor, MaskStrategy};
pub use error::{NlSqlError, NlSqlResult};
pub use generator::{SqlGenerator, SqlSource};
pub use orchestrator::{Orchestrator, modification_intent};
pub use response::{QueryResponse, ResponseMeta};
pub use retriever::{RetrievalMode, Retriever};
pub use schema::SchemaIndex;

use crate::database::{MetadataProvider, SessionFactory};
use crate::database_sqlite::SqliteDatabase;
use embedding::{EmbeddingProvider, OllamaEmbedder, OpenAiEmbedder};
use entities::{ExtractorOptions, GazetteerNerBackend, HttpNerBackend, NerBackend};
use generator::GenerationParams;
use orchestrator::{EntityStage, PipelineSettings};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use summarizer::AnswerSummarizer;
use tracing::{debug, info, warn};

/// Languages the entity stage is prepared for
pub const SUPPORTED_LANGUAGES: &[&str] = &["en", "tr"];

/// Main engine; one instance serves any number of concurrent questions
pub struct NlSqlEngine {
    config: NlSqlConfig,
    orchestrator: Orchestrator,
    llm: Arc<LlmManager>,
    cache: Option<Arc<QueryCache>>,
    metadata: Arc<dyn MetadataProvider>,
    schema: RwLock<Arc<SchemaIndex>>,
}

impl NlSqlEngine {
    /// Build every stage from `config` and take the first schema snapshot
    pub async fn new(
        config: NlSqlConfig,
        sessions: Arc<dyn SessionFactory>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> NlSqlResult<Self> {
        config.validate().map_err(NlSqlError::ConfigurationError)?;

        let llm = Arc::new(LlmManager::from_config(&config)?);
        let cache = config
            .cache_enabled
            .then(|| Arc::new(QueryCache::with_ttl(config.cache_ttl_seconds)));
        let allowlist = Arc::new(TableAllowlist::new(&config.security));
        let entities = build_entity_stage(&config).await?;
        let embedder = build_embedder(&config)?;

        let generator = SqlGenerator::new(
            Some(llm.clone()),
            cache.clone(),
            GenerationParams {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                max_sql_length: config.max_sql_length,
            },
        );
        let summarizer = AnswerSummarizer::new(Some(llm.clone()), config.summarizer.clone());
        let retriever = Retriever::new(embedder, config.retrieval.hybrid_alpha);

        let settings = PipelineSettings {
            top_k: config.retrieval.top_k,
            retrieval_mode: config.retrieval.mode,
            use_entity_hints: config.retrieval.use_entity_hints,
            max_sql_length: config.max_sql_length,
            selected_mode: config.llm_mode,
        };

        let schema = SchemaIndex::build(metadata.as_ref()).await?;
        info!(
            "Schema index built: {} tables, {} snippets",
            schema.tables().len(),
            schema.len()
        );

        let orchestrator = Orchestrator::new(
            entities, retriever, generator, allowlist, summarizer, sessions, settings,
        );

        Ok(Self {
            config,
            orchestrator,
            llm,
            cache,
            metadata,
            schema: RwLock::new(Arc::new(schema)),
        })
    }

    pub async fn with_sqlite(config: NlSqlConfig, db: Arc<SqliteDatabase>) -> NlSqlResult<Self> {
        let metadata: Arc<dyn MetadataProvider> = Arc::new(db.metadata_provider());
        Self::new(config, db, metadata).await
    }

    /// Answer one question.
    ///
    /// Pipeline failures come back as an envelope with `success = false`; only a
    /// question that cannot start the pipeline at all is an `Err`.
    pub async fn ask(&self, question: &str, language: Option<&str>) -> NlSqlResult<QueryResponse> {
        let question = question.trim();
        if question.is_empty() {
            return Err(NlSqlError::ConfigurationError(
                "question must not be empty".to_string(),
            ));
        }
        let language = language
            .unwrap_or(&self.config.default_language)
            .trim()
            .to_lowercase();

        let schema = self.schema();
        Ok(self.orchestrator.ask(&schema, question, &language).await)
    }

    /// Current schema snapshot
    pub fn schema(&self) -> Arc<SchemaIndex> {
        self.schema
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Re-introspect the datastore and swap the snapshot; requests in flight keep the old one
    pub async fn refresh_schema(&self) -> NlSqlResult<()> {
        let fresh = Arc::new(SchemaIndex::build(self.metadata.as_ref()).await?);
        debug!("Schema snapshot refreshed ({} snippets)", fresh.len());
        *self.schema.write().unwrap_or_else(|p| p.into_inner()) = fresh;
        Ok(())
    }

    pub fn config(&self) -> &NlSqlConfig {
        &self.config
    }

    pub fn llm(&self) -> &LlmManager {
        &self.llm
    }

    pub fn security_info(&self) -> SecurityInfo {
        self.orchestrator.allowlist().security_info()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
            info!("Query cache cleared");
        }
    }
}

async fn build_entity_stage(config: &NlSqlConfig) -> NlSqlResult<EntityStage> {
    let entities = &config.entities;
    let mut extractors = HashMap::new();
    for language in SUPPORTED_LANGUAGES {
        let backend: Box<dyn NerBackend> = match entities.backend {
            EntityBackendKind::Gazetteer => Box::new(GazetteerNerBackend::new(language)?),
            EntityBackendKind::Http => {
                let url = entities.service_url.as_deref().ok_or_else(|| {
                    NlSqlError::ConfigurationError(
                        "entities.service_url is required when entities.backend = \"http\"".to_string(),
                    )
                })?;
                Box::new(HttpNerBackend::connect(url, language, config.timeout_seconds).await?)
            }
            EntityBackendKind::Disabled => {
                info!("Entity extraction disabled by configuration");
                return Ok(EntityStage::Disabled);
            }
        };
        let options = ExtractorOptions {
            mask_strategy: entities.mask_strategy,
            desired_labels: entities.desired_labels.iter().cloned().collect(),
            sensitive_labels: entities.sensitive_labels.iter().cloned().collect(),
        };
        extractors.insert(
            language.to_string(),
            EntityExtractor::new(Some(backend), options)?,
        );
    }
    Ok(EntityStage::Enabled(extractors))
}

/// Embedding backend for the configured retrieval mode, if any
fn build_embedder(config: &NlSqlConfig) -> NlSqlResult<Option<Arc<dyn EmbeddingProvider>>> {
    if config.retrieval.mode == RetrievalMode::Keyword {
        return Ok(None);
    }
    if config.llm_mode == LlmMode::Local {
        return Ok(Some(Arc::new(OllamaEmbedder::new(
            config.ollama_base_url.clone(),
            config.ollama_model.clone(),
            config.timeout_seconds,
        )?)));
    }
    match config.get_openai_api_key() {
        Some(key) => Ok(Some(Arc::new(OpenAiEmbedder::new(
            key,
            config.openai_base_url.clone(),
            config.retrieval.embedding_model.clone(),
            config.timeout_seconds,
        )?))),
        None => {
            warn!("No embedding backend configured; semantic ranking uses bag-of-words vectors");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_connection_released, seeded_database};

    /// Local mode pointed at a closed port: every completion fails fast
    fn offline_config() -> NlSqlConfig {
        let mut config = NlSqlConfig::default();
        config.llm_mode = LlmMode::Local;
        config.openai_api_key = None;
        config.ollama_base_url = "http://127.0.0.1:9".to_string();
        config.timeout_seconds = 2;
        config.retrieval.mode = RetrievalMode::Keyword;
        config
    }

    async fn engine(config: NlSqlConfig) -> (NlSqlEngine, Arc<SqliteDatabase>) {
        let db = Arc::new(seeded_database().await);
        let engine = NlSqlEngine::with_sqlite(config, db.clone()).await.unwrap();
        (engine, db)
    }

    #[tokio::test]
    async fn test_offline_engine_answers_with_fallback() {
        let (engine, db) = engine(offline_config()).await;

        let response = engine.ask("How many patients are there?", None).await.unwrap();

        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.meta.llm.effective_mode, "fallback");
        assert_eq!(response.meta.language, "en");
        assert!(response.answer.contains('5'));
        assert_connection_released(&db).await;
    }

    #[tokio::test]
    async fn test_turkish_question_uses_language_tag() {
        let (engine, _db) = engine(offline_config()).await;
        let response = engine.ask("Kaç yatış var?", Some("TR")).await.unwrap();
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.meta.language, "tr");
        assert_eq!(response.meta.database.tables_used, vec!["json_admissions".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected() {
        let (engine, _db) = engine(offline_config()).await;
        assert!(matches!(
            engine.ask("   ", None).await,
            Err(NlSqlError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_schema_picks_up_new_tables() {
        let (engine, db) = engine(offline_config()).await;
        let before = engine.schema();
        assert!(before.table("json_lab").is_none());

        sqlx::query("CREATE TABLE json_lab (labevent_id INTEGER PRIMARY KEY, itemid INTEGER)")
            .execute(db.pool())
            .await
            .unwrap();
        engine.refresh_schema().await.unwrap();

        assert!(engine.schema().table("json_lab").is_some());
        assert!(before.table("json_lab").is_none());
    }

    #[tokio::test]
    async fn test_http_entities_require_service_url() {
        let mut config = offline_config();
        config.entities.backend = EntityBackendKind::Http;
        let db = Arc::new(seeded_database().await);
        let result = NlSqlEngine::with_sqlite(config, db).await;
        assert!(matches!(result, Err(NlSqlError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = offline_config();
        config.retrieval.top_k = 0;
        let db = Arc::new(seeded_database().await);
        assert!(NlSqlEngine::with_sqlite(config, db).await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_entities_and_cache_stats() {
        let mut config = offline_config();
        config.entities.backend = EntityBackendKind::Disabled;
        let (engine, _db) = engine(config).await;

        let response = engine.ask("List providers", None).await.unwrap();
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.meta.retrieval.unwrap().entities, 0);

        // Fallback output is never cached
        let stats = engine.cache_stats().unwrap();
        assert_eq!(stats.size, 0);
    }
}
