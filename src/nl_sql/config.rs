//! Configuration for the question-to-SQL pipeline

use crate::nl_sql::allowlist::DEFAULT_ALLOWED_TABLES;
use crate::nl_sql::entities::{DEFAULT_DESIRED_LABELS, DEFAULT_SENSITIVE_LABELS, MaskStrategy};
use crate::nl_sql::retriever::RetrievalMode;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use url::Url;

/// Which completion backend answers generation requests
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LlmMode {
    /// Hosted OpenAI-compatible chat completions
    #[value(name = "openai")]
    OpenAi,
    /// Local Ollama server
    Local,
    /// OpenAI when configured and reachable, otherwise local
    Auto,
}

impl Default for LlmMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Named-entity recognition backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityBackendKind {
    /// In-process dictionary and pattern recognizer (en, tr)
    Gazetteer,
    /// External NER service
    Http,
    /// Run the pipeline without entity extraction
    Disabled,
}

impl Default for EntityBackendKind {
    fn default() -> Self {
        Self::Gazetteer
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    /// Number of schema snippets (or tables, in hybrid mode) handed to generation
    pub top_k: usize,
    /// Weight of the semantic score in hybrid mode
    pub hybrid_alpha: f32,
    pub embedding_model: String,
    /// Boost tables referenced by extracted identifiers and domain terms
    pub use_entity_hints: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            top_k: 3,
            hybrid_alpha: 0.7,
            embedding_model: "text-embedding-3-small".to_string(),
            use_entity_hints: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    pub backend: EntityBackendKind,
    /// Base URL of the NER service when `backend = "http"`
    pub service_url: Option<String>,
    pub mask_strategy: MaskStrategy,
    pub desired_labels: Vec<String>,
    pub sensitive_labels: Vec<String>,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            backend: EntityBackendKind::Gazetteer,
            service_url: None,
            mask_strategy: MaskStrategy::Placeholder,
            desired_labels: DEFAULT_DESIRED_LABELS.iter().map(|s| s.to_string()).collect(),
            sensitive_labels: DEFAULT_SENSITIVE_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub allowed_tables: Vec<String>,
    /// Let bare domain nouns (e.g. `admission`) pass the allowlist as their canonical table
    pub resolve_aliases: bool,
    /// Additional misspelling → canonical table corrections
    pub extra_typos: BTreeMap<String, String>,
    /// Additional generic noun → canonical table mappings
    pub extra_aliases: BTreeMap<String, String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_tables: DEFAULT_ALLOWED_TABLES.iter().map(|s| s.to_string()).collect(),
            resolve_aliases: false,
            extra_typos: BTreeMap::new(),
            extra_aliases: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Ask the completion backend for a prose answer; otherwise use the deterministic summary
    pub use_llm: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Rows shown to the model
    pub max_rows: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            use_llm: true,
            max_tokens: 300,
            temperature: 0.3,
            max_rows: 10,
        }
    }
}

/// Configuration for the question-to-SQL pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NlSqlConfig {
    pub llm_mode: LlmMode,

    // === OpenAI Configuration ===
    /// OpenAI API key (can also use OPENAI_API_KEY env var)
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,

    // === Ollama Configuration ===
    pub ollama_base_url: String,
    pub ollama_model: String,

    // === Generation Parameters ===
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request timeout for every backend call
    pub timeout_seconds: u64,
    /// Generated statements longer than this are truncated and flagged
    pub max_sql_length: usize,
    /// Language tag assumed for questions when the caller gives none
    pub default_language: String,

    pub retrieval: RetrievalConfig,
    pub entities: EntityConfig,
    pub security: SecurityConfig,
    pub summarizer: SummarizerConfig,

    // === Caching Configuration ===
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
}

impl Default for NlSqlConfig {
    fn default() -> Self {
        Self {
            llm_mode: LlmMode::Auto,

            openai_api_key: None,
            openai_model: "gpt-3.5-turbo".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),

            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "tinyllama".to_string(),

            temperature: 0.1,
            max_tokens: 300,
            timeout_seconds: 30,
            max_sql_length: 1000,
            default_language: "en".to_string(),

            retrieval: RetrievalConfig::default(),
            entities: EntityConfig::default(),
            security: SecurityConfig::default(),
            summarizer: SummarizerConfig::default(),

            cache_enabled: true,
            cache_ttl_seconds: 3600, // 1 hour
        }
    }
}

impl NlSqlConfig {
    /// Get OpenAI API key from config or environment
    pub fn get_openai_api_key(&self) -> Option<String> {
        self.openai_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()))
    }

    /// Apply process environment overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(key) = get("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Some(model) = get("OPENAI_MODEL") {
            self.openai_model = model;
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.openai_base_url = url;
        }
        if let Some(model) = get("OLLAMA_MODEL") {
            self.ollama_model = model;
        }
        if let Some(url) = get("OLLAMA_BASE_URL") {
            self.ollama_base_url = url;
        }
        if let Some(lang) = get("DEFAULT_LANGUAGE") {
            self.default_language = lang;
        }
        if let Some(model) = get("EMBEDDING_MODEL") {
            self.retrieval.embedding_model = model;
        }
        if let Some(mode) = get("LLM_MODE").and_then(|m| m.to_lowercase().parse::<LlmMode>().ok()) {
            self.llm_mode = mode;
        }
        if let Some(mode) =
            get("RETRIEVAL_MODE").and_then(|m| m.to_lowercase().parse::<RetrievalMode>().ok())
        {
            self.retrieval.mode = mode;
        }
        if let Some(tables) = get("ALLOWED_TABLES") {
            let tables: Vec<String> = tables
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if !tables.is_empty() {
                self.security.allowed_tables = tables;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err("temperature must be between 0.0 and 2.0".to_string());
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be greater than 0".to_string());
        }
        if self.timeout_seconds == 0 {
            return Err("timeout_seconds must be greater than 0".to_string());
        }
        if self.max_sql_length == 0 {
            return Err("max_sql_length must be greater than 0".to_string());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retrieval.hybrid_alpha) {
            return Err("retrieval.hybrid_alpha must be between 0.0 and 1.0".to_string());
        }
        if self.security.allowed_tables.is_empty() {
            return Err("security.allowed_tables must name at least one table".to_string());
        }

        for (name, value) in [
            ("openai_base_url", Some(&self.openai_base_url)),
            ("ollama_base_url", Some(&self.ollama_base_url)),
            ("entities.service_url", self.entities.service_url.as_ref()),
        ] {
            if let Some(value) = value {
                Url::parse(value).map_err(|e| format!("{name} is not a valid URL: {e}"))?;
            }
        }

        if self.entities.backend == EntityBackendKind::Http && self.entities.service_url.is_none() {
            return Err("entities.service_url is required when entities.backend = \"http\"".to_string());
        }

        Ok(())
    }

    /// Get documentation for configuration fields
    pub fn documentation() -> Vec<(&'static str, &'static str)> {
        vec![
            ("[nl_sql]", "Question-to-SQL pipeline"),
            ("llm_mode", "Completion backend: openai, local, auto (default: auto, env LLM_MODE)"),
            ("", ""),
            ("# OpenAI Configuration", ""),
            ("openai_api_key", "OpenAI API key (or use OPENAI_API_KEY env var)"),
            ("openai_model", "Model name (default: gpt-3.5-turbo, env OPENAI_MODEL)"),
            ("openai_base_url", "Base URL (default: https://api.openai.com/v1)"),
            ("", ""),
            ("# Ollama Configuration (local models)", ""),
            ("ollama_base_url", "Ollama server URL (default: http://localhost:11434)"),
            ("ollama_model", "Model name (default: tinyllama, env OLLAMA_MODEL)"),
            ("", ""),
            ("# Generation Parameters", ""),
            ("temperature", "Sampling temperature (default: 0.1)"),
            ("max_tokens", "Maximum tokens to generate (default: 300)"),
            ("timeout_seconds", "Backend request timeout in seconds (default: 30)"),
            ("max_sql_length", "Generated SQL is truncated beyond this many characters (default: 1000)"),
            ("default_language", "Question language when not given: en or tr (default: en)"),
            ("", ""),
            ("[nl_sql.retrieval]", ""),
            ("mode", "keyword, embedding or hybrid (default: hybrid, env RETRIEVAL_MODE)"),
            ("top_k", "Schema snippets handed to generation (default: 3)"),
            ("hybrid_alpha", "Semantic weight in hybrid mode (default: 0.7)"),
            ("embedding_model", "Embedding model name (default: text-embedding-3-small)"),
            ("use_entity_hints", "Boost tables named by extracted entities (default: true)"),
            ("", ""),
            ("[nl_sql.entities]", ""),
            ("backend", "gazetteer, http or disabled (default: gazetteer)"),
            ("service_url", "NER service base URL for the http backend"),
            ("mask_strategy", "placeholder, full or partial (default: placeholder)"),
            ("desired_labels", "Entity labels returned as hints"),
            ("sensitive_labels", "Entity labels masked before generation"),
            ("", ""),
            ("[nl_sql.security]", ""),
            ("allowed_tables", "Tables generated SQL may reference (env ALLOWED_TABLES, comma-separated)"),
            ("resolve_aliases", "Accept bare nouns such as 'admission' as their canonical table (default: false)"),
            ("extra_typos", "Additional misspelling = canonical table entries"),
            ("extra_aliases", "Additional noun = canonical table entries"),
            ("", ""),
            ("[nl_sql.summarizer]", ""),
            ("use_llm", "Summarise results with the completion backend (default: true)"),
            ("max_tokens", "Summary token budget (default: 300)"),
            ("temperature", "Summary temperature (default: 0.3)"),
            ("max_rows", "Rows shown to the model (default: 10)"),
            ("", ""),
            ("# Caching", ""),
            ("cache_enabled", "Cache model-generated SQL (default: true)"),
            ("cache_ttl_seconds", "Cache entry lifetime (default: 3600)"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = NlSqlConfig::default();
        assert_eq!(config.llm_mode, LlmMode::Auto);
        assert_eq!(config.max_tokens, 300);
        assert_eq!(config.temperature, 0.1);
        assert_eq!(config.max_sql_length, 1000);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.mode, RetrievalMode::Hybrid);
        assert_eq!(config.security.allowed_tables.len(), 8);
        assert!(!config.security.resolve_aliases);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = NlSqlConfig::default();

        config.temperature = 3.0;
        assert!(config.validate().is_err());
        config.temperature = 0.5;
        assert!(config.validate().is_ok());

        config.retrieval.hybrid_alpha = 1.5;
        assert!(config.validate().is_err());
        config.retrieval.hybrid_alpha = 0.7;

        config.ollama_base_url = "not a url".to_string();
        assert!(config.validate().is_err());
        config.ollama_base_url = "http://localhost:11434".to_string();

        config.entities.backend = EntityBackendKind::Http;
        assert!(config.validate().is_err());
        config.entities.service_url = Some("http://localhost:8080".to_string());
        assert!(config.validate().is_ok());

        config.security.allowed_tables.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_from_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_MODEL", "gpt-4"),
            ("OLLAMA_MODEL", "gemma3:4b"),
            ("LLM_MODE", "LOCAL"),
            ("RETRIEVAL_MODE", "keyword"),
            ("ALLOWED_TABLES", " json_patients , json_admissions ,,"),
            ("DEFAULT_LANGUAGE", "tr"),
        ]);

        let mut config = NlSqlConfig::default();
        config.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.openai_model, "gpt-4");
        assert_eq!(config.ollama_model, "gemma3:4b");
        assert_eq!(config.llm_mode, LlmMode::Local);
        assert_eq!(config.retrieval.mode, RetrievalMode::Keyword);
        assert_eq!(
            config.security.allowed_tables,
            vec!["json_patients", "json_admissions"]
        );
        assert_eq!(config.default_language, "tr");
    }

    #[test]
    fn test_unknown_override_values_are_ignored() {
        let mut config = NlSqlConfig::default();
        config.apply_overrides_from(|k| match k {
            "LLM_MODE" => Some("quantum".to_string()),
            "ALLOWED_TABLES" => Some(" , ".to_string()),
            _ => None,
        });
        assert_eq!(config.llm_mode, LlmMode::Auto);
        assert_eq!(config.security.allowed_tables.len(), 8);
    }

    #[test]
    fn test_toml_round_trip_with_partial_sections() {
        let parsed: NlSqlConfig = toml::from_str(
            r#"
            llm_mode = "openai"
            [retrieval]
            mode = "embedding"
            [security]
            resolve_aliases = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.llm_mode, LlmMode::OpenAi);
        assert_eq!(parsed.retrieval.mode, RetrievalMode::Embedding);
        assert_eq!(parsed.retrieval.top_k, 3);
        assert!(parsed.security.resolve_aliases);
        assert_eq!(parsed.security.allowed_tables.len(), 8);
    }
}
