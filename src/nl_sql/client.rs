//! Completion backends: OpenAI chat completions, Ollama, and the mode-switching manager

use crate::nl_sql::config::{LlmMode, NlSqlConfig};
use crate::nl_sql::error::{NlSqlError, NlSqlResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for availability checks, independent of the generation timeout
const AVAILABILITY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Reply from a completion backend
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
    /// `<backend>:<model>`
    pub model: String,
    /// Which kind of backend produced the reply
    pub mode: LlmMode,
}

/// Chat-completion style backend
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> NlSqlResult<Completion>;

    fn name(&self) -> &str;

    /// Cheap reachability check
    async fn is_available(&self) -> bool;
}

fn http_client(timeout_secs: u64) -> NlSqlResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| NlSqlError::NetworkError(format!("Failed to create HTTP client: {e}")))
}

async fn api_error(response: reqwest::Response) -> NlSqlError {
    let status_code = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    NlSqlError::ApiError {
        status_code,
        message,
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: String, model: String, timeout_secs: u64) -> NlSqlResult<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout_secs,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> NlSqlResult<Completion> {
        debug!(
            "Calling OpenAI with model: {}, max_tokens: {}, temperature: {}",
            self.model, max_tokens, temperature
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&OpenAiRequest {
                model: &self.model,
                messages,
                max_tokens,
                temperature,
            })
            .send()
            .await
            .map_err(|e| NlSqlError::from_request(e, self.timeout_secs))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| NlSqlError::ProviderError(format!("Failed to parse API response: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| NlSqlError::ProviderError("No content in response".to_string()))?;

        Ok(Completion {
            content: content.trim().to_string(),
            usage: body.usage.unwrap_or_default(),
            model: format!("openai:{}", self.model),
            mode: LlmMode::OpenAi,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }

    async fn is_available(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(AVAILABILITY_TIMEOUT_SECS))
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("OpenAI not reachable: {}", e);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

/// Local Ollama `/api/generate` client
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    timeout_secs: u64,
}

impl OllamaProvider {
    pub fn new(base_url: String, model: String, timeout_secs: u64) -> NlSqlResult<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout_secs,
        })
    }

    /// Flatten role messages into a single completion prompt
    fn format_messages(messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for message in messages {
            let prefix = match message.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            prompt.push_str(&format!("{prefix}: {}\n\n", message.content));
        }
        prompt.push_str("Assistant:");
        prompt
    }
}

fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> NlSqlResult<Completion> {
        let prompt = Self::format_messages(messages);
        debug!("Calling Ollama model {} ({} chars)", self.model, prompt.len());

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&OllamaRequest {
                model: &self.model,
                prompt: &prompt,
                stream: false,
                options: OllamaOptions {
                    num_predict: max_tokens,
                    temperature,
                    top_p: 0.9,
                    top_k: 40,
                    repeat_penalty: 1.1,
                },
            })
            .send()
            .await
            .map_err(|e| NlSqlError::from_request(e, self.timeout_secs))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: OllamaResponse = response
            .json()
            .await
            .map_err(|e| NlSqlError::ProviderError(format!("Failed to parse Ollama response: {e}")))?;
        let content = body.response.trim().to_string();

        // Ollama reports no usage; approximate with word counts
        let usage = TokenUsage::new(word_count(&prompt), word_count(&content));

        Ok(Completion {
            content,
            usage,
            model: format!("ollama:{}", self.model),
            mode: LlmMode::Local,
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }

    async fn is_available(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(AVAILABILITY_TIMEOUT_SECS))
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Ollama server not available: {}", e);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Routes completions to the hosted or local backend according to [`LlmMode`]
pub struct LlmManager {
    mode: LlmMode,
    openai: Option<Arc<dyn CompletionProvider>>,
    local: Option<Arc<dyn CompletionProvider>>,
}

impl LlmManager {
    pub fn new(
        mode: LlmMode,
        openai: Option<Arc<dyn CompletionProvider>>,
        local: Option<Arc<dyn CompletionProvider>>,
    ) -> Self {
        Self { mode, openai, local }
    }

    /// Build both clients from configuration; OpenAI is skipped without an API key
    pub fn from_config(config: &NlSqlConfig) -> NlSqlResult<Self> {
        let openai: Option<Arc<dyn CompletionProvider>> = match config.get_openai_api_key() {
            Some(key) => {
                info!("OpenAI client initialized ({})", config.openai_model);
                Some(Arc::new(OpenAiProvider::new(
                    key,
                    config.openai_base_url.clone(),
                    config.openai_model.clone(),
                    config.timeout_seconds,
                )?))
            }
            None => {
                warn!("No OpenAI API key found");
                None
            }
        };

        let local: Arc<dyn CompletionProvider> = Arc::new(OllamaProvider::new(
            config.ollama_base_url.clone(),
            config.ollama_model.clone(),
            config.timeout_seconds,
        )?);
        info!("Local LLM client initialized ({})", config.ollama_model);

        Ok(Self::new(config.llm_mode, openai, Some(local)))
    }

    pub fn selected_mode(&self) -> LlmMode {
        self.mode
    }

    /// Configured modes; `auto` only when both backends exist
    pub fn available_modes(&self) -> Vec<LlmMode> {
        let mut modes = Vec::new();
        if self.openai.is_some() {
            modes.push(LlmMode::OpenAi);
        }
        if self.local.is_some() {
            modes.push(LlmMode::Local);
        }
        if modes.len() > 1 {
            modes.push(LlmMode::Auto);
        }
        modes
    }

    /// Mode that would serve the next request
    pub async fn effective_mode(&self) -> LlmMode {
        match self.mode {
            LlmMode::Auto => match &self.openai {
                Some(openai) if openai.is_available().await => LlmMode::OpenAi,
                _ => LlmMode::Local,
            },
            explicit => explicit,
        }
    }

    fn client_for(&self, mode: LlmMode) -> Option<&Arc<dyn CompletionProvider>> {
        let (preferred, other) = match mode {
            LlmMode::OpenAi => (&self.openai, &self.local),
            _ => (&self.local, &self.openai),
        };
        preferred.as_ref().or(other.as_ref())
    }
}

#[async_trait]
impl CompletionProvider for LlmManager {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> NlSqlResult<Completion> {
        let effective = self.effective_mode().await;
        let client = self.client_for(effective).ok_or_else(|| {
            NlSqlError::ConfigurationError("No LLM client available".to_string())
        })?;

        debug!("Generating with {} (effective mode {})", client.name(), effective);
        client.complete(messages, max_tokens, temperature).await.map_err(|e| {
            warn!("{} generation failed: {}", client.name(), e);
            e
        })
    }

    fn name(&self) -> &str {
        "manager"
    }

    async fn is_available(&self) -> bool {
        for client in self.openai.iter().chain(self.local.iter()) {
            if client.is_available().await {
                return true;
            }
        }
        false
    }
}
