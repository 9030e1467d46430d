//! Embedding backends and the deterministic bag-of-words fallback

use crate::nl_sql::error::{NlSqlError, NlSqlResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Source of dense text vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input text, in input order
    async fn embed_batch(&self, texts: &[String]) -> NlSqlResult<Vec<Vec<f32>>>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// OpenAI `/embeddings` client
pub struct OpenAiEmbedder {
    api_key: String,
    base_url: String,
    model: String,
    timeout_secs: u64,
    client: Client,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String, timeout_secs: u64) -> NlSqlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> NlSqlResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&OpenAiEmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| NlSqlError::from_request(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NlSqlError::EmbeddingError(format!(
                "OpenAI embeddings error ({status}): {error_text}"
            )));
        }

        let mut parsed: OpenAiEmbeddingResponse = response.json().await.map_err(|e| {
            NlSqlError::EmbeddingError(format!("Failed to parse OpenAI embeddings: {e}"))
        })?;
        parsed.data.sort_by_key(|d| d.index);

        if parsed.data.len() != texts.len() {
            return Err(NlSqlError::EmbeddingError(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Ollama `/api/embeddings` client; the endpoint takes one text per call
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    timeout_secs: u64,
    client: Client,
}

impl OllamaEmbedder {
    pub fn new(base_url: String, model: String, timeout_secs: u64) -> NlSqlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> NlSqlResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let response = self
                .client
                .post(format!("{}/api/embeddings", self.base_url))
                .json(&OllamaEmbeddingRequest {
                    model: &self.model,
                    prompt: text,
                })
                .send()
                .await
                .map_err(|e| NlSqlError::from_request(e, self.timeout_secs))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(NlSqlError::EmbeddingError(format!(
                    "Ollama embeddings error ({status}): {error_text}"
                )));
            }

            let parsed: OllamaEmbeddingResponse = response.json().await.map_err(|e| {
                NlSqlError::EmbeddingError(format!("Failed to parse Ollama embedding: {e}"))
            })?;
            if parsed.embedding.is_empty() {
                return Err(NlSqlError::EmbeddingError(format!(
                    "model '{}' returned an empty embedding",
                    self.model
                )));
            }
            vectors.push(parsed.embedding);
        }
        Ok(vectors)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// Case-folded alphanumeric spans (`_` counts as a word character)
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Degraded embedding: term-count vectors over the vocabulary of this batch, L2-normalized.
///
/// Deterministic for a given batch, so rankings are reproducible within one call.
pub fn bag_of_words_vectors(texts: &[String]) -> Vec<Vec<f32>> {
    let tokenized: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();

    let mut vocabulary: BTreeMap<&str, usize> = BTreeMap::new();
    for tokens in &tokenized {
        for token in tokens {
            vocabulary.entry(token.as_str()).or_insert(0);
        }
    }
    for (position, slot) in vocabulary.values_mut().enumerate() {
        *slot = position;
    }

    let vectors = tokenized
        .iter()
        .map(|tokens| {
            let mut vector = vec![0.0f32; vocabulary.len()];
            for token in tokens {
                if let Some(&i) = vocabulary.get(token.as_str()) {
                    vector[i] += 1.0;
                }
            }
            l2_normalize(&mut vector);
            vector
        })
        .collect();

    debug!(
        "Bag-of-words fallback: {} texts, vocabulary of {}",
        texts.len(),
        vocabulary.len()
    );
    vectors
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity; 0.0 when either vector is zero or the lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
