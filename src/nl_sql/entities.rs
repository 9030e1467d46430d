//! Entity extraction and de-identification of questions
//!
//! A [`NerBackend`] finds named entities; sensitive ones are masked in the text
//! handed to generation, desired ones are returned as hints. Regex passes add
//! email/phone masking and key=value identifier extraction that do not depend
//! on the recognizer.

use crate::nl_sql::error::{NlSqlError, NlSqlResult};
use crate::nl_sql::retriever::{PREFIX_MATCH_MIN_CHARS, RetrievalHints};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::ops::Range;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_DESIRED_LABELS: &[&str] = &["PERSON", "ORG", "LOCATION", "DATE", "TIME", "EVENT"];

pub const DEFAULT_SENSITIVE_LABELS: &[&str] = &[
    "PERSON", "PER", "GPE", "LOC", "LOCATION", "EMAIL", "PHONE", "CARD", "MONEY",
];

const DOMAIN_KEYWORDS: &[&str] = &[
    // English
    "patient", "hospital", "admission", "discharge", "doctor", "provider", "diagnosis", "disease",
    "subject_id", "hadm_id", "provider_id", "transfer", "careunit", "insurance", "age", "gender",
    "admittime", "dischtime",
    // Turkish
    "hasta", "hastane", "yatış", "çıkış", "doktor", "personel", "tanı", "hastalık",
];

/// Labels rendered under "Identifiers/Times" in the context block
const IDENTIFIER_LABELS: &[&str] = &["SUBJECT_ID", "HADM_ID", "PROVIDER_ID", "ADMITTIME", "DISCHTIME"];

pub const DOMAIN_TERM: &str = "DOMAIN_TERM";

static IDENTIFIER_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(subject_id|hadm_id|provider_id)\b\s*[:=#-]?\s*([A-Za-z0-9_-]{1,64})")
        .expect("identifier field regex")
});

static DATE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(admittime|dischtime)\b\s*[:=#-]?\s*([0-9T:\-\s/]{5,25})").expect("date field regex")
});

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[\w.+-]+@[\w-]+\.[\w.-]+\b").expect("email regex"));

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?:\+\d{1,3}[\s-]?)?(?:\(?\d{2,4}\)?[\s-]?)?\d{3}[\s-]?\d{2,4}[\s-]?\d{2,4})")
        .expect("phone regex")
});

static MASK_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\[\]]*\]").expect("mask token regex"));

/// How sensitive values are replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MaskStrategy {
    /// `[LABEL_<hash>]`, stable for equal values
    Placeholder,
    /// `[LABEL]`
    Full,
    /// Keeps a short prefix
    Partial,
}

impl Default for MaskStrategy {
    fn default() -> Self {
        Self::Placeholder
    }
}

/// Replacement text for a sensitive value
pub fn mask_value(label: &str, value: &str, strategy: MaskStrategy) -> String {
    match strategy {
        MaskStrategy::Placeholder => {
            let digest = hex::encode(Sha256::digest(value.as_bytes()));
            format!("[{}_{}]", label, &digest[..6])
        }
        MaskStrategy::Full => format!("[{label}]"),
        MaskStrategy::Partial => match value.split_once('@') {
            Some((name, domain)) => {
                let first: String = name.chars().take(1).collect();
                format!("{first}***@{domain}")
            }
            None => {
                let prefix: String = value.chars().take(2).collect();
                format!("{prefix}***")
            }
        },
    }
}

/// Map recognizer-specific labels onto one vocabulary
pub fn normalize_label(label: &str) -> String {
    match label {
        "GPE" | "LOC" => "LOCATION".to_string(),
        "NORP" => "GROUP".to_string(),
        "PER" => "PERSON".to_string(),
        other => other.to_string(),
    }
}

/// Entity reported by a recognizer; offsets count characters, not bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizedEntity {
    pub text: String,
    pub label: String,
    pub start: usize,
    pub end: usize,
}

/// Named-entity recognizer for one language
#[async_trait]
pub trait NerBackend: Send + Sync {
    async fn recognize(&self, text: &str) -> NlSqlResult<Vec<RecognizedEntity>>;

    fn language(&self) -> &str;

    fn name(&self) -> &str;
}

/// Entity found in a question
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub label: String,
    pub value: String,
    /// Byte range in the raw question, when known
    #[serde(skip)]
    pub span: Option<Range<usize>>,
    /// Replacement used wherever the value would leave the process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masked: Option<String>,
}

impl Entity {
    fn hint(label: &str, value: &str, span: Option<Range<usize>>) -> Self {
        Self {
            label: label.to_string(),
            value: value.to_string(),
            span,
            masked: None,
        }
    }

    /// Value safe to place in a prompt
    pub fn prompt_value(&self) -> &str {
        self.masked.as_deref().unwrap_or(&self.value)
    }

    pub fn is_domain_term(&self) -> bool {
        self.label == DOMAIN_TERM
    }
}

/// Output of [`EntityExtractor::extract`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionResult {
    pub sanitized_text: String,
    pub entities: Vec<Entity>,
}

impl ExtractionResult {
    /// Plain pass-through used when extraction is explicitly disabled
    pub fn passthrough(text: &str) -> Self {
        Self {
            sanitized_text: text.to_string(),
            entities: Vec::new(),
        }
    }

    pub fn hints(&self) -> RetrievalHints {
        let mut hints = RetrievalHints::default();
        for entity in &self.entities {
            if entity.is_domain_term() {
                hints.terms.push(entity.value.clone());
            } else if IDENTIFIER_LABELS.contains(&entity.label.as_str()) {
                let column = entity.label.to_lowercase();
                if !hints.columns.contains(&column) {
                    hints.columns.push(column);
                }
            }
        }
        hints
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    pub mask_strategy: MaskStrategy,
    pub desired_labels: HashSet<String>,
    pub sensitive_labels: HashSet<String>,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            mask_strategy: MaskStrategy::Placeholder,
            desired_labels: DEFAULT_DESIRED_LABELS.iter().map(|s| s.to_string()).collect(),
            sensitive_labels: DEFAULT_SENSITIVE_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Recognizer plus masking policy
pub struct EntityExtractor {
    backend: Box<dyn NerBackend>,
    options: ExtractorOptions,
}

impl std::fmt::Debug for EntityExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityExtractor")
            .field("backend", &self.backend.name())
            .field("language", &self.backend.language())
            .field("options", &self.options)
            .finish()
    }
}

impl EntityExtractor {
    /// Fails when no recognizer is available; absence of a model is never a silent no-op
    pub fn new(backend: Option<Box<dyn NerBackend>>, options: ExtractorOptions) -> NlSqlResult<Self> {
        let backend = backend.ok_or_else(|| {
            NlSqlError::ModelUnavailable("no named-entity recognizer is configured".to_string())
        })?;
        info!(
            "Entity extractor ready: {} ({})",
            backend.name(),
            backend.language()
        );
        Ok(Self { backend, options })
    }

    pub fn language(&self) -> &str {
        self.backend.language()
    }

    pub async fn extract(&self, text: &str) -> NlSqlResult<ExtractionResult> {
        let mut recognized = self.backend.recognize(text).await?;
        recognized.sort_by_key(|e| (e.start, std::cmp::Reverse(e.end)));

        let mut entities = Vec::new();
        let mut sanitized = String::with_capacity(text.len());
        let mut cursor = 0;

        for ent in recognized {
            let label = normalize_label(&ent.label);
            let Some(span) = char_span_to_bytes(text, ent.start, ent.end) else {
                debug!("Ignoring entity with invalid offsets: {:?}", ent);
                continue;
            };
            let value = &text[span.clone()];
            let sensitive = self.options.sensitive_labels.contains(&label)
                || self.options.sensitive_labels.contains(&ent.label);

            let masked = if sensitive && span.start >= cursor {
                let masked = mask_value(&label, value, self.options.mask_strategy);
                sanitized.push_str(&text[cursor..span.start]);
                sanitized.push_str(&masked);
                cursor = span.end;
                Some(masked)
            } else if sensitive {
                // Overlaps an already masked span
                Some(mask_value(&label, value, self.options.mask_strategy))
            } else {
                None
            };

            if self.options.desired_labels.contains(&label) {
                entities.push(Entity {
                    label,
                    value: value.to_string(),
                    span: Some(span),
                    masked,
                });
            }
        }
        sanitized.push_str(&text[cursor..]);

        let sanitized = mask_pii(&sanitized, self.options.mask_strategy);
        entities.extend(domain_entities(text));

        debug!(
            "Extracted {} entities ({} backend)",
            entities.len(),
            self.backend.name()
        );
        Ok(ExtractionResult {
            sanitized_text: sanitized,
            entities,
        })
    }
}

fn char_span_to_bytes(text: &str, start: usize, end: usize) -> Option<Range<usize>> {
    if start >= end {
        return None;
    }
    let mut indices = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len()));
    let start_byte = indices.nth(start)?;
    let end_byte = indices.nth(end - start - 1)?;
    Some(start_byte..end_byte)
}

fn byte_to_char_offset(text: &str, byte: usize) -> usize {
    text[..byte].chars().count()
}

/// Mask emails and phone-like digit runs.
///
/// Existing `[...]` placeholders and key=value identifier spans are left untouched.
pub fn mask_pii(text: &str, strategy: MaskStrategy) -> String {
    let emails_masked = EMAIL.replace_all(text, |caps: &regex::Captures| {
        mask_value("EMAIL", &caps[0], strategy)
    });

    let protected: Vec<Range<usize>> = MASK_TOKEN
        .find_iter(&emails_masked)
        .map(|m| m.range())
        .chain(IDENTIFIER_FIELD.find_iter(&emails_masked).map(|m| m.range()))
        .chain(DATE_FIELD.find_iter(&emails_masked).map(|m| m.range()))
        .collect();

    let mut out = String::with_capacity(emails_masked.len());
    let mut last = 0;
    for m in PHONE.find_iter(&emails_masked) {
        let overlaps = protected
            .iter()
            .any(|p| m.start() < p.end && p.start < m.end());
        if overlaps {
            continue;
        }
        out.push_str(&emails_masked[last..m.start()]);
        out.push_str(&mask_value("PHONE", m.as_str(), strategy));
        last = m.end();
    }
    out.push_str(&emails_masked[last..]);
    out
}

/// Domain vocabulary, identifiers and date fields found without the recognizer
pub fn domain_entities(text: &str) -> Vec<Entity> {
    let mut results = Vec::new();
    let tokens: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let hits: BTreeSet<&str> = tokens.iter().filter_map(|t| domain_keyword(t)).collect();
    results.extend(hits.into_iter().map(|kw| Entity::hint(DOMAIN_TERM, kw, None)));

    for caps in IDENTIFIER_FIELD.captures_iter(text) {
        if let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) {
            results.push(Entity::hint(
                &key.as_str().to_uppercase(),
                value.as_str(),
                Some(value.range()),
            ));
        }
    }

    for caps in DATE_FIELD.captures_iter(text) {
        if let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) {
            results.push(Entity::hint(
                &key.as_str().to_uppercase(),
                value.as_str().trim(),
                Some(value.range()),
            ));
        }
    }

    results
}

/// Longest keyword naming `token`; short keywords must match the whole token
fn domain_keyword(token: &str) -> Option<&'static str> {
    DOMAIN_KEYWORDS
        .iter()
        .copied()
        .filter(|kw| {
            *kw == token || (kw.chars().count() >= PREFIX_MATCH_MIN_CHARS && token.starts_with(kw))
        })
        .max_by_key(|kw| kw.len())
}

/// Render entities for the generation prompt; `None` when there is nothing to say
pub fn context_block(entities: &[Entity]) -> Option<String> {
    if entities.is_empty() {
        return None;
    }

    let domain_terms: BTreeSet<&str> = entities
        .iter()
        .filter(|e| e.is_domain_term())
        .map(|e| e.value.as_str())
        .collect();

    let mut ids = Vec::new();
    let mut others = Vec::new();
    for entity in entities.iter().filter(|e| !e.is_domain_term()) {
        let line = format!("- {}: {}", entity.label, entity.prompt_value());
        if IDENTIFIER_LABELS.contains(&entity.label.as_str()) {
            ids.push(line);
        } else {
            others.push(line);
        }
    }

    let mut blocks = Vec::new();
    if !domain_terms.is_empty() {
        blocks.push(format!(
            "Domain terms: {}",
            domain_terms.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }
    if !ids.is_empty() {
        blocks.push(format!("Identifiers/Times:\n{}", ids.join("\n")));
    }
    if !others.is_empty() {
        blocks.push(format!("Other entities:\n{}", others.join("\n")));
    }

    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n\n"))
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct NerRequest<'a> {
    text: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct NerResponse {
    entities: Vec<RecognizedEntity>,
}

/// External NER service exposing `GET /health` and `POST /ner`
pub struct HttpNerBackend {
    base_url: String,
    language: String,
    timeout_secs: u64,
    client: Client,
}

impl HttpNerBackend {
    /// Connect and verify the service answers its health check
    pub async fn connect(base_url: &str, language: &str, timeout_secs: u64) -> NlSqlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let health = client
            .get(format!("{base_url}/health"))
            .send()
            .await
            .map_err(|e| {
                NlSqlError::ModelUnavailable(format!("NER service at {base_url} is unreachable: {e}"))
            })?;
        if !health.status().is_success() {
            return Err(NlSqlError::ModelUnavailable(format!(
                "NER service at {base_url} reported {}",
                health.status()
            )));
        }

        Ok(Self {
            base_url,
            language: language.to_string(),
            timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl NerBackend for HttpNerBackend {
    async fn recognize(&self, text: &str) -> NlSqlResult<Vec<RecognizedEntity>> {
        let response = self
            .client
            .post(format!("{}/ner", self.base_url))
            .json(&NerRequest {
                text,
                language: &self.language,
            })
            .send()
            .await
            .map_err(|e| NlSqlError::from_request(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NlSqlError::ApiError {
                status_code: status.as_u16(),
                message,
            });
        }

        let parsed: NerResponse = response.json().await?;
        Ok(parsed.entities)
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// Gazetteer backend
// ---------------------------------------------------------------------------

const MONTHS_EN: &str = "January|February|March|April|May|June|July|August|September|October|November|December";
const MONTHS_TR: &str = "Ocak|Şubat|Mart|Nisan|Mayıs|Haziran|Temmuz|Ağustos|Eylül|Ekim|Kasım|Aralık";
const WEEKDAYS_EN: &str = "Monday|Tuesday|Wednesday|Thursday|Friday|Saturday|Sunday";
const WEEKDAYS_TR: &str = "Pazartesi|Salı|Çarşamba|Perşembe|Cuma|Cumartesi|Pazar";

const PLACES_EN: &[&str] = &[
    "New York", "Boston", "Chicago", "London", "Paris", "Berlin", "Istanbul", "Ankara", "Izmir",
    "Turkey", "Germany", "France", "England", "USA", "United States", "Canada",
];
const PLACES_TR: &[&str] = &[
    "İstanbul", "Istanbul", "Ankara", "İzmir", "Izmir", "Bursa", "Antalya", "Adana", "Konya",
    "Trabzon", "Türkiye", "Almanya", "Fransa", "İngiltere", "Amerika", "Londra", "Paris",
];

/// One recognition rule: pattern, label, capture group holding the entity
struct Rule {
    pattern: Regex,
    label: &'static str,
    group: usize,
}

/// In-process dictionary and pattern recognizer for English and Turkish
pub struct GazetteerNerBackend {
    language: String,
    rules: Vec<Rule>,
}

impl GazetteerNerBackend {
    pub fn new(language: &str) -> NlSqlResult<Self> {
        let lang = language.to_lowercase();
        let sources: Vec<(String, &'static str, usize)> = if lang.starts_with("en") {
            vec![
                (
                    r"\b(?:Dr|Mr|Mrs|Ms|Prof)\.?\s+(\p{Lu}\p{Ll}+(?:\s+\p{Lu}\p{Ll}+)?)".to_string(),
                    "PERSON",
                    1,
                ),
                (places_pattern(PLACES_EN), "GPE", 0),
                (
                    r"\b((?:\p{Lu}[\w&]*\s+)+(?:Hospital|Clinic|University|Medical Center|Inc|Ltd))\b".to_string(),
                    "ORG",
                    1,
                ),
                (
                    format!(r"\b((?:\d{{1,2}}\s+)?(?:{MONTHS_EN})(?:\s+\d{{1,2}})?(?:,?\s+\d{{4}})?)\b"),
                    "DATE",
                    1,
                ),
                (r"\b(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4})\b".to_string(), "DATE", 1),
                (r"(?i)\b(yesterday|today|tomorrow|last (?:week|month|year))\b".to_string(), "DATE", 1),
                (format!(r"\b({WEEKDAYS_EN})\b"), "DATE", 1),
                (r"\b(\d{1,2}:\d{2}(?::\d{2})?(?:\s?[ap]m)?)\b".to_string(), "TIME", 1),
            ]
        } else if lang.starts_with("tr") {
            vec![
                (
                    r"\b(?:Dr|Doç|Prof|Sayın|Bay|Bayan)\.?\s+(\p{Lu}\p{Ll}+(?:\s+\p{Lu}\p{Ll}+)?)".to_string(),
                    "PER",
                    1,
                ),
                (r"\b(\p{Lu}\p{Ll}+)\s+(?:Bey|Hanım)\b".to_string(), "PER", 1),
                (places_pattern(PLACES_TR), "LOC", 0),
                (
                    r"\b((?:\p{Lu}[\w&]*\s+)+(?:Hastanesi|Kliniği|Üniversitesi|A\.Ş\.))".to_string(),
                    "ORG",
                    1,
                ),
                (
                    format!(r"\b((?:\d{{1,2}}\s+)?(?:{MONTHS_TR})(?:\s+\d{{4}})?)\b"),
                    "DATE",
                    1,
                ),
                (r"\b(\d{4}-\d{2}-\d{2}|\d{1,2}[./]\d{1,2}[./]\d{2,4})\b".to_string(), "DATE", 1),
                (r"(?i)\b(dün|bugün|yarın|geçen (?:hafta|ay|yıl))\b".to_string(), "DATE", 1),
                (format!(r"\b({WEEKDAYS_TR})\b"), "DATE", 1),
                (r"\b(\d{1,2}:\d{2}(?::\d{2})?)\b".to_string(), "TIME", 1),
            ]
        } else {
            return Err(NlSqlError::ModelUnavailable(format!(
                "no built-in recognizer for language '{language}' (supported: en, tr)"
            )));
        };

        let rules = sources
            .into_iter()
            .map(|(pattern, label, group)| {
                Regex::new(&pattern)
                    .map(|pattern| Rule { pattern, label, group })
                    .map_err(|e| NlSqlError::ConfigurationError(format!("recognizer rule: {e}")))
            })
            .collect::<NlSqlResult<Vec<_>>>()?;

        Ok(Self {
            language: lang,
            rules,
        })
    }
}

fn places_pattern(places: &[&str]) -> String {
    let alternatives: Vec<String> = places.iter().map(|p| regex::escape(p)).collect();
    format!(r"\b(?:{})\b", alternatives.join("|"))
}

#[async_trait]
impl NerBackend for GazetteerNerBackend {
    async fn recognize(&self, text: &str) -> NlSqlResult<Vec<RecognizedEntity>> {
        let mut found: Vec<(Range<usize>, &'static str)> = Vec::new();
        for rule in &self.rules {
            for caps in rule.pattern.captures_iter(text) {
                if let Some(m) = caps.get(rule.group) {
                    found.push((m.range(), rule.label));
                }
            }
        }

        // Earliest, then longest, match wins an overlap
        found.sort_by_key(|(r, _)| (r.start, std::cmp::Reverse(r.end)));
        let mut entities: Vec<RecognizedEntity> = Vec::new();
        let mut last_end = 0;
        for (range, label) in found {
            if range.start < last_end {
                continue;
            }
            last_end = range.end;
            entities.push(RecognizedEntity {
                text: text[range.clone()].to_string(),
                label: label.to_string(),
                start: byte_to_char_offset(text, range.start),
                end: byte_to_char_offset(text, range.end),
            });
        }
        Ok(entities)
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn name(&self) -> &str {
        "gazetteer"
    }
}
