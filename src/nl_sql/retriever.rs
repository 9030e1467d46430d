//! Schema retrieval: keyword, embedding and hybrid ranking
//!
//! Retrieval never fails. Embedding errors degrade to a bag-of-words vector over
//! the current batch, and anything unusable after that degrades to keyword mode.

use crate::nl_sql::embedding::{EmbeddingProvider, bag_of_words_vectors, cosine_similarity, tokenize};
use crate::nl_sql::schema::{SchemaIndex, SchemaSnippet};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ranking strategy
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RetrievalMode {
    /// Token overlap with a synonym-expanded question
    Keyword,
    /// Cosine similarity of embeddings
    Embedding,
    /// Weighted blend of both, aggregated per table
    Hybrid,
}

impl Default for RetrievalMode {
    fn default() -> Self {
        Self::Hybrid
    }
}

/// Bilingual domain vocabulary mapped to canonical table/column hints
const SYNONYMS: &[(&[&str], &str)] = &[
    (&["patient", "patients", "hasta", "hastalar"], "json_patients subject_id"),
    (&["admission", "admissions", "yatış", "yatışlar"], "json_admissions hadm_id admittime"),
    (&["discharge", "çıkış", "taburcu"], "dischtime discharge_location"),
    (&["doctor", "doktor", "provider", "personel", "hekim"], "json_providers provider_id"),
    (&["transfer", "transferler"], "json_transfers"),
    (&["careunit", "unit", "servis", "birim", "bölüm", "klinik"], "careunit json_careunits"),
    (&["age", "yaş"], "anchor_age"),
    (&["gender", "sex", "cinsiyet"], "gender"),
    (&["insurance", "sigorta"], "insurance json_insurance"),
    (&["diagnosis", "diagnoses", "tanı", "teşhis"], "json_diagnoses icd_code"),
    (&["lab", "laboratuvar", "test"], "json_lab"),
    (&["race", "ırk"], "race"),
    (&["death", "ölüm"], "dod"),
    (&["year", "yıl"], "anchor_year"),
    (&["emergency", "acil"], "admission_type"),
];

/// Shortest synonym that also matches inflected forms by prefix
pub(crate) const PREFIX_MATCH_MIN_CHARS: usize = 5;

/// Score added to every snippet of a table named by an entity hint
const ENTITY_BOOST: f32 = 0.5;

/// Canonical hints for one question word
pub fn synonym_hints(word: &str) -> Vec<&'static str> {
    let word = word.to_lowercase();
    SYNONYMS
        .iter()
        .filter(|(keys, _)| {
            keys.iter().any(|key| {
                word == *key
                    || (key.chars().count() >= PREFIX_MATCH_MIN_CHARS && word.starts_with(key))
            })
        })
        .flat_map(|(_, hints)| hints.split_whitespace())
        .collect()
}

/// Question tokens plus the hints of every synonym they match
pub fn expand_query(question: &str) -> BTreeSet<String> {
    let mut expanded = BTreeSet::new();
    for token in tokenize(question) {
        for hint in synonym_hints(&token) {
            expanded.insert(hint.to_string());
        }
        expanded.insert(token);
    }
    expanded
}

/// Entity-derived signals used to favour tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalHints {
    /// Column names named by identifier/date entities (e.g. `subject_id`)
    pub columns: Vec<String>,
    /// Domain vocabulary found in the question
    pub terms: Vec<String>,
}

impl RetrievalHints {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.terms.is_empty()
    }

    /// Tables with at least one snippet mentioning a hinted column or synonym
    fn boosted_tables(&self, index: &SchemaIndex) -> HashSet<String> {
        let mut wanted: HashSet<String> = self.columns.iter().map(|c| c.to_lowercase()).collect();
        for term in &self.terms {
            wanted.extend(synonym_hints(term).into_iter().map(str::to_string));
        }
        if wanted.is_empty() {
            return HashSet::new();
        }

        index
            .snippets()
            .iter()
            .filter(|s| {
                let table = s.table.to_lowercase();
                wanted.contains(&table)
                    || s.column
                        .as_ref()
                        .is_some_and(|c| wanted.contains(&c.to_lowercase()))
            })
            .map(|s| s.table.clone())
            .collect()
    }
}

/// Ranks schema snippets for a question
pub struct Retriever {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    hybrid_alpha: f32,
}

impl Retriever {
    /// `embedder = None` means semantic scores always come from the bag-of-words fallback
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>, hybrid_alpha: f32) -> Self {
        Self {
            embedder,
            hybrid_alpha: hybrid_alpha.clamp(0.0, 1.0),
        }
    }

    /// Top `top_k` snippets for `question`.
    ///
    /// Returns at least `min(top_k, index.len())` snippets.
    pub async fn retrieve(
        &self,
        index: &SchemaIndex,
        question: &str,
        top_k: usize,
        mode: RetrievalMode,
        hints: &RetrievalHints,
    ) -> Vec<SchemaSnippet> {
        if index.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let boosted = hints.boosted_tables(index);
        if !boosted.is_empty() {
            debug!("Entity hints boost tables: {:?}", boosted);
        }

        let results = match mode {
            RetrievalMode::Keyword => Some(self.keyword(index, question, top_k, &boosted)),
            RetrievalMode::Embedding => self.embedding(index, question, top_k, &boosted).await,
            RetrievalMode::Hybrid => self.hybrid(index, question, top_k, &boosted).await,
        };

        let results = match results {
            Some(found) => found,
            None => {
                warn!("{} retrieval unavailable, falling back to keyword", mode);
                self.keyword(index, question, top_k, &boosted)
            }
        };

        info!("Retrieved {} schema snippets ({} mode)", results.len(), mode);
        results
    }

    fn keyword(
        &self,
        index: &SchemaIndex,
        question: &str,
        top_k: usize,
        boosted: &HashSet<String>,
    ) -> Vec<SchemaSnippet> {
        let scores = keyword_scores(index, question);
        if scores.iter().all(|s| *s == 0) && boosted.is_empty() {
            debug!("No keyword overlap, returning first {} snippets", top_k);
            return index.snippets().iter().take(top_k).cloned().collect();
        }

        let scored: Vec<(usize, f32)> = scores
            .iter()
            .enumerate()
            .map(|(i, s)| (i, *s as f32 + boost(&index.snippets()[i], boosted)))
            .collect();
        take_ranked(index, scored, top_k)
    }

    /// Semantic score per snippet; `None` when no usable vectors could be produced
    async fn semantic_scores(&self, index: &SchemaIndex, question: &str) -> Option<Vec<f32>> {
        let mut texts = Vec::with_capacity(index.len() + 1);
        texts.push(question.to_string());
        texts.extend(index.snippets().iter().map(SchemaSnippet::search_text));

        let vectors = match &self.embedder {
            Some(embedder) => match embedder.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(
                        "Embedding backend {} failed ({}), using bag-of-words vectors",
                        embedder.name(),
                        e
                    );
                    bag_of_words_vectors(&texts)
                }
            },
            None => bag_of_words_vectors(&texts),
        };

        if vectors.len() != texts.len() {
            return None;
        }
        let (query, candidates) = vectors.split_first()?;
        Some(candidates.iter().map(|v| cosine_similarity(query, v)).collect())
    }

    async fn embedding(
        &self,
        index: &SchemaIndex,
        question: &str,
        top_k: usize,
        boosted: &HashSet<String>,
    ) -> Option<Vec<SchemaSnippet>> {
        let semantic = self.semantic_scores(index, question).await?;
        let scored: Vec<(usize, f32)> = semantic
            .into_iter()
            .enumerate()
            .map(|(i, s)| (i, s + boost(&index.snippets()[i], boosted)))
            .collect();
        Some(take_ranked(index, scored, top_k))
    }

    async fn hybrid(
        &self,
        index: &SchemaIndex,
        question: &str,
        top_k: usize,
        boosted: &HashSet<String>,
    ) -> Option<Vec<SchemaSnippet>> {
        let semantic = self.semantic_scores(index, question).await?;
        let keyword = keyword_scores(index, question);
        let alpha = self.hybrid_alpha;

        let combined: Vec<f32> = semantic
            .iter()
            .zip(&keyword)
            .zip(index.snippets())
            .map(|((sem, kw), snippet)| {
                let hit = if *kw > 0 { 1.0 } else { 0.0 };
                alpha * sem + (1.0 - alpha) * hit + boost(snippet, boosted)
            })
            .collect();

        // Best snippet score per table, tables kept in catalog order
        let mut table_order: Vec<&str> = Vec::new();
        let mut table_best: HashMap<&str, f32> = HashMap::new();
        for (snippet, score) in index.snippets().iter().zip(&combined) {
            let entry = table_best.entry(snippet.table.as_str()).or_insert_with(|| {
                table_order.push(snippet.table.as_str());
                f32::MIN
            });
            *entry = entry.max(*score);
        }

        let mut tables: Vec<(&str, f32)> = table_order
            .iter()
            .map(|t| (*t, table_best.get(t).copied().unwrap_or(f32::MIN)))
            .collect();
        tables.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let mut results: Vec<SchemaSnippet> = tables
            .iter()
            .filter_map(|(table, _)| index.table_summary(table).cloned())
            .take(top_k)
            .collect();

        // Fewer tables than requested: fill with the best column snippets
        let wanted = top_k.min(index.len());
        if results.len() < wanted {
            let scored: Vec<(usize, f32)> = combined
                .iter()
                .enumerate()
                .filter(|(i, _)| !index.snippets()[*i].is_table_summary())
                .map(|(i, s)| (i, *s))
                .collect();
            let extra = take_ranked(index, scored, wanted - results.len());
            results.extend(extra);
        }

        debug!(
            "Hybrid retrieval ranked {} tables (alpha = {})",
            tables.len(),
            alpha
        );
        Some(results)
    }
}

fn keyword_scores(index: &SchemaIndex, question: &str) -> Vec<usize> {
    let query = expand_query(question);
    index
        .snippets()
        .iter()
        .map(|snippet| {
            let tokens: HashSet<String> = tokenize(&snippet.search_text()).into_iter().collect();
            query.iter().filter(|t| tokens.contains(*t)).count()
        })
        .collect()
}

fn boost(snippet: &SchemaSnippet, boosted: &HashSet<String>) -> f32 {
    if boosted.contains(&snippet.table) {
        ENTITY_BOOST
    } else {
        0.0
    }
}

/// Highest scores first; equal scores keep catalog order
fn take_ranked(index: &SchemaIndex, mut scored: Vec<(usize, f32)>, top_k: usize) -> Vec<SchemaSnippet> {
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored
        .into_iter()
        .take(top_k)
        .map(|(i, _)| index.snippets()[i].clone())
        .collect()
}
