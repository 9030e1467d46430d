//! TTL cache for model-generated SQL

use crate::nl_sql::config::LlmMode;
use crate::nl_sql::prompt::GenerationConstraints;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cached generation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSql {
    pub sql: String,
    pub model: String,
    pub mode: Option<LlmMode>,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedSql,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: usize,
    misses: usize,
}

/// Hit/miss counters reported by `querybot config` and the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub size: usize,
    pub hit_rate: f64,
}

/// Query cache shared by every request of one engine
pub struct QueryCache {
    state: Mutex<CacheState>,
    default_ttl: Duration,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_ttl(3600)
    }

    pub fn with_ttl(ttl_seconds: u64) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            default_ttl: Duration::from_secs(ttl_seconds),
        }
    }

    /// Key over everything that influences generation
    pub fn key(question: &str, schema_context: &str, constraints: &GenerationConstraints) -> String {
        let mut hasher = Sha256::new();
        hasher.update(question.as_bytes());
        hasher.update([0x1f]);
        hasher.update(schema_context.as_bytes());
        hasher.update([0x1f]);
        hasher.update(constraints.allowed_tables.join(",").as_bytes());
        hasher.update([0x1f]);
        hasher.update(constraints.entity_context.as_deref().unwrap_or("").as_bytes());
        hasher.update([0x1f]);
        hasher.update(constraints.max_sql_length.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<CachedSql> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if state.entries.len() > 100 {
            state.entries.retain(|_, entry| !entry.is_expired());
        }

        let lookup = state
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired()).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => {
                state.hits += 1;
                Some(value)
            }
            Some(None) => {
                state.entries.remove(key);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: CachedSql) {
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl: self.default_ttl,
        };
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.entries.insert(key, entry);
    }

    /// Drop one entry; returns whether it was present
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state = CacheState::default();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let total = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            size: state.entries.len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                state.hits as f64 / total as f64
            },
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(sql: &str) -> CachedSql {
        CachedSql {
            sql: sql.to_string(),
            model: "openai:gpt-3.5-turbo".to_string(),
            mode: Some(LlmMode::OpenAi),
            truncated: false,
        }
    }

    #[test]
    fn test_cache_insert_and_get() {
        let cache = QueryCache::new();
        cache.insert("k".to_string(), cached("SELECT COUNT(*) FROM json_patients"));
        assert_eq!(
            cache.get("k").map(|c| c.sql),
            Some("SELECT COUNT(*) FROM json_patients".to_string())
        );
    }

    #[test]
    fn test_cache_expiration() {
        let cache = QueryCache::with_ttl(0);
        cache.insert("k".to_string(), cached("SELECT 1"));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_cache_stats_and_clear() {
        let cache = QueryCache::new();
        cache.insert("k".to_string(), cached("SELECT 1"));
        cache.get("k");
        cache.get("other");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert_eq!(stats.hit_rate, 0.5);

        cache.clear();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_key_depends_on_every_input() {
        let constraints = GenerationConstraints {
            allowed_tables: vec!["json_patients".into()],
            entity_context: None,
            max_sql_length: 1000,
        };
        let base = QueryCache::key("How many patients?", "ctx", &constraints);
        assert_eq!(base, QueryCache::key("How many patients?", "ctx", &constraints));
        assert_ne!(base, QueryCache::key("How many admissions?", "ctx", &constraints));
        assert_ne!(base, QueryCache::key("How many patients?", "other", &constraints));

        let with_entities = GenerationConstraints {
            entity_context: Some("Domain terms: patient".into()),
            ..constraints.clone()
        };
        assert_ne!(base, QueryCache::key("How many patients?", "ctx", &with_entities));
        assert_eq!(base.len(), 64);
    }
}
