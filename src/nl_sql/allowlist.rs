//! Table allowlist enforcement
//!
//! Generated SQL may only reference tables from a canonical set. Candidate
//! identifiers are scanned after `FROM`, `JOIN`, `UPDATE`, `INTO` and `TABLE`,
//! folded to lower case and corrected through a typo map (and, when enabled,
//! a generic-alias map) before the decision is made.
use crate::nl_sql::config::SecurityConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::sync::{LazyLock, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Tables permitted when no allowlist is configured
pub const DEFAULT_ALLOWED_TABLES: &[&str] = &[
    "json_patients",
    "json_admissions",
    "json_providers",
    "json_transfers",
    "json_lab",
    "json_diagnoses",
    "json_insurance",
    "json_careunits",
];

/// Common misspellings of canonical table names
const TYPO_MAP: &[(&str, &str)] = &[
    ("json_admission", "json_admissions"),
    ("json_admissionss", "json_admissions"),
    ("json_patientss", "json_patients"),
    ("json_patient", "json_patients"),
    ("json_provider", "json_providers"),
    ("json_transfer", "json_transfers"),
    ("json_careunit", "json_careunits"),
    ("json_labs", "json_lab"),
    ("json_diagnosis", "json_diagnoses"),
    ("json_insurances", "json_insurance"),
];

/// Bare domain nouns and the canonical table they stand for
const ALIAS_MAP: &[(&str, &str)] = &[
    ("patients", "json_patients"),
    ("patient", "json_patients"),
    ("admissions", "json_admissions"),
    ("admission", "json_admissions"),
    ("providers", "json_providers"),
    ("provider", "json_providers"),
    ("transfers", "json_transfers"),
    ("transfer", "json_transfers"),
    ("lab", "json_lab"),
    ("labs", "json_lab"),
    ("diagnoses", "json_diagnoses"),
    ("diagnosis", "json_diagnoses"),
    ("insurance", "json_insurance"),
    ("careunits", "json_careunits"),
    ("careunit", "json_careunits"),
];

static TABLE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(FROM|JOIN|UPDATE|INTO|TABLE)\s+").expect("table keyword regex")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:"(\w+)"|`(\w+)`|\[(\w+)\]|(\w+))"#).expect("identifier regex")
});

static ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s+(?:AS\s+)?(\w+)").expect("alias regex"));

static LIST_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*,\s*").expect("list separator regex"));

/// Words that can follow a table name without being its alias
const CLAUSE_WORDS: &[&str] = &[
    "where", "join", "left", "right", "inner", "outer", "cross", "full", "natural", "on", "using",
    "group", "order", "limit", "having", "union", "except", "intersect", "window", "set", "values",
];

/// A table identifier found in a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Identifier as written, without quoting
    pub raw: String,
    /// Keyword that introduced the identifier, upper-cased
    pub keyword: String,
    /// Byte range of the identifier (including quotes) in the statement
    pub span: Range<usize>,
}

impl TableRef {
    pub fn folded(&self) -> String {
        fold_identifier(&self.raw)
    }
}

/// Strip quoting and lower-case a table identifier
pub fn fold_identifier(name: &str) -> String {
    name.trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '[' | ']'))
        .to_lowercase()
}

/// Scan a statement for table identifiers, in order of appearance.
///
/// Comma-separated `FROM a, b` lists are followed; sub-selects (`FROM (`)
/// are skipped because the inner `FROM` is found on its own.
pub fn scan_table_refs(sql: &str) -> Vec<TableRef> {
    let mut refs = Vec::new();

    for keyword in TABLE_KEYWORD.captures_iter(sql) {
        let (Some(whole), Some(kw)) = (keyword.get(0), keyword.get(1)) else {
            continue;
        };
        let keyword_text = kw.as_str().to_uppercase();
        let mut pos = whole.end();

        loop {
            let Some(ident) = IDENTIFIER.captures(&sql[pos..]) else {
                break;
            };
            let Some(name) = (1..=4).find_map(|i| ident.get(i)) else {
                break;
            };
            let Some(matched) = ident.get(0) else {
                break;
            };
            refs.push(TableRef {
                raw: name.as_str().to_string(),
                keyword: keyword_text.clone(),
                span: pos..pos + matched.end(),
            });
            pos += matched.end();

            // Only FROM/JOIN lists carry further tables after a comma
            if keyword_text != "FROM" && keyword_text != "JOIN" {
                break;
            }
            if let Some(alias) = ALIAS.captures(&sql[pos..]) {
                let word = alias.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
                if !CLAUSE_WORDS.contains(&word.as_str())
                    && let Some(m) = alias.get(0)
                {
                    pos += m.end();
                }
            }
            match LIST_SEPARATOR.find(&sql[pos..]) {
                Some(sep) => pos += sep.end(),
                None => break,
            }
        }
    }

    refs.sort_by_key(|r| r.span.start);
    refs
}

/// Distinct lower-cased table names following `FROM`/`JOIN`, in order of appearance
pub fn tables_used(sql: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    scan_table_refs(sql)
        .into_iter()
        .filter(|r| r.keyword == "FROM" || r.keyword == "JOIN")
        .map(|r| r.folded())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Result of checking one statement against the allowlist
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityDecision {
    /// Referenced tables that passed, as written
    pub allowed_tables: Vec<String>,
    /// Referenced tables that were refused, as written
    pub blocked_tables: Vec<String>,
    /// `(wrong, right)` pairs for blocked names with a known correction
    pub suggestions: Vec<(String, String)>,
    pub is_blocked: bool,
}

/// Snapshot of allowlist state reported with each response
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SecurityInfo {
    pub allowed_tables: Vec<String>,
    pub blocked_operations: Vec<String>,
    pub data_modification_blocked: bool,
}

/// Canonical table set plus correction maps.
///
/// The blocked-operation ledger is advisory: it is only read for reporting and
/// cleared on request.
#[derive(Debug)]
pub struct TableAllowlist {
    allowed: BTreeSet<String>,
    typos: HashMap<String, String>,
    aliases: HashMap<String, String>,
    resolve_aliases: bool,
    blocked_operations: Mutex<BTreeSet<String>>,
}

impl Default for TableAllowlist {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}

impl TableAllowlist {
    pub fn new(config: &SecurityConfig) -> Self {
        let mut typos: HashMap<String, String> = TYPO_MAP
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in &config.extra_typos {
            typos.insert(fold_identifier(k), fold_identifier(v));
        }

        let mut aliases: HashMap<String, String> = ALIAS_MAP
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in &config.extra_aliases {
            aliases.insert(fold_identifier(k), fold_identifier(v));
        }

        drop_cyclic_entries(&mut typos, &mut aliases);

        let allowed: BTreeSet<String> = config
            .allowed_tables
            .iter()
            .map(|t| fold_identifier(t))
            .filter(|t| !t.is_empty())
            .collect();

        info!(
            "Table allowlist initialized with {} tables (resolve_aliases = {})",
            allowed.len(),
            config.resolve_aliases
        );

        Self {
            allowed,
            typos,
            aliases,
            resolve_aliases: config.resolve_aliases,
            blocked_operations: Mutex::new(BTreeSet::new()),
        }
    }

    /// Sorted canonical table names
    pub fn allowed_tables(&self) -> Vec<String> {
        self.allowed.iter().cloned().collect()
    }

    /// Apply the typo map only
    pub fn correct_typo(&self, name: &str) -> String {
        chase(fold_identifier(name), &[&self.typos])
    }

    /// Apply the typo map, then the generic-alias map.
    ///
    /// Chains are followed to a fixed point, so applying this twice gives the
    /// same result as applying it once.
    pub fn normalize_table_name(&self, name: &str) -> String {
        chase(fold_identifier(name), &[&self.typos, &self.aliases])
    }

    /// Rewrite misspelled table identifiers to their canonical form.
    ///
    /// This is the single correction step between generated text and every
    /// checker; it is idempotent. Alias nouns are left alone so the allowlist
    /// can still refuse them with a suggestion.
    pub fn normalize_sql_tables(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut last = 0;

        for table in scan_table_refs(sql) {
            let folded = table.folded();
            let corrected = self.correct_typo(&folded);
            if corrected == folded {
                continue;
            }
            debug!("Normalized table name {} -> {}", table.raw, corrected);
            out.push_str(&sql[last..table.span.start]);
            out.push_str(&corrected);
            last = table.span.end;
        }
        out.push_str(&sql[last..]);
        out
    }

    fn canonical_for_decision(&self, name: &str) -> String {
        if self.resolve_aliases {
            self.normalize_table_name(name)
        } else {
            self.correct_typo(name)
        }
    }

    /// Check a single table name, recording refused access
    pub fn is_table_allowed(&self, table: &str) -> bool {
        let canonical = self.canonical_for_decision(table);
        let allowed = self.allowed.contains(&canonical);

        if !allowed {
            match self.suggestion_for(table) {
                Some(right) => warn!("Access denied to table: {table}. Did you mean '{right}'?"),
                None => warn!("Access denied to table: {table}"),
            }
            self.ledger().insert(format!("table_access:{table}"));
        }

        allowed
    }

    fn suggestion_for(&self, table: &str) -> Option<String> {
        let folded = fold_identifier(table);
        let right = self.normalize_table_name(&folded);
        (right != folded).then_some(right)
    }

    /// Decide whether every table referenced by `sql` is permitted
    pub fn check(&self, sql: &str) -> SecurityDecision {
        let mut decision = SecurityDecision::default();
        let mut seen = HashSet::new();

        for table in scan_table_refs(sql) {
            let name = table.folded();
            if !seen.insert(name.clone()) {
                continue;
            }
            if self.is_table_allowed(&name) {
                decision.allowed_tables.push(name);
            } else {
                if let Some(right) = self.suggestion_for(&name) {
                    decision.suggestions.push((name.clone(), right));
                }
                decision.blocked_tables.push(name);
            }
        }

        decision.is_blocked = !decision.blocked_tables.is_empty();
        if decision.is_blocked {
            warn!(
                "SQL query blocked due to unauthorized tables: {:?}",
                decision.blocked_tables
            );
            self.ledger()
                .insert(format!("sql_query_blocked:{}", decision.blocked_tables.join(",")));
        }

        decision
    }

    /// Check `sql` and render the rejection message used as retry guidance
    pub fn validate_query(&self, sql: &str) -> (bool, String, SecurityDecision) {
        let decision = self.check(sql);
        if !decision.is_blocked {
            return (true, String::new(), decision);
        }

        let mut message = format!(
            "Access denied to tables: {}. Allowed tables: {}.",
            decision.blocked_tables.join(", "),
            self.allowed_tables().join(", ")
        );
        if !decision.suggestions.is_empty() {
            let pairs: Vec<String> = decision
                .suggestions
                .iter()
                .map(|(wrong, right)| format!("{wrong}→{right}"))
                .collect();
            message.push_str(&format!(" Suggestions: {}.", pairs.join(", ")));
        }

        (false, message, decision)
    }

    pub fn security_info(&self) -> SecurityInfo {
        let blocked: Vec<String> = self.ledger().iter().cloned().collect();
        SecurityInfo {
            allowed_tables: self.allowed_tables(),
            data_modification_blocked: !blocked.is_empty(),
            blocked_operations: blocked,
        }
    }

    pub fn reset_blocked_operations(&self) {
        self.ledger().clear();
        info!("Blocked operations counter reset");
    }

    fn ledger(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.blocked_operations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Follow mappings until the name is no longer a key
fn chase(mut name: String, maps: &[&HashMap<String, String>]) -> String {
    let mut visited = HashSet::new();
    while visited.insert(name.clone()) {
        match maps.iter().find_map(|m| m.get(&name)) {
            Some(next) if *next != name => name = next.clone(),
            _ => break,
        }
    }
    name
}

/// Remove entries whose correction chain loops back on itself
fn drop_cyclic_entries(typos: &mut HashMap<String, String>, aliases: &mut HashMap<String, String>) {
    let bad: Vec<String> = {
        let (typos, aliases): (&HashMap<String, String>, &HashMap<String, String>) = (typos, aliases);
        typos
            .keys()
            .chain(aliases.keys())
            .filter(|start| is_cyclic(start, typos, aliases))
            .cloned()
            .collect()
    };

    for key in bad {
        warn!("Ignoring table correction for '{key}': mapping is cyclic");
        typos.remove(&key);
        aliases.remove(&key);
    }
}

fn is_cyclic(start: &str, typos: &HashMap<String, String>, aliases: &HashMap<String, String>) -> bool {
    let mut visited = HashSet::new();
    let mut name = start.to_string();
    loop {
        if !visited.insert(name.clone()) {
            return true;
        }
        match typos.get(&name).or_else(|| aliases.get(&name)) {
            Some(next) if *next != name => name = next.clone(),
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn allowlist(resolve_aliases: bool) -> TableAllowlist {
        TableAllowlist::new(&SecurityConfig {
            resolve_aliases,
            ..SecurityConfig::default()
        })
    }

    #[rstest]
    #[case("SELECT * FROM json_patients", vec!["json_patients"])]
    #[case(
        "SELECT p.gender FROM json_patients p JOIN json_admissions a ON p.subject_id = a.subject_id",
        vec!["json_patients", "json_admissions"]
    )]
    #[case("select * from \"JSON_Patients\"", vec!["JSON_Patients"])]
    #[case("SELECT * FROM json_patients AS p, json_admissions a WHERE 1", vec!["json_patients", "json_admissions"])]
    #[case("SELECT COUNT(*) FROM (SELECT subject_id FROM json_patients)", vec!["json_patients"])]
    #[case("DELETE FROM staff_notes", vec!["staff_notes"])]
    #[case("INSERT INTO json_lab VALUES (1)", vec!["json_lab"])]
    #[case("SELECT 1", vec![])]
    fn test_scan_table_refs(#[case] sql: &str, #[case] expected: Vec<&str>) {
        let raw: Vec<String> = scan_table_refs(sql).into_iter().map(|r| r.raw).collect();
        assert_eq!(raw, expected);
    }

    #[test]
    fn test_tables_used_is_distinct_and_lowercased() {
        let sql = "SELECT * FROM JSON_ADMISSIONS a JOIN json_patients p ON a.subject_id = p.subject_id \
                   WHERE a.hadm_id IN (SELECT hadm_id FROM json_admissions)";
        assert_eq!(tables_used(sql), vec!["json_admissions", "json_patients"]);
    }

    #[rstest]
    #[case("json_admissionss", "json_admissions")]
    #[case("JSON_PATIENT", "json_patients")]
    #[case("\"json_labs\"", "json_lab")]
    #[case("admission", "admission")]
    #[case("json_transfers", "json_transfers")]
    fn test_correct_typo(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(allowlist(false).correct_typo(input), expected);
    }

    #[rstest]
    #[case("admission", "json_admissions")]
    #[case("Diagnosis", "json_diagnoses")]
    #[case("json_insurances", "json_insurance")]
    #[case("staff_notes", "staff_notes")]
    fn test_normalize_table_name(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(allowlist(false).normalize_table_name(input), expected);
    }

    #[test]
    fn test_normalization_idempotent_for_known_names() {
        let list = allowlist(false);
        for (name, _) in TYPO_MAP.iter().chain(ALIAS_MAP.iter()) {
            let once = list.normalize_table_name(name);
            assert_eq!(list.normalize_table_name(&once), once, "{name}");
            let typo_once = list.correct_typo(name);
            assert_eq!(list.correct_typo(&typo_once), typo_once, "{name}");
        }
    }

    proptest! {
        #[test]
        fn prop_normalization_is_idempotent(name in "[A-Za-z_\"]{0,20}") {
            let list = allowlist(false);
            let once = list.normalize_table_name(&name);
            prop_assert_eq!(list.normalize_table_name(&once), once);
        }

        #[test]
        fn prop_sql_normalization_is_idempotent(
            table in prop::sample::select(vec![
                "json_admissionss", "json_patient", "json_labs", "admission", "json_patients", "Json_Careunit",
            ]),
            column in "[a-z_]{1,12}",
        ) {
            let list = allowlist(false);
            let sql = format!("SELECT {column} FROM {table} ORDER BY {column} LIMIT 5");
            let once = list.normalize_sql_tables(&sql);
            prop_assert_eq!(list.normalize_sql_tables(&once), once);
        }
    }

    #[test]
    fn test_extra_maps_resolve_chains_and_ignore_cycles() {
        let list = TableAllowlist::new(&SecurityConfig {
            extra_typos: BTreeMap::from([
                ("pts".to_string(), "json_patient".to_string()),
                ("loop_a".to_string(), "loop_b".to_string()),
                ("loop_b".to_string(), "loop_a".to_string()),
            ]),
            ..SecurityConfig::default()
        });
        assert_eq!(list.correct_typo("pts"), "json_patients");
        assert_eq!(list.correct_typo("loop_a"), "loop_a");
        assert_eq!(list.normalize_table_name("loop_b"), "loop_b");
    }

    #[test]
    fn test_normalize_sql_tables_rewrites_typos_only() {
        let list = allowlist(false);
        let sql = "SELECT a.hadm_id FROM json_admissionss a JOIN \"json_patient\" p ON a.subject_id = p.subject_id";
        assert_eq!(
            list.normalize_sql_tables(sql),
            "SELECT a.hadm_id FROM json_admissions a JOIN json_patients p ON a.subject_id = p.subject_id"
        );

        let alias_sql = "SELECT * FROM admission ORDER BY admittime LIMIT 5";
        assert_eq!(list.normalize_sql_tables(alias_sql), alias_sql);
    }

    #[test]
    fn test_validate_query_allows_canonical_tables() {
        let list = allowlist(false);
        let (ok, message, decision) = list.validate_query("SELECT COUNT(*) FROM json_patients");
        assert!(ok);
        assert!(message.is_empty());
        assert_eq!(decision.allowed_tables, vec!["json_patients"]);
        assert!(list.security_info().blocked_operations.is_empty());
    }

    #[test]
    fn test_alias_blocked_with_suggestion() {
        let list = allowlist(false);
        let (ok, message, decision) =
            list.validate_query("SELECT * FROM admission ORDER BY admittime DESC LIMIT 5");
        assert!(!ok);
        assert!(decision.is_blocked);
        assert_eq!(
            decision.suggestions,
            vec![("admission".to_string(), "json_admissions".to_string())]
        );
        assert_eq!(
            message,
            "Access denied to tables: admission. Allowed tables: json_admissions, json_careunits, \
             json_diagnoses, json_insurance, json_lab, json_patients, json_providers, json_transfers. \
             Suggestions: admission→json_admissions."
        );

        let info = list.security_info();
        assert!(info.data_modification_blocked);
        assert!(info.blocked_operations.contains(&"table_access:admission".to_string()));
        assert!(info.blocked_operations.contains(&"sql_query_blocked:admission".to_string()));
    }

    #[test]
    fn test_alias_allowed_when_resolution_enabled() {
        let list = allowlist(true);
        let (ok, _, decision) = list.validate_query("SELECT * FROM admission ORDER BY admittime LIMIT 5");
        assert!(ok);
        assert_eq!(decision.allowed_tables, vec!["admission"]);
    }

    #[test]
    fn test_real_but_disallowed_table_has_no_suggestion() {
        let list = allowlist(false);
        let (ok, message, decision) = list.validate_query("SELECT body FROM staff_notes");
        assert!(!ok);
        assert!(decision.suggestions.is_empty());
        assert!(!message.contains("Suggestions"));
    }

    #[test]
    fn test_reset_blocked_operations() {
        let list = allowlist(false);
        list.validate_query("SELECT * FROM staff_notes");
        assert!(!list.security_info().blocked_operations.is_empty());
        list.reset_blocked_operations();
        let info = list.security_info();
        assert!(info.blocked_operations.is_empty());
        assert!(!info.data_modification_blocked);
    }

    #[test]
    fn test_ledgers_are_per_instance() {
        let first = allowlist(false);
        let second = allowlist(false);
        first.validate_query("SELECT * FROM staff_notes");
        assert!(second.security_info().blocked_operations.is_empty());
    }
}
