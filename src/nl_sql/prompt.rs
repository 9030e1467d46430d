//! Prompt construction for SQL generation, retries and answer summaries

use crate::nl_sql::schema::SchemaSnippet;

/// Join keys between the known tables
const TABLE_RELATIONSHIPS: &[(&str, &str, &str)] = &[
    ("json_patients", "json_admissions", "subject_id"),
    ("json_admissions", "json_transfers", "hadm_id"),
    ("json_admissions", "json_providers", "admit_provider_id = provider_id"),
    ("json_patients", "json_transfers", "subject_id"),
];

/// Everything besides the question that shapes one generation call
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GenerationConstraints {
    /// Tables the statement may reference
    pub allowed_tables: Vec<String>,
    /// Rendered entity context, already masked
    pub entity_context: Option<String>,
    pub max_sql_length: usize,
}

/// Prompt generator for SQL queries
pub struct PromptGenerator;

impl PromptGenerator {
    /// Render retrieved snippets as prompt context, one per line
    pub fn schema_context(snippets: &[SchemaSnippet]) -> String {
        snippets
            .iter()
            .map(SchemaSnippet::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn system_prompt(schema_context: &str, constraints: &GenerationConstraints) -> String {
        let mut prompt = String::from(
            "You are a medical database SQL expert working on SQLite. \
             Generate one accurate SQL query for the user's question.\n\n",
        );

        prompt.push_str("Database Schema Information:\n");
        prompt.push_str(schema_context);
        prompt.push_str("\n\nTable Relationships:\n");
        for (left, right, key) in TABLE_RELATIONSHIPS {
            prompt.push_str(&format!("- {left} <-> {right} via {key}\n"));
        }

        if !constraints.allowed_tables.is_empty() {
            prompt.push_str(&format!(
                "\nAllowed tables: {}\n",
                constraints.allowed_tables.join(", ")
            ));
        }

        if let Some(entities) = &constraints.entity_context {
            prompt.push_str("\nEntities found in the question:\n");
            prompt.push_str(entities);
            prompt.push('\n');
        }

        prompt.push_str(
            "\nRules:\n\
             1. Return ONLY the SQL query: no explanations, no markdown code blocks\n\
             2. Return exactly one statement and do not end it with a semicolon\n\
             3. Only SELECT statements are allowed; never modify data\n\
             4. Use the exact table names listed above\n\
             5. A LIMIT clause requires an ORDER BY clause\n\
             6. ORDER BY must use a numeric or date column\n\
             7. Use JOINs on the relationship keys when several tables are needed\n",
        );
        if constraints.max_sql_length > 0 {
            prompt.push_str(&format!(
                "8. Keep the query under {} characters\n",
                constraints.max_sql_length
            ));
        }
        prompt
    }

    pub fn user_prompt(question: &str) -> String {
        format!("User Question: {question}\n\nGenerate SQL Query:")
    }

    /// Original question followed by the failure of the previous attempt
    pub fn retry_question(question: &str, error: &str) -> String {
        format!(
            "{question}\n\nThe previous SQL attempt was rejected: {error}\n\
             Fix the query: use only the allowed table names exactly as listed, \
             keep it a single SELECT statement, and add ORDER BY whenever LIMIT is used."
        )
    }

    pub fn summary_system_prompt() -> String {
        "You summarize database query results for a medical analyst. \
         Answer the question in one or two sentences using only the records provided, \
         in the same language as the question. Do not invent values."
            .to_string()
    }

    pub fn summary_user_prompt(question: &str, sql: &str, records: &str, total_rows: usize) -> String {
        format!(
            "Question: {question}\n\nSQL: {sql}\n\nResults ({total_rows} rows):\n{records}\n\nAnswer:"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nl_sql::schema::tests::sample_index;

    #[test]
    fn test_system_prompt_contains_rules_and_context() {
        let index = sample_index();
        let context = PromptGenerator::schema_context(&index.snippets()[..3]);
        let constraints = GenerationConstraints {
            allowed_tables: vec!["json_patients".into(), "json_admissions".into()],
            entity_context: Some("Domain terms: patient".into()),
            max_sql_length: 1000,
        };

        let prompt = PromptGenerator::system_prompt(&context, &constraints);
        assert!(prompt.contains("Table json_patients"));
        assert!(prompt.contains("json_admissions <-> json_transfers via hadm_id"));
        assert!(prompt.contains("Allowed tables: json_patients, json_admissions"));
        assert!(prompt.contains("Domain terms: patient"));
        assert!(prompt.contains("LIMIT clause requires an ORDER BY"));
        assert!(prompt.contains("under 1000 characters"));
    }

    #[test]
    fn test_system_prompt_without_optional_blocks() {
        let prompt = PromptGenerator::system_prompt("", &GenerationConstraints::default());
        assert!(!prompt.contains("Allowed tables"));
        assert!(!prompt.contains("Entities found"));
        assert!(!prompt.contains("characters"));
    }

    #[test]
    fn test_retry_question_keeps_original_and_error() {
        let retry = PromptGenerator::retry_question(
            "Kaç yatış var?",
            "Access denied to tables: admission.",
        );
        assert!(retry.starts_with("Kaç yatış var?\n\n"));
        assert!(retry.contains("Access denied to tables: admission."));
    }

    #[test]
    fn test_user_prompt() {
        assert_eq!(
            PromptGenerator::user_prompt("How many patients?"),
            "User Question: How many patients?\n\nGenerate SQL Query:"
        );
    }
}
