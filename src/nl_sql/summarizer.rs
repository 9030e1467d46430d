//! Natural-language answers for query results

use crate::database::QueryResult;
use crate::nl_sql::client::{ChatMessage, CompletionProvider, TokenUsage};
use crate::nl_sql::config::SummarizerConfig;
use crate::nl_sql::prompt::PromptGenerator;
use std::sync::Arc;
use tracing::{debug, warn};

pub const NO_DATA_ANSWER: &str = "No data found in the database for this question.";

/// Rows described in the deterministic summary
const DETERMINISTIC_ROWS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub answer: String,
    pub usage: TokenUsage,
    /// Whether the completion backend wrote the answer
    pub from_model: bool,
}

pub struct AnswerSummarizer {
    llm: Option<Arc<dyn CompletionProvider>>,
    config: SummarizerConfig,
}

impl AnswerSummarizer {
    pub fn new(llm: Option<Arc<dyn CompletionProvider>>, config: SummarizerConfig) -> Self {
        Self { llm, config }
    }

    pub async fn summarize(&self, question: &str, sql: &str, result: &QueryResult) -> Summary {
        if result.is_empty() {
            return Summary {
                answer: NO_DATA_ANSWER.to_string(),
                usage: TokenUsage::default(),
                from_model: false,
            };
        }

        let llm = match &self.llm {
            Some(llm) if self.config.use_llm => llm,
            _ => return deterministic(result),
        };

        let records = format_records(result, self.config.max_rows);
        let messages = [
            ChatMessage::system(PromptGenerator::summary_system_prompt()),
            ChatMessage::user(PromptGenerator::summary_user_prompt(
                question,
                sql,
                &records,
                result.row_count(),
            )),
        ];

        match llm
            .complete(&messages, self.config.max_tokens, self.config.temperature)
            .await
        {
            Ok(completion) if !completion.content.trim().is_empty() => {
                debug!(
                    "Summary written by {} ({} tokens)",
                    completion.model, completion.usage.total_tokens
                );
                Summary {
                    answer: completion.content.trim().to_string(),
                    usage: completion.usage,
                    from_model: true,
                }
            }
            Ok(completion) => {
                warn!("Summary backend returned an empty answer");
                Summary {
                    usage: completion.usage,
                    ..deterministic(result)
                }
            }
            Err(e) => {
                warn!("Summary generation failed: {}", e);
                deterministic(result)
            }
        }
    }
}

/// `Record i: col=value, ...` lines for the first `max_rows` rows
pub fn format_records(result: &QueryResult, max_rows: usize) -> String {
    result
        .rows
        .iter()
        .take(max_rows)
        .enumerate()
        .map(|(i, row)| format!("Record {}: {}", i + 1, render_row(&result.columns, row)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_row(columns: &[String], row: &[String]) -> String {
    columns
        .iter()
        .zip(row)
        .map(|(column, value)| format!("{column}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Answer built without a model
pub fn deterministic(result: &QueryResult) -> Summary {
    let answer = match (result.scalar(), result.columns.first()) {
        (Some(value), Some(column)) => format!("Found 1 records in the database. {column}: {value}."),
        _ => {
            let mut answer = format!("Found {} records in the database.", result.row_count());
            let shown: Vec<String> = result
                .rows
                .iter()
                .take(DETERMINISTIC_ROWS)
                .map(|row| render_row(&result.columns, row))
                .collect();
            if !shown.is_empty() {
                answer.push_str(&format!(" {}", shown.join("; ")));
                if result.row_count() > DETERMINISTIC_ROWS {
                    answer.push_str("; ...");
                }
            }
            answer
        }
    };
    Summary {
        answer,
        usage: TokenUsage::default(),
        from_model: false,
    }
}
