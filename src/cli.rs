use clap::{Parser, Subcommand};
use querybot::history::ExportFormat;
use querybot::nl_sql::{LlmMode, RetrievalMode};
use std::path::PathBuf;

/// querybot - ask questions about the medical database in plain language
#[derive(Parser, Debug, Clone)]
#[command(name = "querybot")]
#[command(version, long_about = None)]
#[command(about = "Turns English or Turkish questions into safe, read-only SQL and answers them")]
pub struct Cli {
    /// Configuration file (default: ~/.config/querybot/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// SQLite database holding the medical tables
    #[arg(long, global = true, env = "DATABASE_PATH", value_name = "PATH")]
    pub database: Option<String>,

    /// Completion backend
    #[arg(long, global = true, value_enum)]
    pub llm_mode: Option<LlmMode>,

    /// Schema retrieval strategy
    #[arg(long, global = true, value_enum)]
    pub retrieval: Option<RetrievalMode>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Answer a question
    Ask {
        /// The question, e.g. "How many patients are there?"
        question: String,

        /// Question language (en or tr; default from configuration)
        #[arg(short, long)]
        language: Option<String>,

        /// Print the full response envelope as JSON
        #[arg(long)]
        json: bool,

        /// Show every row in expanded form
        #[arg(short = 'x', long)]
        expanded: bool,

        /// Do not record this question in history
        #[arg(long)]
        no_history: bool,

        /// User id stored with the history entry
        #[arg(long)]
        user: Option<String>,
    },

    /// Show the tables and columns known to the generator
    Schema {
        /// Only this table
        table: Option<String>,

        /// Add count, NULL, distinct, range and quartile figures for numeric columns
        #[arg(long)]
        stats: bool,
    },

    /// Inspect or export past questions
    History {
        /// Number of entries to list
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,

        /// Only failed questions
        #[arg(long, conflicts_with = "successful")]
        failed: bool,

        /// Only successful questions
        #[arg(long)]
        successful: bool,

        /// Restrict to one user
        #[arg(long)]
        user: Option<String>,

        /// Aggregate statistics over the last N days
        #[arg(long, value_name = "DAYS", num_args = 0..=1, default_missing_value = "30")]
        stats: Option<i64>,

        /// Write entries to stdout in this format
        #[arg(long, value_enum)]
        export: Option<ExportFormat>,

        /// Delete entries (all, or older than N days)
        #[arg(long, value_name = "DAYS", num_args = 0..=1, default_missing_value = "0")]
        clear: Option<i64>,
    },

    /// Show the effective configuration
    Config {
        /// List every key with its default instead
        #[arg(long)]
        docs: bool,

        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}
