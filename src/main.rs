mod cli;

use clap::Parser;
use cli::{Cli, Command};
use querybot::config::Config;
use querybot::database_sqlite::SqliteDatabase;
use querybot::format::{
    format_history, format_history_stats, format_query_result_expanded, format_query_result_psql,
    format_table_schema,
};
use querybot::history::{HistoryFilter, QueryHistory};
use querybot::logging;
use querybot::nl_sql::{NlSqlEngine, QueryResponse, SchemaIndex};
use querybot::stats::{StatsCollector, format_stats_summary};
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::{debug, warn};

type CliResult<T> = Result<T, Box<dyn StdError>>;

fn load_config(cli: &Cli) -> Config {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    if let Some(database) = &cli.database {
        config.database.path = database.clone();
    }
    if let Some(mode) = cli.llm_mode {
        config.nl_sql.llm_mode = mode;
    }
    if let Some(mode) = cli.retrieval {
        config.nl_sql.retrieval.mode = mode;
    }
    config
}

async fn open_database(config: &Config) -> CliResult<Arc<SqliteDatabase>> {
    let db = SqliteDatabase::open(&config.database.path, &config.sqlite_options()).await?;
    Ok(Arc::new(db))
}

/// Returns the process exit code
pub async fn async_main() -> CliResult<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli);

    let _log_guard = match logging::init(&config.logging, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: Failed to initialize logging: {e}");
            None
        }
    };
    debug!("querybot started");

    match cli.command.clone() {
        Command::Ask {
            question,
            language,
            json,
            expanded,
            no_history,
            user,
        } => {
            let db = open_database(&config).await?;
            let engine = NlSqlEngine::with_sqlite(config.nl_sql.clone(), db.clone()).await?;
            let response = engine.ask(&question, language.as_deref()).await?;

            if json {
                println!("{}", response.to_json_pretty()?);
            } else {
                print_response(&response, expanded);
            }

            if config.history.enabled && !no_history {
                record_history(&config, &response, user.as_deref()).await;
            }
            db.close().await;
            Ok(if response.success { 0 } else { 1 })
        }
        Command::Schema { table, stats } => {
            let db = open_database(&config).await?;
            let metadata = db.metadata_provider();
            let schema = SchemaIndex::build(&metadata).await?;

            let tables: Vec<_> = match &table {
                Some(name) => schema.table(name).into_iter().collect(),
                None => schema.tables().iter().collect(),
            };
            if tables.is_empty() {
                match table {
                    Some(name) => eprintln!("Table \"{name}\" not found"),
                    None => eprintln!("No tables in {}", db.location()),
                }
                db.close().await;
                return Ok(1);
            }

            let mut session = if stats { Some(db.session().await?) } else { None };
            for t in tables {
                if let Some(summary) = schema.table_summary(&t.name) {
                    println!("{}", summary.render());
                }
                println!("{}", format_table_schema(t));
                if let Some(session) = session.as_mut() {
                    let analysis = StatsCollector::new(&metadata, session)
                        .analyze_table(&t.name)
                        .await?;
                    if analysis.columns.is_empty() {
                        println!("No numeric columns\n");
                    }
                    for column in &analysis.columns {
                        println!("{}: {}", column.column, format_stats_summary(column));
                    }
                    if !analysis.columns.is_empty() {
                        println!();
                    }
                }
            }
            drop(session);
            db.close().await;
            Ok(0)
        }
        Command::History {
            limit,
            failed,
            successful,
            user,
            stats,
            export,
            clear,
        } => {
            let history = QueryHistory::open(config.history_path()).await?;

            if let Some(days) = clear {
                let older_than = (days > 0).then_some(days);
                let removed = history.clear(user.as_deref(), older_than).await?;
                println!("Removed {removed} history entries");
            } else if let Some(days) = stats {
                let stats = history.stats(user.as_deref(), days).await?;
                print!("{}", format_history_stats(&stats));
            } else {
                let filter = HistoryFilter {
                    user_id: user,
                    success_only: match (failed, successful) {
                        (true, _) => Some(false),
                        (_, true) => Some(true),
                        _ => None,
                    },
                    limit,
                    ..HistoryFilter::default()
                };
                match export {
                    Some(format) => print!("{}", history.export(format, &filter).await?),
                    None => {
                        let entries = history.list(&filter).await?;
                        if entries.is_empty() {
                            println!("No history entries");
                        } else {
                            format_history(&entries).printstd();
                        }
                    }
                }
            }
            history.close().await;
            Ok(0)
        }
        Command::Config { docs, save } => {
            if docs {
                for (key, description) in Config::documentation() {
                    if key.is_empty() {
                        println!();
                    } else if key.starts_with('[') {
                        println!("{key}  # {description}");
                    } else {
                        println!("  {key:<28} {description}");
                    }
                }
                return Ok(0);
            }
            if save {
                let path = match &cli.config {
                    Some(path) => path.clone(),
                    None => Config::default_config_path()
                        .ok_or("Cannot determine the configuration directory")?,
                };
                config.save_to(&path)?;
                println!("Saved configuration to {}", path.display());
            }
            print!("{}", config.redacted().to_toml_string()?);
            Ok(0)
        }
    }
}

fn print_response(response: &QueryResponse, expanded: bool) {
    println!("{}", response.answer);
    if let Some(sql) = &response.sql {
        println!("\nSQL: {sql}");
    }
    if let Some(result) = response.result.as_ref().filter(|r| !r.is_empty()) {
        println!();
        if expanded {
            for table in format_query_result_expanded(result) {
                table.printstd();
            }
        } else {
            print!("{}", format_query_result_psql(result));
        }
    }
    if let Some(error) = &response.error {
        eprintln!("\nError: {error}");
    }
}

async fn record_history(config: &Config, response: &QueryResponse, user: Option<&str>) {
    let history = match QueryHistory::open(config.history_path()).await {
        Ok(history) => history,
        Err(e) => {
            warn!("History unavailable: {}", e);
            return;
        }
    };
    if let Err(e) = history.save(response, &response.meta.question, user).await {
        warn!("Failed to save history: {}", e);
    }
    history.close().await;
}

fn main() -> Result<(), Box<dyn StdError>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async_main());
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));
    match result? {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}
