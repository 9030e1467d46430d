pub mod config;
pub mod database;
pub mod database_sqlite;
pub mod format;
pub mod history;
pub mod logging;
pub mod nl_sql;
pub mod stats;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use database_sqlite::SqliteDatabase;
pub use nl_sql::{NlSqlEngine, QueryResponse};
