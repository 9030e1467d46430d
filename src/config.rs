use crate::database_sqlite::SqliteOptions;
use crate::nl_sql::config::NlSqlConfig;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    #[serde(rename = "trace")]
    Trace,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default = "default_console_output")]
    pub console_output: bool,
    #[serde(default = "default_file_output")]
    pub file_output: bool,
    #[serde(default = "default_log_file_path")]
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            console_output: default_console_output(),
            file_output: default_file_output(),
            file_path: default_log_file_path(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite file (or `sqlite:` URL) holding the medical tables
    #[serde(default = "default_database_path")]
    pub path: String,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_database_path(),
            read_only: default_read_only(),
            max_connections: default_max_connections(),
            acquire_timeout_seconds: default_acquire_timeout(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HistoryConfig {
    /// Store every answered question (default: true)
    #[serde(default = "default_history_enabled")]
    pub enabled: bool,
    /// History database file; defaults to `history.db` in the config directory
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            enabled: default_history_enabled(),
            path: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub nl_sql: NlSqlConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_console_output() -> bool {
    true
}

fn default_file_output() -> bool {
    false
}

fn default_log_file_path() -> String {
    Config::get_config_directory()
        .map(|dir| dir.join("logs").join("querybot.log"))
        .unwrap_or_else(|| PathBuf::from("querybot.log"))
        .to_string_lossy()
        .to_string()
}

fn default_database_path() -> String {
    "medical.db".to_string()
}

fn default_read_only() -> bool {
    true
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_history_enabled() -> bool {
    true
}

impl Config {
    /// `~/.config/querybot`
    pub fn get_config_directory() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".config").join("querybot"))
    }

    pub fn default_config_path() -> Option<PathBuf> {
        Self::get_config_directory().map(|dir| dir.join("config.toml"))
    }

    /// Load from the default location and apply environment overrides
    pub fn load() -> Self {
        match Self::default_config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                let mut config = Config::default();
                config.apply_env_overrides();
                config
            }
        }
    }

    /// Load `path`; a missing file gives defaults, a malformed one is reported and replaced by defaults
    pub fn load_from(path: &Path) -> Self {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse config file {}: {}", path.display(), e);
                    eprintln!("Using default configuration.");
                    Config::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No config file at {}, using defaults", path.display());
                Config::default()
            }
            Err(e) => {
                eprintln!("Failed to read config file {}: {}", path.display(), e);
                Config::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// `DATABASE_PATH` (or `DB_PATH`) plus every pipeline override
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("DATABASE_PATH")
            .or_else(|| lookup("DB_PATH"))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
        {
            self.database.path = path;
        }
        self.nl_sql.apply_overrides_from(lookup);
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let toml = self.to_toml_string()?;
        let mut file = File::create(path)?;
        file.write_all(toml.as_bytes())
    }

    pub fn to_toml_string(&self) -> io::Result<String> {
        toml::to_string(self).map_err(|e| io::Error::other(format!("Serialization error: {e}")))
    }

    /// Copy safe to print: API keys replaced
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.nl_sql.openai_api_key.is_some() {
            copy.nl_sql.openai_api_key = Some("***".to_string());
        }
        copy
    }

    pub fn history_path(&self) -> PathBuf {
        match &self.history.path {
            Some(path) => PathBuf::from(path),
            None => Self::get_config_directory()
                .map(|dir| dir.join("history.db"))
                .unwrap_or_else(|| PathBuf::from("querybot_history.db")),
        }
    }

    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            read_only: self.database.read_only,
            max_connections: self.database.max_connections,
            acquire_timeout_secs: self.database.acquire_timeout_seconds,
        }
    }

    /// Every configuration key with its default, section by section
    pub fn documentation() -> Vec<(&'static str, &'static str)> {
        let mut docs = vec![
            ("[database]", "Medical datastore"),
            ("path", "SQLite file (default: medical.db, env DATABASE_PATH or DB_PATH)"),
            ("read_only", "Open the datastore read-only (default: true)"),
            ("max_connections", "Connection pool size (default: 5)"),
            ("acquire_timeout_seconds", "Wait for a pooled connection (default: 10)"),
            ("", ""),
            ("[history]", "Query history"),
            ("enabled", "Store every answered question (default: true)"),
            ("path", "History database (default: ~/.config/querybot/history.db)"),
            ("", ""),
            ("[logging]", "Diagnostics"),
            ("level", "trace, debug, info, warn, error (default: info; RUST_LOG overrides)"),
            ("console_output", "Log to stderr (default: true)"),
            ("file_output", "Log to a daily rolling file (default: false)"),
            ("file_path", "Log file (default: ~/.config/querybot/logs/querybot.log)"),
            ("", ""),
        ];
        docs.extend(NlSqlConfig::documentation());
        docs
    }
}
