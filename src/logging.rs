use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogLevel, LoggingConfig};

/// Filter from `RUST_LOG` when set, otherwise from the configured level.
///
/// The level applies to this crate only; dependencies stay at `warn`.
pub fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,querybot={level}")))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped and must be kept
/// alive for the whole process.
pub fn init(config: &LoggingConfig, verbose: bool) -> io::Result<Option<WorkerGuard>> {
    let level = if verbose { LogLevel::Debug } else { config.level };

    let console = config.console_output.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .compact()
    });

    let (file, guard) = if config.file_output {
        let (directory, prefix) = split_log_path(Path::new(&config.file_path));
        std::fs::create_dir_all(&directory)?;
        let appender = tracing_appender::rolling::daily(directory, prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| io::Error::other(format!("Failed to install logger: {e}")))?;

    Ok(guard)
}

/// `dir/name.log` → (`dir`, `name.log`); a bare file name logs to the current directory
fn split_log_path(path: &Path) -> (std::path::PathBuf, String) {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let prefix = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "querybot.log".to_string());
    (directory, prefix)
}
