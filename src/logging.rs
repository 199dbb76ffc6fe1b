use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::SwarmError;

/// Keeps the file writer alive. Dropping it flushes and stops file logging.
#[derive(Debug)]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn filter(level: &str) -> Result<EnvFilter, SwarmError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| SwarmError::config(format!("Invalid log level {:?}: {}", level, e))),
    }
}

/// Installs the global subscriber: console output plus, when a directory is
/// configured, a daily rolling file. `RUST_LOG` takes precedence over the
/// configured level. Fails if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<LogGuard, SwarmError> {
    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_filter(filter(&config.level)?);

    let (file, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| SwarmError::config(format!("Failed to create log directory: {}", e)))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("swarm-kb")
                .filename_suffix("log")
                .max_log_files(config.max_files.max(1))
                .build(dir)
                .map_err(|e| SwarmError::config(format!("Failed to create file appender: {}", e)))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = if config.json {
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(filter(&config.level)?)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(writer)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .with_filter(filter(&config.level)?)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| SwarmError::config(format!("Failed to set tracing subscriber: {}", e)))?;

    Ok(LogGuard { _file: guard })
}
