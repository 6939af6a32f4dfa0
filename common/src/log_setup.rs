use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where and how verbosely the process logs.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set, e.g. `"info"` or `"integration=debug"`.
    pub base_level: String,
    /// Directory receiving the daily rolling log files.
    pub directory: PathBuf,
    /// File name prefix of the rolling log files.
    pub file_prefix: String,
    /// Number of rotated files kept on disk.
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_level: "info".to_string(),
            directory: PathBuf::from("logs"),
            file_prefix: "integration".to_string(),
            max_files: 5,
        }
    }
}

impl LogConfig {
    pub fn with_level(base_level: &str) -> Self {
        Self {
            base_level: base_level.to_string(),
            ..Default::default()
        }
    }
}

/// Installs the global tracing subscriber: console (warnings to stderr) plus a
/// non-blocking daily rolling file. Must be called at most once per process.
pub fn setup_logging(config: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.base_level))
        .unwrap_or_else(|e| panic!("Invalid log filter: {}", e));

    std::fs::create_dir_all(&config.directory)
        .unwrap_or_else(|e| panic!("Failed to create logs directory: {}", e));

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(&config.directory)
        .unwrap_or_else(|e| panic!("Failed to create log file appender: {}", e));

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        panic!("Logging already initialized");
    }

    let console_writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(console_writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .unwrap_or_else(|e| panic!("Logger initialization failed: {}", e));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_creates_directory() {
        let directory =
            std::env::temp_dir().join(format!("common_log_setup_{}", std::process::id()));
        setup_logging(&LogConfig {
            base_level: "debug".to_string(),
            directory: directory.clone(),
            file_prefix: "test".to_string(),
            max_files: 1,
        });
        tracing::info!(directory = %directory.display(), "Logging initialized");
        assert!(directory.is_dir());
        assert!(LOG_GUARD.get().is_some());
    }
}
