use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "info,weave_net=debug,weave_core=debug,weave_app=debug";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` overrides it when set.
    pub filter: String,

    /// Also write a daily rotated log file.
    pub file: bool,

    /// Directory for log files. Defaults to `~/.weave/logs/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            file: false,
            dir: None,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn logs_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::config::logs_dir(),
        }
    }
}

/// Initializes console logging, plus a daily rotated file when enabled.
///
/// Returns the file writer's guard, which must be kept alive for the
/// duration of the process. Fails if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(config.ansi)
        .compact();

    let (file_layer, guard) = if config.file {
        let logs_dir = config.logs_dir()?;
        std::fs::create_dir_all(&logs_dir)?;

        // File appender: daily rotation
        let file_appender = tracing_appender::rolling::daily(&logs_dir, "weave");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(false)
            .with_writer(non_blocking);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

/// Initialize file-only logging to a custom directory with a custom filter.
/// Useful for tests or embedded scenarios where `~/.weave/logs` is not desired.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "weave");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert!(config.filter.contains("weave_net=debug"));
        assert!(!config.file);
        assert!(config.logs_dir().unwrap().ends_with("logs"));
    }

    #[test]
    fn test_init_with_file_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let logs_dir = tmp.path().join("nested").join("logs");
        let config = LoggingConfig {
            filter: "warn".into(),
            file: true,
            dir: Some(logs_dir.clone()),
            ansi: false,
        };

        // Only one test per process can install the global subscriber, so
        // the result may be an error; the directory is created either way.
        let result = init_logging(&config);
        assert!(logs_dir.exists());
        if let Ok(guard) = result {
            assert!(guard.is_some());
        }
    }

    #[test]
    fn test_init_logging_to_dir_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let logs_dir = tmp.path().join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();

        let result = init_logging_to_dir(&logs_dir, "info");
        assert!(logs_dir.exists());
        drop(result);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LoggingConfig = toml::from_str("file = true").unwrap();
        assert!(config.file);
        assert_eq!(config.filter, DEFAULT_FILTER);
        assert!(config.ansi);
    }
}
