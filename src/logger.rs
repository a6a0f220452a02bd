use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    /// Rolling log file, relative to the studio root. `None` logs to stderr only.
    pub log_file: Option<PathBuf>,
    /// Write the file as newline-delimited JSON instead of text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: Some(PathBuf::from("logs/flow-studio.log")),
            json: false,
        }
    }
}

/// Keeps the file writer alive. Dropping it flushes buffered lines.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber. `RUST_LOG` wins over `log_level` when set.
pub fn init_tracing(root: &Path, config: &LogConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log level `{}`", config.log_level))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let Some(log_file) = &config.log_file else {
        Registry::default()
            .with(filter)
            .with(stderr_layer)
            .try_init()
            .context("a tracing subscriber is already installed")?;
        return Ok(LogGuard { _file: None });
    };

    let path = root.join(log_file);
    let dir = path.parent().unwrap_or(root).to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .context("log file needs a file name")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("could not create log directory {}", dir.display()))?;

    let appender = RollingFileAppender::new(Rotation::DAILY, &dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let (text_layer, json_layer) = if config.json {
        (None, Some(fmt::layer().json().with_writer(writer).with_target(true)))
    } else {
        (Some(fmt::layer().with_writer(writer).with_ansi(false)), None)
    };

    Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .context("a tracing subscriber is already installed")?;

    Ok(LogGuard {
        _file: Some(guard),
    })
}
