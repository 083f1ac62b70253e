//! Logging setup.
//!
//! Console output through `tracing-subscriber`, optionally mirrored to a
//! file through a non-blocking `tracing-appender` writer. `RUST_LOG`
//! overrides the configured filter.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::error::{BridgeError, Result};

/// `[logging]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Base level for everything.
    pub level: String,
    /// Debug output from the frame codecs.
    pub hci_debug: bool,
    /// Debug output from the command sets.
    pub iut_debug: bool,
    /// Debug output from transports and the writer task.
    pub transport_debug: bool,
    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            hci_debug: false,
            iut_debug: false,
            transport_debug: false,
            file: None,
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directives for this configuration.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.level.clone()];
        if self.hci_debug {
            directives.push("hci_bridge::protocol=debug".to_string());
        }
        if self.iut_debug {
            directives.push("hci_bridge::handler=debug".to_string());
        }
        if self.transport_debug {
            directives.push("hci_bridge::transport=debug".to_string());
            directives.push("hci_bridge::writer=debug".to_string());
        }
        directives.join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(self.filter_directives())
            .map_err(|e| BridgeError::Config(format!("invalid log level {:?}: {}", self.level, e)))
    }
}

/// Keeps the file writer flushing; drop it last.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = config.env_filter()?;

    let (file_layer, file_guard) = match &config.file {
        Some(path) => {
            let (dir, name) = split_log_path(path)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| BridgeError::Config(format!("logging already initialised: {}", e)))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let name = path
        .file_name()
        .ok_or_else(|| BridgeError::Config(format!("log file {} has no file name", path.display())))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(name)))
}
