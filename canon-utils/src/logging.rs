//! Logging setup for canon binaries
//!
//! Everything logs through `tracing`. The filter comes from `CANON_LOG`
//! when set, otherwise from the preset.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::{paths, CanonError, Result};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "CANON_LOG";

const SYNC_LOG_FILE: &str = "canon-sync.log";

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    /// Append to a file in the log directory
    File,
    /// Stderr and the log file
    Both,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub output: LogOutput,
    /// `EnvFilter` directives, e.g. `"info"` or `"canon_client=debug"`
    pub filter: String,
    /// Log span enter/exit
    pub span_events: bool,
    /// Include source file and line
    pub file_line: bool,
    /// Log file name inside the log directory
    pub file_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::cli()
    }
}

impl LogConfig {
    /// One-shot commands: stderr only
    pub fn cli() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: filter_from_env("warn"),
            span_events: false,
            file_line: false,
            file_name: SYNC_LOG_FILE.into(),
        }
    }

    /// The long-running sync runtime: stderr plus a log file that survives
    /// the terminal
    pub fn sync() -> Self {
        Self {
            output: LogOutput::Both,
            filter: filter_from_env("info"),
            ..Self::cli()
        }
    }

    /// Raise verbosity for `-v` / `-vv`
    ///
    /// An explicit `CANON_LOG` always wins.
    pub fn verbose(mut self, level: u8) -> Self {
        if level == 0 || std::env::var(LOG_ENV).is_ok() {
            return self;
        }
        self.filter = match level {
            1 => "canon_client=debug,canon_protocol=debug,info".into(),
            _ => "debug".into(),
        };
        self.file_line = level > 1;
        self.span_events = level > 1;
        self
    }

    /// Path of the log file for this configuration
    pub fn file_path(&self) -> PathBuf {
        paths::log_dir().join(&self.file_name)
    }
}

fn filter_from_env(default: &str) -> String {
    std::env::var(LOG_ENV).unwrap_or_else(|_| default.to_string())
}

/// Initialize logging with the CLI preset
pub fn init_logging() -> Result<()> {
    init_logging_with_config(LogConfig::default())
}

/// Install the global subscriber
///
/// Fails if the filter does not parse or a subscriber is already set.
pub fn init_logging_with_config(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| CanonError::config(format!("Invalid log filter '{}': {}", config.filter, e)))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if matches!(config.output, LogOutput::File | LogOutput::Both) {
        let file = open_log_file(&config.file_path())?;
        layers.push(
            format_layer(&config)
                .with_writer(file)
                .with_ansi(false)
                .boxed(),
        );
    }
    if matches!(config.output, LogOutput::Stderr | LogOutput::Both) {
        layers.push(format_layer(&config).with_writer(std::io::stderr).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| CanonError::internal(format!("Failed to init logging: {}", e)))
}

fn format_layer<S>(config: &LogConfig) -> fmt::Layer<S> {
    let span_events = if config.span_events {
        FmtSpan::ENTER | FmtSpan::EXIT
    } else {
        FmtSpan::NONE
    };
    fmt::layer()
        .with_target(true)
        .with_span_events(span_events)
        .with_file(config.file_line)
        .with_line_number(config.file_line)
}

fn open_log_file(path: &std::path::Path) -> Result<File> {
    paths::ensure_parent(path).map_err(|e| CanonError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CanonError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })
}
