//! Unified logging setup for canbridge binaries
//!
//! Console output goes to stderr with a bracketed level format so that
//! interactive prompt output on stdout stays readable. An optional daily
//! rolling file sink can be added through `tracing-appender`.

use std::path::PathBuf;

use thiserror::Error;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Errors raised while installing the global subscriber
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to create log directory {path}: {reason}")]
    LogDir { path: String, reason: String },

    #[error("Failed to install subscriber: {0}")]
    Install(String),
}

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809123Z [INFO] Bridge loop started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and as the default debug target
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is not set (e.g. "info")
    pub level: String,
    /// Directory for the daily rolling log file; `None` disables the file sink
    pub log_dir: Option<PathBuf>,
    /// Write the file sink as JSON lines
    pub enable_json: bool,
    /// Colorize console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            log_dir: None,
            enable_json: false,
            ansi: true,
        }
    }
}

/// Keeps the non-blocking file writer flushing until dropped.
///
/// Hold this in `main` for the lifetime of the process.
#[must_use = "dropping the guard stops the file log writer"]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Build the effective filter.
///
/// `RUST_LOG` wins when present; otherwise the configured level is used.
pub fn build_filter(level: &str, env_override: Option<&str>) -> Result<EnvFilter, LoggingError> {
    let directive = env_override
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(level);

    EnvFilter::try_new(directive).map_err(|e| LoggingError::InvalidFilter {
        filter: directive.to_string(),
        reason: e.to_string(),
    })
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<LogGuard, LoggingError> {
    let env_value = std::env::var("RUST_LOG").ok();
    let filter = build_filter(&config.level, env_value.as_deref())?;

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| LoggingError::LogDir {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;

            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_level(true)
                    .with_target(true)
                    .with_thread_ids(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {}", config.service_name, dir.display()),
        None => tracing::debug!("Logging: {} (console only)", config.service_name),
    }

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}
