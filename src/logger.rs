use std::path::PathBuf;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Target of the per-event trace lines written to the JSON event log.
pub const EVENT_TARGET: &str = "event";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `battery_core=debug`.
    pub log_level: String,
    /// Without a directory everything goes to stdout.
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
    pub event_file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            log_file: "battery.log".to_string(),
            event_file: "events.log".to_string(),
        }
    }
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
            ..Self::default()
        }
    }
}

/// Keeps the non-blocking writers flushing; drop it last.
#[must_use = "dropping the guard stops the log writers"]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber. A second call fails instead of panicking.
///
/// With a log directory:
/// - a daily rolling text log (`log_file`) filtered by `log_level`
/// - a daily rolling newline-delimited JSON log (`event_file`) that only
///   receives events with target `event`, i.e. every bus emission
pub fn init_tracing(config: &LogConfig) -> Result<LogGuard> {
    let Some(dir) = &config.log_dir else {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        Registry::default()
            .with(EnvFilter::new(&config.log_level))
            .with(fmt::layer().with_writer(writer).with_thread_names(true))
            .try_init()
            .context("tracing already initialised")?;
        return Ok(LogGuard { _guards: vec![guard] });
    };

    std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;

    // 1) plain-text rolling log for info!/warn!/error!
    let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.log_file);
    let (txt_writer, txt_guard) = tracing_appender::non_blocking(txt_appender);
    let txt_layer = fmt::layer()
        .with_writer(txt_writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new(&config.log_level));

    // 2) JSON rolling log, bus events only
    let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.event_file);
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_appender);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{}=trace", EVENT_TARGET)));

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("tracing already initialised")?;

    Ok(LogGuard {
        _guards: vec![txt_guard, json_guard],
    })
}
