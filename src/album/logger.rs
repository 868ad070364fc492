//! Structured logging for the album service
//!
//! Console output plus a daily rolling file in the log directory, either as
//! plain lines or JSON. `RUST_LOG` overrides the configured level.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use crate::album::config_loader::Logging;

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

pub const LOG_FILE_NAME: &str = "worlds_album.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn build_filter(level: &str) -> LoggerResult<EnvFilter> {
    EnvFilter::try_from_default_env().or_else(|_| parse_filter(level))
}

fn parse_filter(directives: &str) -> LoggerResult<EnvFilter> {
    EnvFilter::try_new(directives).map_err(|e| LoggerError::Filter(e.to_string()))
}

fn file_layer(log_dir: &Path, json: bool) -> LoggerResult<(BoxedLayer, WorkerGuard)> {
    fs::create_dir_all(log_dir)?;
    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = if json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };
    Ok((layer, guard))
}

fn terminal_layer(json: bool) -> BoxedLayer {
    if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    }
}

/// Install the global subscriber. The returned guard must be held for the
/// lifetime of the process so buffered file output is flushed on exit.
pub fn init_logging(config: &Logging, log_dir: &Path) -> LoggerResult<Option<WorkerGuard>> {
    let json = config.log_format.eq_ignore_ascii_case("json");
    let filter = build_filter(&config.log_level)?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.log_to_file {
        let (layer, file_guard) = file_layer(log_dir, json)?;
        layers.push(layer);
        guard = Some(file_guard);
    }
    if config.log_to_terminal {
        layers.push(terminal_layer(json));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %config.log_format,
        log_level = %config.log_level,
        log_dir = %log_dir.display(),
        "Logger initialized"
    );

    Ok(guard)
}
