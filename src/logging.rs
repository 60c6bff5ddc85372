//! Tracing setup.
//!
//! Log level is controlled by:
//! 1. `--verbose` sets level to DEBUG
//! 2. `RUST_LOG` environment variable (if set)
//! 3. Default is INFO
//!
//! Console output goes to stderr so command output on stdout stays clean.
//! When a log directory is given, a plain-text copy is appended to
//! `<dir>/stagehand.log`, which survives host restarts.

use std::path::Path;

use clap::ValueEnum;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Prefix for human-facing orchestrator messages.
pub const LOG_TAG: &str = "[stagehand]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub fn init_tracing(verbose: bool, format: LogFormat, log_dir: Option<&Path>) {
    let filter = if verbose {
        EnvFilter::new("stagehand=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stagehand=info"))
    };

    let text_layer = (format == LogFormat::Text).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });
    let json_layer = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
    });
    let file_layer = log_dir
        .and_then(|dir| {
            RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix("stagehand")
                .filename_suffix("log")
                .build(dir)
                .ok()
        })
        .map(|appender| fmt::layer().with_ansi(false).with_writer(appender));

    // A second init (tests, supervise children in-process) keeps the first.
    let _ = tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .with(filter)
        .try_init();
}
