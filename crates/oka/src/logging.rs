//! Process-wide tracing setup.
//!
//! `RUST_LOG` takes precedence over the configured level. When a log file is
//! configured, output goes to the file instead of stderr.

use std::path::Path;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Parse one of the supported level names.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        other => Err(Error::Config(format!("invalid log level: {}", other))),
    }
}

/// Install the global subscriber. Call once, before any events are emitted.
pub fn init(level: &str, file: Option<&Path>) -> Result<()> {
    let level = parse_level(level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let installed = match file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::Config(format!("failed to open log file {}: {}", path.display(), e))
                })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("failed to install logger: {}", e)))
}
