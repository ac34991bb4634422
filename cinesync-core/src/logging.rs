//! Logging setup
//!
//! One global fmt subscriber shaped by config: a validated level
//! (overridable through `RUST_LOG`), pretty text or JSON lines, and
//! stdout or an append-only file as the destination.

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = env_filter(config)?;

    let writer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);

    if config.format.as_str() == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// `RUST_LOG` wins when set; otherwise the configured level, which must
/// be a real level name so typos fail at startup instead of silencing
/// the log.
fn env_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let level: Level = config
        .level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level: {}", config.level))?;
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string())))
}
