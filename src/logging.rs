//! Log sink setup
//!
//! Installs a global `tracing` subscriber writing to the configured log file
//! (appending) or to stdout. `RUST_LOG` takes precedence over the configured
//! level when set.

use crate::config::Configuration;
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// # Errors
///
/// An unknown log level is a configuration error, as is a log file that
/// cannot be opened. Installing twice fails.
pub fn init(configuration: &Configuration) -> Result<()> {
    let filter = env_filter(&configuration.log_level())?;

    let installed = match configuration.log_path() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::config(format!("Failed to open log file {}: {e}", path.display())))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init()
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    installed.map_err(|e| Error::config(format!("Failed to install logger: {e}")))
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = parse_level(level)?;
    Ok(EnvFilter::default().add_directive(level.into()))
}

fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("Unknown log level \"{level}\"")))
}
