//! Log setup for the relay binary.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Crates whose events follow `--log-level`.
const RELAY_TARGETS: &[&str] = &["tabsnap_relay", "tabsnap", "tower_http"];

/// Filter used when `RUST_LOG` is unset: `level` for the relay and the crates
/// it drives, warnings from everything else.
pub fn default_directives(level: LogLevel) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        RELAY_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.as_str())),
    );
    directives.join(",")
}

/// `RUST_LOG` when it is set and valid, otherwise [`default_directives`].
pub fn env_filter(level: LogLevel) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_directives(level))?),
    }
}

pub fn init_logging(level: LogLevel) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level)?)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("logging already initialized: {e}"))
}
