//! Tracing subscriber setup for the CLI
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's job. Output goes to stderr so `--json` stdout stays parseable.

use anyhow::{anyhow, bail, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber at `level`
///
/// `RUST_LOG` directives take precedence over `level`. Fails if a global
/// subscriber is already set.
pub fn init_logging(level: &str) -> Result<()> {
    let default_level = parse_log_level(level)?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::debug!(level, "logger initialized");
    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => bail!("Invalid log level: {level}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_init_rejects_bad_level() {
        assert!(init_logging("chatty").is_err());
    }
}
