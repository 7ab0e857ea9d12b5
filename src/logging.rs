//! Diagnostic logging setup.
//!
//! Diagnostics go to stderr so they never interleave with the terminal sink,
//! which owns stdout.

use anyhow::Result;
use std::io;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding filter directives, e.g. `devenv=trace`.
pub const LOG_ENV: &str = "DEVENV_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Build the filter: `DEVENV_LOG` if set, otherwise `debug` when verbose and
/// `info` when not.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let filter = env_filter(verbose);
    match format {
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_writer(io::stderr)
                .with_target(verbose)
                .compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false)
                .json();
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_is_pretty() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_second_init_fails() {
        // Only one global subscriber per process.
        let _ = init_logging(false, LogFormat::Json);
        assert!(init_logging(true, LogFormat::Pretty).is_err());
    }
}
