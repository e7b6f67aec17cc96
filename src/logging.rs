//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log filter:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `SYNCDECK_LOG` environment variable (e.g. "info", "syncdeck=debug")
//! 3. default to `info`

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the global logging subscriber. Call once at startup.
pub fn init_logging(cli_filter: Option<&str>) -> Result<()> {
    let filter = match cli_filter {
        Some(spec) => EnvFilter::try_new(spec)?,
        None => EnvFilter::try_from_env("SYNCDECK_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}
