//! Configuration management for syncdeck.
//!
//! This module defines the structure of the `syncdeck.toml` configuration
//! file and provides functionality to load and parse it. Every field is
//! optional; CLI flags override file values and the daemon falls back to
//! built-in defaults for the rest.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `syncdeck.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen: Option<String>,
    /// Directory for durable job logs.
    pub log_dir: Option<String>,
    /// Whether job output also fans out to the aggregated log.
    pub combined_log: Option<bool>,
    /// Number of meaningful lines returned by the output endpoint.
    pub tail_lines: Option<usize>,
    /// Milliseconds to wait between graceful termination and force-kill.
    pub grace_ms: Option<u64>,
    /// Milliseconds between sink reads on the stream endpoint.
    pub stream_poll_ms: Option<u64>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
