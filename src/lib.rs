//! syncdeck: a web control panel daemon for supervised external commands.
//!
//! The crate wires a job supervisor (spawn, track, stop external processes,
//! capture their output into durable logs) to a small HTTP control plane.

pub mod cli;
pub mod config;
pub mod errors;
pub mod job;
pub mod logging;
pub mod registry;
pub mod runner;
pub mod server;
pub mod sink;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::Cli;
use crate::runner::{Supervisor, SupervisorConfig};
use crate::server::AppState;

/// Runtime settings derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: String,
    pub log_dir: PathBuf,
    pub combined_log: bool,
    pub tail_lines: usize,
    pub grace_ms: u64,
    pub stream_poll_ms: u64,
}

impl Settings {
    pub fn resolve(cli: &Cli, config: &config::Config) -> Self {
        const DEFAULT_LISTEN: &str = "127.0.0.1:8380";
        const DEFAULT_LOG_DIR: &str = "logs";
        const DEFAULT_TAIL_LINES: usize = 100;
        const DEFAULT_GRACE_MS: u64 = 5_000;
        const DEFAULT_STREAM_POLL_MS: u64 = 200;

        let listen = cli
            .listen
            .clone()
            .or_else(|| config.listen.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let log_dir = cli
            .log_dir
            .clone()
            .or_else(|| config.log_dir.clone().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        let combined_log = if cli.no_combined_log {
            false
        } else {
            config.combined_log.unwrap_or(true)
        };
        let tail_lines = config.tail_lines.unwrap_or(DEFAULT_TAIL_LINES);
        let grace_ms = cli.grace_ms.or(config.grace_ms).unwrap_or(DEFAULT_GRACE_MS);
        let stream_poll_ms = config.stream_poll_ms.unwrap_or(DEFAULT_STREAM_POLL_MS);

        Self {
            listen,
            log_dir,
            combined_log,
            tail_lines,
            grace_ms,
            stream_poll_ms,
        }
    }
}

/// High-level entry point used by `main.rs`.
///
/// Loads configuration, builds the supervisor, and serves the HTTP control
/// plane until a shutdown signal arrives.
pub async fn run(cli: Cli) -> Result<()> {
    let config = if cli.no_config {
        config::Config::default()
    } else {
        match cli.config.clone().or_else(default_config_path) {
            Some(path) => config::load_config(&path)?,
            None => config::Config::default(),
        }
    };
    let settings = Settings::resolve(&cli, &config);

    let supervisor = Arc::new(Supervisor::new(
        settings.log_dir.clone(),
        SupervisorConfig {
            grace: Duration::from_millis(settings.grace_ms),
            tail_lines: settings.tail_lines,
            combined_log: settings.combined_log,
        },
    ));
    // Fresh aggregated log for each daemon run; also creates the log dir.
    supervisor
        .reset_combined_log()
        .context("failed to prepare log directory")?;

    let listener = tokio::net::TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    info!(listen = %settings.listen, log_dir = %settings.log_dir.display(), "syncdeck listening");

    let app = server::router(AppState {
        supervisor: supervisor.clone(),
        stream_poll: Duration::from_millis(settings.stream_poll_ms),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, stopping remaining jobs");
    supervisor.shutdown_all().await;
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("syncdeck.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
