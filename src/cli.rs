//! Command-line interface definition.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "syncdeck",
    version,
    about = "Web control panel for supervised sync and shell jobs"
)]
pub struct Cli {
    /// Path to syncdeck.toml configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Ignore any syncdeck.toml in the current directory.
    #[arg(long)]
    pub no_config: bool,
    /// Address to listen on.
    #[arg(long)]
    pub listen: Option<String>,
    /// Directory for durable job logs.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Grace period before force-killing a stopped job (ms).
    #[arg(long)]
    pub grace_ms: Option<u64>,
    /// Disable the aggregated combined log.
    #[arg(long)]
    pub no_combined_log: bool,
    /// Log filter (overrides SYNCDECK_LOG), e.g. "debug".
    #[arg(long)]
    pub log_level: Option<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
