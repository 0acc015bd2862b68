//! eonplay-updater - secure auto-updater for the EonPlay media player

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use eonplay_updater::cli::{self, Commands};
use eonplay_updater::config::Config;

#[derive(Parser)]
#[command(name = "eonplay-updater")]
#[command(author, version, about = "Secure auto-updater for the EonPlay media player")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "EONPLAY_UPDATER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Config::load(cli.config.as_deref())?;

    cli::execute(cli.command, &config).await
}
