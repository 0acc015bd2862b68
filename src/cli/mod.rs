//! Command-line interface for eonplay-updater

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

mod backups;
mod check;
mod daemon;
mod keygen;
mod sign;
mod status;
mod update;

#[derive(Subcommand)]
pub enum Commands {
    /// Ask the update server whether a newer version exists
    Check,

    /// Download, verify and install the newest version
    Update {
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show installed version, channel and updater state
    Status,

    /// List installation backups
    Backups,

    /// Delete old backups beyond the configured limit
    Prune,

    /// Restore the installation from the newest backup
    Rollback {
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Run in the background, checking on the configured schedule
    Daemon,

    /// Generate a new release signing key
    Keygen {
        /// Name recorded in the key files
        #[arg(long)]
        name: String,

        /// Output directory for keys
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Sign a release artifact for the manifest
    Sign {
        /// Artifact to sign
        artifact: PathBuf,

        /// Path to the release secret key
        #[arg(long)]
        key: PathBuf,

        /// Version to emit a complete manifest entry for
        #[arg(long, requires = "url")]
        version: Option<String>,

        /// Download URL for the manifest entry
        #[arg(long, requires = "version")]
        url: Option<String>,

        /// Platform identifiers for the manifest entry
        #[arg(long = "platform")]
        platforms: Vec<String>,
    },
}

/// Execute a CLI command
pub async fn execute(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Check => check::run(config).await,
        Commands::Update { yes } => update::run(yes, config).await,
        Commands::Status => status::run(config),
        Commands::Backups => backups::list(config),
        Commands::Prune => backups::prune(config),
        Commands::Rollback { yes } => backups::rollback(yes, config),
        Commands::Daemon => daemon::run(config).await,
        Commands::Keygen { name, output } => keygen::run(&name, output.as_deref(), config),
        Commands::Sign {
            artifact,
            key,
            version,
            url,
            platforms,
        } => sign::run(&artifact, &key, version.as_deref(), url.as_deref(), &platforms),
    }
}

/// Version reported by the host build this updater ships with
pub(crate) fn host_version() -> String {
    std::env::var("EONPLAY_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
}

/// Ask a yes/no question on the terminal
pub(crate) fn confirm(question: &str) -> Result<bool> {
    use std::io::Write;

    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
