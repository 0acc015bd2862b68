//! Interactive update command

use anyhow::{bail, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use super::{confirm, format_bytes, host_version};
use crate::config::Config;
use crate::error::{ErrorKind, UpdateError};
use crate::events::{FanOut, LogSink, UpdaterEvent};
use crate::updater::{FailureInfo, Updater};

/// Run the update command
pub async fn run(yes: bool, config: &Config) -> Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let sink = FanOut::new().with(LogSink).with(tx);
    let mut updater = Updater::new(config.clone(), sink, host_version)?;

    println!("{}", "Checking for updates...".cyan());
    let Some(info) = updater.check_for_updates().await? else {
        println!("{} You are running the latest version.", "✓".green());
        return Ok(());
    };

    println!();
    println!(
        "  {} -> {} ({})",
        updater.installed_version().dimmed(),
        info.version.green().bold(),
        format_bytes(info.size)
    );
    println!();

    if !yes && !confirm("Download and install this update?")? {
        updater.cancel_update();
        println!("{}", "Update cancelled.".yellow());
        return Ok(());
    }

    let bar = ProgressBar::new(info.size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.set_message("Downloading");

    let progress_bar = bar.clone();
    let renderer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UpdaterEvent::DownloadProgress(p) => progress_bar.set_position(p.bytes_received),
                UpdaterEvent::DownloadCompleted(_) => {
                    progress_bar.finish_with_message("Downloaded")
                }
                UpdaterEvent::InstallStarted => println!("{}", "Installing...".cyan()),
                _ => {}
            }
        }
    });

    // Ctrl-C aborts the download; the installer itself is never interrupted
    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let result = updater.install_update_until(interrupted).await;

    let failure = updater.failure().cloned();
    drop(updater);
    let _ = renderer.await;
    bar.finish_and_clear();

    println!();
    match result {
        Ok(()) => {
            println!(
                "{} EonPlay {} installed. Restart the player to use it.",
                "✓".green(),
                info.version.bold()
            );
            Ok(())
        }
        Err(UpdateError::Cancelled) => {
            println!("{}", "Download cancelled.".yellow());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e.to_string().red());
            if let Some(failure) = failure {
                report_failure(&failure);
            }
            bail!("update failed")
        }
    }
}

fn report_failure(failure: &FailureInfo) {
    if failure.rolled_back {
        println!("  The previous installation was restored from backup.");
    } else if failure.critical {
        println!(
            "  {}",
            "The installation may be damaged. Try: eonplay-updater rollback"
                .red()
                .bold()
        );
    } else if failure.kind == ErrorKind::Verification {
        println!("  The download was discarded. No changes were made.");
    }
}
