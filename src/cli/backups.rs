//! Backup listing, pruning and manual rollback

use anyhow::{Context, Result};
use colored::Colorize;

use super::confirm;
use crate::backup::BackupManager;
use crate::config::Config;
use crate::state::StateStore;

fn manager(config: &Config) -> BackupManager {
    BackupManager::new(
        &config.paths.install_dir,
        &config.paths.backup_dir,
        config.paths.max_backups,
    )
}

/// List backups, newest first
pub fn list(config: &Config) -> Result<()> {
    let records = manager(config).list()?;

    if records.is_empty() {
        println!("{}", "No backups found.".dimmed());
        return Ok(());
    }

    println!("{}", "Installation backups:".bold());
    println!();
    for record in records.iter().rev() {
        println!(
            "  {} {}  {}",
            record.version.green().bold(),
            record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            record.path.display().to_string().dimmed()
        );
    }
    println!();
    println!("{} backup(s), keeping at most {}", records.len(), config.paths.max_backups);

    Ok(())
}

pub fn prune(config: &Config) -> Result<()> {
    let removed = manager(config).prune()?;

    if removed.is_empty() {
        println!("{} Nothing to prune.", "✓".green());
    } else {
        for record in &removed {
            println!("  {} Removed backup of {}", "✓".green(), record.version);
        }
    }
    Ok(())
}

/// Restore the newest backup over the installation
pub fn rollback(yes: bool, config: &Config) -> Result<()> {
    let manager = manager(config);
    let Some(latest) = manager.latest()? else {
        println!("{}", "No backups to restore.".yellow());
        return Ok(());
    };

    println!(
        "Restore {} from the backup of {} taken {}?",
        config.paths.install_dir.display(),
        latest.version.bold(),
        latest.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if !yes && !confirm("Continue")? {
        println!("{}", "Rollback cancelled.".yellow());
        return Ok(());
    }

    manager
        .restore_from(&latest)
        .context("Rollback failed")?;

    let store = StateStore::new(&config.paths.state_file);
    let mut state = store.load();
    state.installed_version = Some(latest.version.clone());
    store.save(&state)?;

    println!("{} Restored EonPlay {}", "✓".green(), latest.version.bold());
    Ok(())
}
