//! Update check command

use anyhow::Result;
use colored::Colorize;

use super::{format_bytes, host_version};
use crate::config::Config;
use crate::events::LogSink;
use crate::updater::Updater;

pub async fn run(config: &Config) -> Result<()> {
    let mut updater = Updater::new(config.clone(), LogSink, host_version)?;

    println!(
        "{} {} channel for {} {}...",
        "Checking".cyan(),
        config.server.channel.to_string().bold(),
        updater.platform().unwrap_or("unknown platform"),
        updater.installed_version()
    );
    println!();

    match updater.check_for_updates().await {
        Ok(Some(info)) => {
            println!(
                "{} {} {} is available",
                "✓".green(),
                "EonPlay".bold(),
                info.version.green().bold()
            );
            if let Some(date) = info.release_date {
                println!("  {}: {}", "Released".bold(), date.format("%Y-%m-%d"));
            }
            println!("  {}: {}", "Size".bold(), format_bytes(info.size));
            if info.security {
                println!("  {}", "Contains security fixes".yellow().bold());
            }
            if info.critical {
                println!("  {}", "Marked critical by the publisher".red().bold());
            }
            if !info.notes.is_empty() {
                println!();
                for line in info.notes.lines() {
                    println!("  {}", line);
                }
            }
            println!();
            println!("Run {} to install it.", "eonplay-updater update".bold());
        }
        Ok(None) => {
            println!("{} You are running the latest version.", "✓".green());
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e.to_string().red());
            return Err(e.into());
        }
    }

    Ok(())
}
