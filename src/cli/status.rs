//! Status command

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;

use super::host_version;
use crate::config::Config;
use crate::events::LogSink;
use crate::scheduler;
use crate::signing::Verifier;
use crate::updater::Updater;

pub fn run(config: &Config) -> Result<()> {
    let updater = Updater::new(config.clone(), LogSink, host_version)?;

    println!("{}", "EonPlay updater status".bold());
    println!();
    println!("  {}: {}", "Installed".bold(), updater.installed_version().green());
    println!("  {}: {}", "Channel".bold(), config.server.channel);
    println!(
        "  {}: {}",
        "Platform".bold(),
        updater.platform().unwrap_or("unsupported")
    );
    println!("  {}: {}", "Server".bold(), config.server.url);
    println!(
        "  {}: {}",
        "Install dir".bold(),
        config.paths.install_dir.display()
    );

    let verifier = Verifier::from_config(config);
    let key_status = if verifier.has_key() {
        "loaded".green()
    } else {
        "missing (updates cannot be verified)".red()
    };
    println!("  {}: {}", "Release key".bold(), key_status);

    println!();
    match updater.last_check_time() {
        Some(last) => {
            println!(
                "  {}: {}",
                "Last check".bold(),
                last.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        None => println!("  {}: {}", "Last check".bold(), "never".dimmed()),
    }

    if config.schedule.automatic_check {
        let delay = scheduler::next_delay(
            Utc::now(),
            updater.last_check_time(),
            config.check_interval(),
        );
        println!(
            "  {}: every {}h, next in {}m",
            "Automatic checks".bold(),
            config.schedule.check_interval_hours,
            delay.as_secs() / 60
        );
    } else {
        println!("  {}: {}", "Automatic checks".bold(), "disabled".yellow());
    }

    let yes_no = |flag: bool| if flag { "yes".green() } else { "no".yellow() };
    println!("  {}: {}", "User consent".bold(), yes_no(updater.user_consent()));
    println!(
        "  {}: {}",
        "Automatic install".bold(),
        yes_no(config.policy.automatic_install)
    );

    let backups = updater.backups()?;
    println!(
        "  {}: {} of {}",
        "Backups".bold(),
        backups.len(),
        config.paths.max_backups
    );

    Ok(())
}
