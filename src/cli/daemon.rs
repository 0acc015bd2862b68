//! Background daemon

use anyhow::Result;
use colored::Colorize;

use super::host_version;
use crate::config::Config;
use crate::events::LogSink;
use crate::service::UpdaterService;
use crate::updater::{Updater, UpdaterState};

pub async fn run(config: &Config) -> Result<()> {
    let updater = Updater::new(config.clone(), LogSink, host_version)?;
    let (service, handle) = UpdaterService::new(updater);
    let task = tokio::spawn(service.run());

    println!(
        "{} checking every {}h on the {} channel (Ctrl-C to stop)",
        "eonplay-updater daemon".bold(),
        config.schedule.check_interval_hours,
        config.server.channel
    );

    let mut states = handle.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                match state {
                    UpdaterState::Completed => {
                        tracing::info!("Update installed, stopping so the player can restart");
                        break;
                    }
                    UpdaterState::Failed => {
                        tracing::warn!("Update cycle failed, waiting for the next check");
                        handle.reset();
                    }
                    _ => {}
                }
            }
        }
    }

    handle.shutdown();
    let updater = task.await?;
    if let Some(failure) = updater.failure() {
        println!("{} {}", "✗".red(), failure.message);
    }
    Ok(())
}
