//! Single task owning the updater
//!
//! The host talks to [`UpdaterService`] through an [`UpdaterHandle`]. While
//! a check or download is running the service keeps reading commands:
//! `Cancel` aborts the running operation, anything else waits until it
//! finishes.

use std::collections::VecDeque;
use std::future;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::scheduler;
use crate::updater::{Updater, UpdaterState};

/// Requests a host can make
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Check,
    Download,
    Install,
    Cancel,
    Reset,
    SetConsent(bool),
    Shutdown,
}

/// Cloneable handle to a running [`UpdaterService`]
#[derive(Debug, Clone)]
pub struct UpdaterHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<UpdaterState>,
}

impl UpdaterHandle {
    /// Queue a command; false once the service has stopped
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn check(&self) -> bool {
        self.send(Command::Check)
    }

    pub fn download(&self) -> bool {
        self.send(Command::Download)
    }

    pub fn install(&self) -> bool {
        self.send(Command::Install)
    }

    pub fn cancel(&self) -> bool {
        self.send(Command::Cancel)
    }

    pub fn reset(&self) -> bool {
        self.send(Command::Reset)
    }

    pub fn set_consent(&self, consent: bool) -> bool {
        self.send(Command::SetConsent(consent))
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    /// Current updater state
    pub fn state(&self) -> UpdaterState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdaterState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`. `None` if the service
    /// stopped first.
    pub async fn wait_for(&self, predicate: impl FnMut(&UpdaterState) -> bool) -> Option<UpdaterState> {
        let mut rx = self.state.clone();
        rx.wait_for(predicate).await.ok().map(|state| *state)
    }
}

pub struct UpdaterService {
    updater: Updater,
    commands: mpsc::UnboundedReceiver<Command>,
    deferred: VecDeque<Command>,
}

impl UpdaterService {
    pub fn new(updater: Updater) -> (Self, UpdaterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = UpdaterHandle {
            commands: tx,
            state: updater.subscribe_state(),
        };
        let service = Self {
            updater,
            commands: rx,
            deferred: VecDeque::new(),
        };
        (service, handle)
    }

    /// Serve commands and scheduled checks until shutdown or until every
    /// handle is dropped. Gives the updater back.
    pub async fn run(mut self) -> Updater {
        tracing::info!("Updater service started");

        loop {
            let command = match self.deferred.pop_front() {
                Some(command) => Some(command),
                None => {
                    let delay = self.schedule_delay();
                    let tick = async move {
                        match delay {
                            Some(delay) => tokio::time::sleep(delay).await,
                            None => future::pending().await,
                        }
                    };

                    tokio::select! {
                        received = self.commands.recv() => match received {
                            Some(command) => Some(command),
                            None => break,
                        },
                        _ = tick => None,
                    }
                }
            };

            match command {
                None => self.scheduled_check().await,
                Some(Command::Shutdown) => break,
                Some(command) => self.handle(command).await,
            }
        }

        tracing::info!("Updater service stopped");
        self.updater
    }

    /// Sleep until the scheduler should look again; `None` when automatic
    /// checks are off
    fn schedule_delay(&self) -> Option<std::time::Duration> {
        let config = self.updater.config();
        if !config.schedule.automatic_check {
            return None;
        }
        let interval = config.check_interval();
        if self.updater.state() != UpdaterState::Idle {
            return Some(interval);
        }
        Some(scheduler::next_delay(
            Utc::now(),
            self.updater.last_check_time(),
            interval,
        ))
    }

    async fn scheduled_check(&mut self) {
        let config = self.updater.config();
        let due = scheduler::should_check(
            Utc::now(),
            self.updater.last_check_time(),
            self.updater.state(),
            config.schedule.automatic_check,
            config.check_interval(),
        );
        if !due {
            return;
        }

        tracing::info!("Scheduled update check");
        let cancel = cancel_requested(&mut self.commands, &mut self.deferred);
        if let Err(e) = self.updater.run_cycle_until(cancel).await {
            tracing::warn!("Scheduled update cycle ended: {}", e);
        }
    }

    async fn handle(&mut self, command: Command) {
        tracing::debug!("Handling {:?} in state {}", command, self.updater.state());

        let cancel = cancel_requested(&mut self.commands, &mut self.deferred);
        let result = match command {
            Command::Check => self.updater.run_cycle_until(cancel).await,
            Command::Download => self.updater.download_update_until(cancel).await.map(|_| ()),
            Command::Install => self.updater.install_update_until(cancel).await,
            Command::Cancel => {
                self.updater.cancel_update();
                Ok(())
            }
            Command::Reset => {
                self.updater.reset();
                Ok(())
            }
            Command::SetConsent(consent) => {
                self.updater.set_user_consent(consent);
                if consent {
                    self.updater.proceed_until(cancel).await
                } else {
                    Ok(())
                }
            }
            Command::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!("{:?} ended: {}", command, e);
        }
    }
}

/// Resolves when a `Cancel` arrives. Other commands are queued for later;
/// a `Shutdown` also cancels.
async fn cancel_requested(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    deferred: &mut VecDeque<Command>,
) {
    loop {
        match commands.recv().await {
            Some(Command::Cancel) => return,
            Some(Command::Shutdown) => {
                deferred.push_back(Command::Shutdown);
                return;
            }
            Some(other) => {
                tracing::debug!("Deferring {:?} until the current operation ends", other);
                deferred.push_back(other);
            }
            None => future::pending::<()>().await,
        }
    }
}
