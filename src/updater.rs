//! Update state machine
//!
//! [`Updater`] drives one update cycle at a time:
//!
//! ```text
//! Idle -> Checking -> Available -> Downloading -> Installing -> Completed
//!                                        |             |
//!                                        v             v
//!                                      Failed <---- Rollback
//! ```
//!
//! Every transition is checked against [`UpdaterState::can_transition_to`]
//! and published both as a `state-changed` event and on a watch channel.

use std::fmt;
use std::future::{self, Future};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backup::{BackupManager, BackupRecord};
use crate::config::Config;
use crate::download::Downloader;
use crate::error::{ErrorKind, Result, UpdateError};
use crate::events::{EventSink, UpdaterEvent, VersionProbe};
use crate::installer::InstallerDriver;
use crate::manifest::{ManifestClient, UpdateInfo};
use crate::platform::current_platform;
use crate::progress::UpdateProgress;
use crate::signing::{VerifiedArtifact, Verifier};
use crate::state::{PersistedState, StateStore};
use crate::version::is_newer;

/// Lifecycle state of the updater
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdaterState {
    Idle,
    Checking,
    Available,
    Downloading,
    Installing,
    Completed,
    Failed,
    Rollback,
}

impl UpdaterState {
    /// Whether `next` may follow this state
    pub fn can_transition_to(self, next: UpdaterState) -> bool {
        use UpdaterState::*;

        matches!(
            (self, next),
            (Idle, Checking)
                | (Checking, Available)
                | (Checking, Idle)
                | (Checking, Failed)
                | (Available, Downloading)
                | (Available, Installing)
                | (Available, Idle)
                | (Downloading, Installing)
                | (Downloading, Available)
                | (Downloading, Failed)
                | (Downloading, Idle)
                | (Installing, Completed)
                | (Installing, Failed)
                | (Installing, Rollback)
                | (Rollback, Failed)
                | (Completed, Idle)
                | (Failed, Idle)
        )
    }

    /// States an in-flight cancel applies to
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            UpdaterState::Checking | UpdaterState::Available | UpdaterState::Downloading
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UpdaterState::Completed | UpdaterState::Failed)
    }
}

impl fmt::Display for UpdaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdaterState::Idle => "idle",
            UpdaterState::Checking => "checking",
            UpdaterState::Available => "available",
            UpdaterState::Downloading => "downloading",
            UpdaterState::Installing => "installing",
            UpdaterState::Completed => "completed",
            UpdaterState::Failed => "failed",
            UpdaterState::Rollback => "rollback",
        };
        write!(f, "{}", name)
    }
}

/// The most recent error, as shown to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Why the current cycle ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// The previous installation was restored from backup
    pub rolled_back: bool,
    /// The installation may be damaged and needs attention
    pub critical: bool,
}

/// Orchestrates checking, downloading, verifying, installing and rolling
/// back updates
pub struct Updater {
    config: Config,
    platform: Option<String>,
    sink: Box<dyn EventSink + Send>,
    probe: Box<dyn VersionProbe + Send>,

    state: UpdaterState,
    state_tx: watch::Sender<UpdaterState>,
    progress: Option<UpdateProgress>,
    update_info: Option<UpdateInfo>,
    verified: Option<VerifiedArtifact>,
    last_error: Option<LastError>,
    failure: Option<FailureInfo>,
    user_consent: bool,

    verifier: Verifier,
    manifest: ManifestClient,
    downloader: Downloader,
    backups: BackupManager,
    installer: InstallerDriver,
    store: StateStore,
    persisted: PersistedState,
}

impl Updater {
    /// Build an updater from configuration.
    ///
    /// The trusted key is loaded once here; the probe reports the version
    /// the host is running.
    pub fn new(
        config: Config,
        sink: impl EventSink + Send + 'static,
        probe: impl VersionProbe + Send + 'static,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| UpdateError::Config(format!("{:#}", e)))?;

        let verifier = Verifier::from_config(&config);
        let manifest = ManifestClient::new(
            &config.server.url,
            config.manifest_timeout(),
            config.server.allow_http,
        )?;
        let downloader = Downloader::new(&config.paths.download_dir, config.download_timeout())?;
        let backups = BackupManager::new(
            &config.paths.install_dir,
            &config.paths.backup_dir,
            config.paths.max_backups,
        );
        let installer = InstallerDriver::new(
            &config.paths.install_dir,
            config.installer_timeout(),
            config.installer.command.clone(),
        );

        let store = StateStore::new(&config.paths.state_file);
        let mut persisted = store.load();

        // A recorded install that the running build has not caught up with
        // still counts as installed
        let probed = probe.installed_version();
        let installed = match persisted.installed_version.take() {
            Some(recorded) if is_newer(&recorded, &probed) => recorded,
            _ => probed,
        };
        persisted.installed_version = Some(installed);

        let platform = config.server.platform.clone().or_else(current_platform);
        let (state_tx, _) = watch::channel(UpdaterState::Idle);

        Ok(Self {
            user_consent: config.policy.user_consent,
            config,
            platform,
            sink: Box::new(sink),
            probe: Box::new(probe),
            state: UpdaterState::Idle,
            state_tx,
            progress: None,
            update_info: None,
            verified: None,
            last_error: None,
            failure: None,
            verifier,
            manifest,
            downloader,
            backups,
            installer,
            store,
            persisted,
        })
    }

    pub fn state(&self) -> UpdaterState {
        self.state
    }

    /// Watch state changes without going through the event sink
    pub fn subscribe_state(&self) -> watch::Receiver<UpdaterState> {
        self.state_tx.subscribe()
    }

    pub fn progress(&self) -> Option<&UpdateProgress> {
        self.progress.as_ref()
    }

    pub fn update_info(&self) -> Option<&UpdateInfo> {
        self.update_info.as_ref()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureInfo> {
        self.failure.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn user_consent(&self) -> bool {
        self.user_consent
    }

    pub fn last_check_time(&self) -> Option<DateTime<Utc>> {
        self.persisted.last_check_time
    }

    /// Path of the downloaded artifact awaiting install, if any
    pub fn verified_artifact(&self) -> Option<PathBuf> {
        self.verified.as_ref().map(|a| a.path().to_path_buf())
    }

    /// Version currently installed
    pub fn installed_version(&self) -> String {
        self.persisted
            .installed_version
            .clone()
            .unwrap_or_else(|| self.probe.installed_version())
    }

    /// Snapshots on disk, oldest first
    pub fn backups(&self) -> Result<Vec<BackupRecord>> {
        self.backups.list()
    }

    /// Record the user's answer to automatic updates
    pub fn set_user_consent(&mut self, consent: bool) {
        tracing::info!("User consent for automatic updates: {}", consent);
        self.user_consent = consent;
        if consent
            && self
                .last_error
                .as_ref()
                .is_some_and(|e| e.kind == ErrorKind::Policy)
        {
            self.last_error = None;
        }
    }

    /// Check the server for a newer version
    pub async fn check_for_updates(&mut self) -> Result<Option<UpdateInfo>> {
        self.check_for_updates_until(future::pending()).await
    }

    /// Check for updates, giving up as soon as `cancel` completes.
    ///
    /// Transport and parse problems leave the updater `Idle` with the cause
    /// in [`Updater::last_error`]; the error is still returned.
    pub async fn check_for_updates_until<C>(&mut self, cancel: C) -> Result<Option<UpdateInfo>>
    where
        C: Future<Output = ()>,
    {
        let result = self.run_check(cancel).await;
        self.settle(result)
    }

    /// Download and verify the offered update, then wait for install
    pub async fn download_update(&mut self) -> Result<PathBuf> {
        self.download_update_until(future::pending()).await
    }

    pub async fn download_update_until<C>(&mut self, cancel: C) -> Result<PathBuf>
    where
        C: Future<Output = ()>,
    {
        let result = match self.run_download(cancel).await {
            Ok(artifact) => {
                let path = artifact.path().to_path_buf();
                self.verified = Some(artifact);
                self.set_state(UpdaterState::Available).map(|_| path)
            }
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    /// Install the offered update, downloading it first when needed
    pub async fn install_update(&mut self) -> Result<()> {
        self.install_update_until(future::pending()).await
    }

    pub async fn install_update_until<C>(&mut self, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        let result = self.run_install(cancel).await;
        self.settle(result)
    }

    /// Check, then move forward as far as consent and policy allow
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.run_cycle_until(future::pending()).await
    }

    pub async fn run_cycle_until<C>(&mut self, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);

        if self.state == UpdaterState::Idle {
            match self.check_for_updates_until(cancel.as_mut()).await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(e) if e.kind() != ErrorKind::Internal && self.state == UpdaterState::Idle => {
                    return Ok(())
                }
                Err(e) => return Err(e),
            }
        }

        self.proceed_until(cancel).await
    }

    /// Continue from `Available` without the user asking.
    ///
    /// Without consent nothing happens and a policy error is recorded.
    /// Without automatic install the cycle stops once the download is
    /// verified.
    pub async fn proceed_until<C>(&mut self, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        if self.state != UpdaterState::Available {
            return Ok(());
        }

        if !self.user_consent {
            tracing::info!("Update available but automatic updates need user consent");
            self.record_error(&UpdateError::Policy(
                "User consent is required before updating automatically".to_string(),
            ));
            return Ok(());
        }

        if self.config.policy.automatic_install {
            self.install_update_until(cancel).await
        } else if self.verified.is_none() {
            self.download_update_until(cancel).await.map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Abandon the offered update.
    ///
    /// In-flight checks and downloads are cancelled through the `cancel`
    /// future of the `*_until` calls; this handles the idle offer.
    /// Returns whether anything was cancelled.
    pub fn cancel_update(&mut self) -> bool {
        if !self.state.is_cancellable() {
            return false;
        }

        tracing::info!("Cancelling update in state {}", self.state);
        self.discard_offer();
        match self.set_state(UpdaterState::Idle) {
            Ok(()) => true,
            Err(e) => {
                self.fail(&e, false, true);
                false
            }
        }
    }

    /// Leave `Completed` or `Failed` for a fresh cycle
    pub fn reset(&mut self) -> bool {
        if !self.state.is_terminal() {
            return false;
        }

        self.discard_offer();
        self.failure = None;
        match self.set_state(UpdaterState::Idle) {
            Ok(()) => true,
            Err(e) => {
                self.fail(&e, false, true);
                false
            }
        }
    }

    async fn run_check<C>(&mut self, cancel: C) -> Result<Option<UpdateInfo>>
    where
        C: Future<Output = ()>,
    {
        if self.state != UpdaterState::Idle {
            return Err(UpdateError::Policy(format!(
                "Cannot check for updates while {}",
                self.state
            )));
        }

        self.set_state(UpdaterState::Checking)?;
        self.emit(UpdaterEvent::CheckStarted);

        let Some(platform) = self.platform.clone() else {
            let err = UpdateError::Policy(format!(
                "Unsupported platform {}-{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ));
            self.record_error(&err);
            self.emit(UpdaterEvent::CheckCompleted(false));
            self.set_state(UpdaterState::Idle)?;
            return Err(err);
        };

        let current = self.installed_version();
        let channel = self.config.server.channel;
        tracing::info!(
            "Checking {} channel for {} (installed {})",
            channel,
            platform,
            current
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel => Err(UpdateError::Cancelled),
            outcome = self.manifest.check(channel, &platform, &current) => outcome,
        };

        match outcome {
            Ok(found) => {
                self.touch_last_check();
                self.last_error = None;
                self.emit(UpdaterEvent::CheckCompleted(found.is_some()));

                match found {
                    Some(info) => {
                        tracing::info!("Update available: {} -> {}", current, info.version);
                        self.update_info = Some(info.clone());
                        self.emit(UpdaterEvent::UpdateAvailable(info.clone()));
                        self.set_state(UpdaterState::Available)?;
                        Ok(Some(info))
                    }
                    None => {
                        tracing::info!("No update available");
                        self.set_state(UpdaterState::Idle)?;
                        Ok(None)
                    }
                }
            }
            Err(UpdateError::Cancelled) => {
                tracing::info!("Update check cancelled");
                self.emit(UpdaterEvent::CheckCompleted(false));
                self.set_state(UpdaterState::Idle)?;
                Err(UpdateError::Cancelled)
            }
            Err(e) if matches!(e.kind(), ErrorKind::Transport | ErrorKind::Parse) => {
                tracing::warn!("Update check failed: {}", e);
                self.touch_last_check();
                self.record_error(&e);
                self.emit(UpdaterEvent::CheckCompleted(false));
                self.set_state(UpdaterState::Idle)?;
                Err(e)
            }
            Err(e) => {
                self.fail(&e, false, e.kind() == ErrorKind::Internal);
                Err(e)
            }
        }
    }

    /// Download and verify; leaves the state at `Downloading` on success
    async fn run_download<C>(&mut self, cancel: C) -> Result<VerifiedArtifact>
    where
        C: Future<Output = ()>,
    {
        if self.state != UpdaterState::Available {
            return Err(UpdateError::Policy(format!(
                "No update to download while {}",
                self.state
            )));
        }
        let info = self
            .update_info
            .clone()
            .ok_or_else(|| UpdateError::Internal("Available without update info".to_string()))?;

        self.set_state(UpdaterState::Downloading)?;
        self.emit(UpdaterEvent::DownloadStarted);

        let sink = &mut self.sink;
        let progress = &mut self.progress;
        let downloaded = self
            .downloader
            .download(&info, cancel, |report| {
                *progress = Some(report.clone());
                sink.emit(UpdaterEvent::DownloadProgress(report));
            })
            .await;

        let path = match downloaded {
            Ok(path) => path,
            Err(UpdateError::Cancelled) => {
                tracing::info!("Download cancelled");
                self.discard_offer();
                self.set_state(UpdaterState::Idle)?;
                return Err(UpdateError::Cancelled);
            }
            Err(e) => {
                self.progress = None;
                self.fail(&e, false, false);
                return Err(e);
            }
        };

        self.emit(UpdaterEvent::DownloadCompleted(path.clone()));

        let verifier = self.verifier.clone();
        let candidate = path.clone();
        let expected = info.clone();
        let verified =
            tokio::task::spawn_blocking(move || verifier.verify_artifact(&candidate, &expected))
                .await?;

        match verified {
            Some(artifact) => Ok(artifact),
            None => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("Could not delete rejected artifact {}: {}", path.display(), e);
                }
                self.progress = None;
                let err = UpdateError::Verification;
                self.fail(&err, false, false);
                Err(err)
            }
        }
    }

    async fn run_install<C>(&mut self, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        if self.state != UpdaterState::Available {
            return Err(UpdateError::Policy(format!(
                "No update to install while {}",
                self.state
            )));
        }

        let artifact = match self.verified.take() {
            Some(artifact) => artifact,
            None => self.run_download(cancel).await?,
        };

        self.set_state(UpdaterState::Installing)?;
        self.install_verified(artifact).await
    }

    async fn install_verified(&mut self, artifact: VerifiedArtifact) -> Result<()> {
        self.emit(UpdaterEvent::InstallStarted);
        self.report_install("Backing up", 0);

        let previous = self.installed_version();
        let backups = self.backups.clone();
        let backup = match tokio::task::spawn_blocking(move || backups.create(&previous)).await? {
            Ok(backup) => backup,
            Err(e) => {
                tracing::error!("Backup failed, not installing: {}", e);
                self.fail(&e, false, false);
                return Err(e);
            }
        };

        self.report_install("Installing", 30);

        match self.installer.run(&artifact, &backup).await {
            Ok(()) => {
                tracing::info!("Installed {}", artifact.version());
                self.persisted.installed_version = Some(artifact.version().to_string());
                self.persist();

                if let Err(e) = tokio::fs::remove_file(artifact.path()).await {
                    tracing::warn!("Could not delete {}: {}", artifact.path().display(), e);
                }

                let backups = self.backups.clone();
                match tokio::task::spawn_blocking(move || backups.prune()).await? {
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Could not prune backups: {}", e),
                }

                self.report_install("Installing", 100);
                self.emit(UpdaterEvent::InstallCompleted);
                self.progress = None;
                self.update_info = None;
                self.last_error = None;
                self.set_state(UpdaterState::Completed)?;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Installation failed: {}", e);
                self.progress = None;
                self.set_state(UpdaterState::Rollback)?;

                let backups = self.backups.clone();
                let record = backup.clone();
                let restored =
                    tokio::task::spawn_blocking(move || backups.restore_from(&record)).await?;

                if let Err(e) = tokio::fs::remove_file(artifact.path()).await {
                    tracing::debug!("Could not delete {}: {}", artifact.path().display(), e);
                }

                match restored {
                    Ok(()) => {
                        tracing::warn!("Rolled back to {}", backup.version);
                        self.emit(UpdaterEvent::RolledBack);
                        self.fail(&e, true, false);
                    }
                    Err(restore_err) => {
                        tracing::error!(
                            "Rollback failed, installation may be damaged: {}",
                            restore_err
                        );
                        self.fail(&e, false, true);
                    }
                }
                Err(e)
            }
        }
    }

    fn report_install(&mut self, operation: &str, percent: u8) {
        let report = UpdateProgress::step(operation, percent);
        self.progress = Some(report.clone());
        self.emit(UpdaterEvent::InstallProgress(report));
    }

    fn emit(&mut self, event: UpdaterEvent) {
        self.sink.emit(event);
    }

    fn set_state(&mut self, next: UpdaterState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(UpdateError::Internal(format!(
                "Illegal state transition {} -> {}",
                self.state, next
            )));
        }

        tracing::debug!("State {} -> {}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(UpdaterEvent::StateChanged(next));
        Ok(())
    }

    /// Turn internal errors that escaped an operation into a critical
    /// failure
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e @ UpdateError::Internal(_)) = result {
            if self.state != UpdaterState::Failed {
                tracing::error!("Internal updater error: {}", e);
                self.fail(e, false, true);
            }
        }
        result
    }

    /// Enter `Failed` and report why
    fn fail(&mut self, err: &UpdateError, rolled_back: bool, critical: bool) {
        let message = err.to_string();
        self.record_error(err);
        self.failure = Some(FailureInfo {
            kind: err.kind(),
            message: message.clone(),
            rolled_back,
            critical,
        });
        self.progress = None;

        if self.state != UpdaterState::Failed {
            if !self.state.can_transition_to(UpdaterState::Failed) {
                tracing::error!("Forcing failure from state {}", self.state);
            }
            self.state = UpdaterState::Failed;
            self.state_tx.send_replace(UpdaterState::Failed);
            self.emit(UpdaterEvent::StateChanged(UpdaterState::Failed));
        }
        self.emit(UpdaterEvent::Failed(message));
    }

    fn record_error(&mut self, err: &UpdateError) {
        self.last_error = Some(LastError {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    /// Forget the current offer and any artifact downloaded for it
    fn discard_offer(&mut self) {
        if let Some(artifact) = self.verified.take() {
            if let Err(e) = std::fs::remove_file(artifact.path()) {
                tracing::debug!("Could not delete {}: {}", artifact.path().display(), e);
            }
        }
        self.update_info = None;
        self.progress = None;
    }

    fn touch_last_check(&mut self) {
        self.persisted.last_check_time = Some(Utc::now());
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.persisted) {
            tracing::warn!("Could not save updater state: {}", e);
        }
    }
}
