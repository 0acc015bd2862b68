//! Events published to the host

use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedSender;

use crate::manifest::UpdateInfo;
use crate::progress::UpdateProgress;
use crate::updater::UpdaterState;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterEvent {
    CheckStarted,
    /// Carries whether an update was found
    CheckCompleted(bool),
    UpdateAvailable(UpdateInfo),
    DownloadStarted,
    DownloadProgress(UpdateProgress),
    DownloadCompleted(PathBuf),
    InstallStarted,
    InstallProgress(UpdateProgress),
    InstallCompleted,
    Failed(String),
    RolledBack,
    StateChanged(UpdaterState),
}

impl UpdaterEvent {
    /// Kebab-case event name
    pub fn name(&self) -> &'static str {
        match self {
            UpdaterEvent::CheckStarted => "check-started",
            UpdaterEvent::CheckCompleted(_) => "check-completed",
            UpdaterEvent::UpdateAvailable(_) => "update-available",
            UpdaterEvent::DownloadStarted => "download-started",
            UpdaterEvent::DownloadProgress(_) => "download-progress",
            UpdaterEvent::DownloadCompleted(_) => "download-completed",
            UpdaterEvent::InstallStarted => "install-started",
            UpdaterEvent::InstallProgress(_) => "install-progress",
            UpdaterEvent::InstallCompleted => "install-completed",
            UpdaterEvent::Failed(_) => "failed",
            UpdaterEvent::RolledBack => "rolled-back",
            UpdaterEvent::StateChanged(_) => "state-changed",
        }
    }
}

/// Receives updater events
pub trait EventSink {
    fn emit(&mut self, event: UpdaterEvent);
}

impl EventSink for UnboundedSender<UpdaterEvent> {
    fn emit(&mut self, event: UpdaterEvent) {
        // A dropped receiver only means nobody is listening
        let _ = self.send(event);
    }
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, event: UpdaterEvent) {
        match &event {
            UpdaterEvent::DownloadProgress(p) | UpdaterEvent::InstallProgress(p) => {
                tracing::debug!("{}: {}% ({}/{} bytes)", event.name(), p.percent, p.bytes_received, p.total_bytes)
            }
            UpdaterEvent::UpdateAvailable(info) => {
                tracing::info!("{}: {}", event.name(), info.version)
            }
            UpdaterEvent::Failed(message) => tracing::warn!("{}: {}", event.name(), message),
            UpdaterEvent::StateChanged(state) => tracing::info!("{}: {}", event.name(), state),
            UpdaterEvent::CheckCompleted(found) => tracing::info!("{}: {}", event.name(), found),
            UpdaterEvent::DownloadCompleted(path) => {
                tracing::info!("{}: {}", event.name(), path.display())
            }
            _ => tracing::info!("{}", event.name()),
        }
    }
}

/// Forwards each event to several sinks in order
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn EventSink + Send>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for FanOut {
    fn emit(&mut self, event: UpdaterEvent) {
        if let Some((last, rest)) = self.sinks.split_last_mut() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Reports the version currently installed
pub trait VersionProbe {
    fn installed_version(&self) -> String;
}

impl<F> VersionProbe for F
where
    F: Fn() -> String,
{
    fn installed_version(&self) -> String {
        self()
    }
}

/// A probe answering with a fixed version
#[derive(Debug, Clone)]
pub struct StaticVersion(pub String);

impl VersionProbe for StaticVersion {
    fn installed_version(&self) -> String {
        self.0.clone()
    }
}
