//! eonplay-updater - secure auto-updater for the EonPlay media player
//!
//! Checks a release channel for newer builds, downloads and verifies them
//! against a trusted Ed25519 release key, snapshots the installation,
//! runs the platform installer and rolls back when it fails.

pub mod backup;
pub mod channel;
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod installer;
pub mod manifest;
pub mod platform;
pub mod progress;
pub mod scheduler;
pub mod service;
pub mod signing;
pub mod state;
pub mod updater;
pub mod version;

pub use channel::Channel;
pub use config::Config;
pub use error::{ErrorKind, UpdateError};
pub use events::{EventSink, FanOut, LogSink, StaticVersion, UpdaterEvent, VersionProbe};
pub use manifest::UpdateInfo;
pub use progress::UpdateProgress;
pub use service::{Command, UpdaterHandle, UpdaterService};
pub use updater::{FailureInfo, LastError, Updater, UpdaterState};
pub use version::is_newer;
