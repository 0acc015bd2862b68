//! Error types for the updater

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable classification of an updater failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Parse,
    Verification,
    FileSystem,
    Installer,
    Policy,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::Verification => write!(f, "verification"),
            ErrorKind::FileSystem => write!(f, "filesystem"),
            ErrorKind::Installer => write!(f, "installer"),
            ErrorKind::Policy => write!(f, "policy"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for updater operations
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Download timed out after {0} seconds")]
    Timeout(u64),

    #[error("Malformed manifest: {0}")]
    Parse(String),

    #[error("Update verification failed")]
    Verification,

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Installer failed: {0}")]
    Installer(String),

    #[error("Installer timed out after {0} seconds")]
    InstallerTimeout(u64),

    #[error("{0}")]
    Policy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl UpdateError {
    /// Classify this error for the host
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Transport(_) | UpdateError::Timeout(_) | UpdateError::Cancelled => {
                ErrorKind::Transport
            }
            UpdateError::Parse(_) => ErrorKind::Parse,
            UpdateError::Verification => ErrorKind::Verification,
            UpdateError::FileSystem(_) | UpdateError::Io(_) => ErrorKind::FileSystem,
            UpdateError::Installer(_) | UpdateError::InstallerTimeout(_) => ErrorKind::Installer,
            UpdateError::Policy(_) | UpdateError::Config(_) => ErrorKind::Policy,
            UpdateError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::Transport(err.to_string())
    }
}

impl From<tokio::task::JoinError> for UpdateError {
    fn from(err: tokio::task::JoinError) -> Self {
        UpdateError::Internal(format!("worker task failed: {}", err))
    }
}

/// Result type alias for updater operations
pub type Result<T> = std::result::Result<T, UpdateError>;
