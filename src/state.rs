//! Updater state that survives restarts
//!
//! Stored as JSON at `paths.state_file`:
//! `{ "lastCheckTime": "2024-01-15T10:00:00Z", "installedVersion": "1.0.0" }`

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// When the last manifest check finished
    #[serde(default)]
    pub last_check_time: Option<DateTime<Utc>>,

    /// Version recorded after the last successful install
    #[serde(default)]
    pub installed_version: Option<String>,
}

/// Reads and writes [`PersistedState`] at a fixed path
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored state. A missing or unreadable file yields defaults.
    pub fn load(&self) -> PersistedState {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PersistedState::default(),
            Err(e) => {
                tracing::warn!("Cannot read {}: {}", self.path.display(), e);
                return PersistedState::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt state file {}: {}", self.path.display(), e);
            PersistedState::default()
        })
    }

    /// Write the state atomically (temp file + rename)
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| UpdateError::Internal(format!("Cannot serialize state: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            fs::remove_file(&tmp).ok();
            UpdateError::FileSystem(format!(
                "Cannot write {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}
