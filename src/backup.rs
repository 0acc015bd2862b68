//! Installation snapshots
//!
//! Before an update is installed the whole installation directory is copied
//! to `{backup_dir}/{timestamp}_{version}/`. A failed install restores the
//! newest snapshot; successful installs prune old ones.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Serialize;

use crate::error::{Result, UpdateError};

/// Timestamp layout of snapshot directory names (UTC, basic ISO-8601)
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// A snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    /// Absolute path of the snapshot directory
    pub path: PathBuf,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Version that was installed at the time
    pub version: String,
}

impl BackupRecord {
    fn dir_name(timestamp: &DateTime<Utc>, version: &str) -> String {
        format!("{}_{}", timestamp.format(TIMESTAMP_FORMAT), version)
    }

    /// Recover a record from a snapshot directory name
    fn from_dir(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (stamp, version) = name.split_once('_')?;
        if version.is_empty() {
            return None;
        }
        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        let version = version.to_string();
        Some(Self {
            path,
            timestamp,
            version,
        })
    }
}

/// Creates, lists, restores and prunes installation snapshots
#[derive(Debug, Clone)]
pub struct BackupManager {
    install_dir: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(install_dir: &Path, backup_dir: &Path, max_backups: usize) -> Self {
        Self {
            install_dir: install_dir.to_path_buf(),
            backup_dir: backup_dir.to_path_buf(),
            max_backups: max_backups.max(1),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Snapshot the installation directory, tagged with the version it holds
    pub fn create(&self, version: &str) -> Result<BackupRecord> {
        if !self.install_dir.is_dir() {
            return Err(UpdateError::FileSystem(format!(
                "Installation directory {} does not exist",
                self.install_dir.display()
            )));
        }
        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| fs_error("create backup directory", &self.backup_dir, e))?;

        // Keep snapshot timestamps strictly increasing
        let mut timestamp = parse_back(&Utc::now());
        if let Some(last) = self.latest()? {
            if timestamp <= last.timestamp {
                timestamp = last.timestamp + ChronoDuration::milliseconds(1);
            }
        }
        let mut path = self.backup_dir.join(BackupRecord::dir_name(&timestamp, version));
        while path.exists() {
            timestamp += ChronoDuration::milliseconds(1);
            path = self.backup_dir.join(BackupRecord::dir_name(&timestamp, version));
        }

        tracing::info!(
            "Backing up {} to {}",
            self.install_dir.display(),
            path.display()
        );

        if let Err(e) = copy_tree(&self.install_dir, &path, Some(&self.backup_dir)) {
            fs::remove_dir_all(&path).ok();
            return Err(fs_error("back up", &self.install_dir, e));
        }

        Ok(BackupRecord {
            path,
            timestamp,
            version: version.to_string(),
        })
    }

    /// All snapshots, oldest first
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.backup_dir)
            .map_err(|e| fs_error("read backup directory", &self.backup_dir, e))?;

        let mut records: Vec<BackupRecord> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| BackupRecord::from_dir(entry.path()))
            .collect();

        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    /// Most recent snapshot, if any
    pub fn latest(&self) -> Result<Option<BackupRecord>> {
        Ok(self.list()?.pop())
    }

    /// Replace the installation directory with the newest snapshot
    pub fn restore(&self) -> Result<BackupRecord> {
        let record = self.latest()?.ok_or_else(|| {
            UpdateError::FileSystem(format!(
                "No backups available in {}",
                self.backup_dir.display()
            ))
        })?;
        self.restore_from(&record)?;
        Ok(record)
    }

    /// Replace the installation directory with a specific snapshot
    pub fn restore_from(&self, record: &BackupRecord) -> Result<()> {
        tracing::warn!(
            "Restoring {} from backup {}",
            self.install_dir.display(),
            record.path.display()
        );

        let aside = self.aside_path();
        if aside.exists() {
            fs::remove_dir_all(&aside).map_err(|e| fs_error("clear", &aside, e))?;
        }

        let had_install = self.install_dir.exists();
        if had_install {
            fs::rename(&self.install_dir, &aside)
                .map_err(|e| fs_error("move aside", &self.install_dir, e))?;
        }

        // A backup store inside the installation moves aside with it
        let nested = self.nested_store().filter(|_| had_install);
        let source = match (&nested, record.path.strip_prefix(&self.backup_dir)) {
            (Some(store), Ok(name)) => aside.join(store).join(name),
            _ => record.path.clone(),
        };

        let restored = copy_tree(&source, &self.install_dir, None).and_then(|()| match &nested {
            Some(store) if aside.join(store).exists() => {
                let target = self.install_dir.join(store);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(aside.join(store), target)
            }
            _ => Ok(()),
        });

        if let Err(e) = restored {
            tracing::error!("Restore failed, putting the previous tree back: {}", e);
            fs::remove_dir_all(&self.install_dir).ok();
            if had_install {
                fs::rename(&aside, &self.install_dir).ok();
            }
            return Err(fs_error("restore", &record.path, e));
        }

        if had_install {
            if let Err(e) = fs::remove_dir_all(&aside) {
                tracing::warn!("Could not remove {}: {}", aside.display(), e);
            }
        }

        tracing::info!("Restored installation from {}", record.path.display());
        Ok(())
    }

    /// Delete the oldest snapshots until at most `max_backups` remain
    pub fn prune(&self) -> Result<Vec<BackupRecord>> {
        let mut records = self.list()?;
        let excess = records.len().saturating_sub(self.max_backups);
        let removed: Vec<BackupRecord> = records.drain(..excess).collect();

        for record in &removed {
            tracing::debug!("Pruning backup {}", record.path.display());
            fs::remove_dir_all(&record.path)
                .map_err(|e| fs_error("remove backup", &record.path, e))?;
        }

        if !removed.is_empty() {
            tracing::info!("Pruned {} old backup(s)", removed.len());
        }
        Ok(removed)
    }

    /// Backup directory relative to the installation, when nested inside it
    fn nested_store(&self) -> Option<PathBuf> {
        self.backup_dir
            .strip_prefix(&self.install_dir)
            .ok()
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }

    fn aside_path(&self) -> PathBuf {
        let name = self
            .install_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "install".to_string());
        self.install_dir.with_file_name(format!(".{}.pre-restore", name))
    }
}

/// Round-trip through the directory-name format so in-memory and listed
/// records agree to the millisecond
fn parse_back(timestamp: &DateTime<Utc>) -> DateTime<Utc> {
    let text = timestamp.format(TIMESTAMP_FORMAT).to_string();
    NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT)
        .map(|t| t.and_utc())
        .unwrap_or(*timestamp)
}

fn fs_error(action: &str, path: &Path, err: io::Error) -> UpdateError {
    UpdateError::FileSystem(format!("Failed to {} {}: {}", action, path.display(), err))
}

/// Recursive copy; `skip` excludes one directory (the backup store when it
/// lives inside the tree being copied)
pub(crate) fn copy_tree(src: &Path, dst: &Path, skip: Option<&Path>) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    fs::set_permissions(dst, fs::metadata(src)?.permissions())?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        if skip.is_some_and(|s| s == from.as_path()) {
            continue;
        }
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to, skip)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_dir() {
        copy_tree(from, to, None)
    } else {
        fs::copy(from, to).map(|_| ())
    }
}
