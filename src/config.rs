//! Configuration management for the updater

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::channel::Channel;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Update server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Automatic check schedule
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Consent and auto-install policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Trusted release key
    #[serde(default)]
    pub signing: SigningConfig,

    /// On-disk locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Network and installer timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Installer overrides
    #[serde(default)]
    pub installer: InstallerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the update server
    pub url: String,

    /// Release channel to follow
    #[serde(default)]
    pub channel: Channel,

    /// Platform identifier override (detected when unset)
    #[serde(default)]
    pub platform: Option<String>,

    /// Permit plain HTTP for the server and artifact URLs
    #[serde(default)]
    pub allow_http: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "https://updates.eonplay.org".to_string(),
            channel: Channel::Stable,
            platform: None,
            allow_http: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Hours between automatic checks (1 to one year)
    #[serde(default = "default_interval")]
    pub check_interval_hours: u64,

    /// Whether the scheduler may start checks on its own
    #[serde(default = "default_true")]
    pub automatic_check: bool,
}

fn default_interval() -> u64 {
    24
}

/// Longest accepted check interval: one year
pub const MAX_CHECK_INTERVAL_HOURS: u64 = 24 * 366;

fn default_true() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval_hours: default_interval(),
            automatic_check: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Install verified downloads without asking
    #[serde(default)]
    pub automatic_install: bool,

    /// The user agreed to automatic downloads
    #[serde(default)]
    pub user_consent: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Inline public key (PEM, base64 or hex)
    #[serde(default)]
    pub public_key: Option<String>,

    /// Path to a public key file
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Installation directory that gets backed up and replaced
    pub install_dir: PathBuf,

    /// Where artifacts are downloaded
    pub download_dir: PathBuf,

    /// Where installation snapshots are kept
    pub backup_dir: PathBuf,

    /// JSON file holding lastCheckTime and installedVersion
    pub state_file: PathBuf,

    /// Number of snapshots to retain
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_max_backups() -> usize {
    3
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "eonplay", "eonplay")
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|d| d.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".eonplay"));
        let cache_dir = project_dirs()
            .map(|d| d.cache_dir().to_path_buf())
            .unwrap_or_else(|| data_dir.join("cache"));
        let install_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            install_dir,
            download_dir: cache_dir.join("updates"),
            backup_dir: data_dir.join("backups"),
            state_file: data_dir.join("updater-state.json"),
            max_backups: default_max_backups(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Manifest request timeout
    #[serde(default = "default_manifest_secs")]
    pub manifest_secs: u64,

    /// Overall artifact download timeout
    #[serde(default = "default_download_secs")]
    pub download_secs: u64,

    /// Installer process timeout
    #[serde(default = "default_installer_secs")]
    pub installer_secs: u64,
}

fn default_manifest_secs() -> u64 {
    30
}

fn default_download_secs() -> u64 {
    5 * 60
}

fn default_installer_secs() -> u64 {
    10 * 60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            manifest_secs: default_manifest_secs(),
            download_secs: default_download_secs(),
            installer_secs: default_installer_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Installer argv replacing the platform default.
    /// `{artifact}` and `{install_dir}` are substituted.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl Config {
    /// Load configuration from file, or use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            project_dirs()
                .map(|d| d.config_dir().join("updater.toml"))
                .filter(|p| p.exists())
        });

        let config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {}", path.display()))?
            }
            None => Config::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values outside their allowed ranges
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_CHECK_INTERVAL_HOURS).contains(&self.schedule.check_interval_hours) {
            bail!(
                "schedule.check_interval_hours must be between 1 and {} (got {})",
                MAX_CHECK_INTERVAL_HOURS,
                self.schedule.check_interval_hours
            );
        }
        if self.paths.max_backups < 1 {
            bail!("paths.max_backups must be at least 1");
        }
        if !self.server.url.starts_with("https://")
            && !(self.server.allow_http && self.server.url.starts_with("http://"))
        {
            bail!("server.url must be an https:// URL: {}", self.server.url);
        }
        Ok(())
    }

    /// Interval between automatic checks
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.check_interval_hours.saturating_mul(3600))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.download_secs)
    }

    pub fn installer_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.installer_secs)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.manifest_secs)
    }
}
