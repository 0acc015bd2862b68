//! Platform installer driver
//!
//! Picks the install command for a verified artifact, runs it with a
//! timeout and reports whether it exited cleanly. Only a
//! [`VerifiedArtifact`] is accepted, and a [`BackupRecord`] must be handed
//! in alongside it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::backup::{copy_tree, BackupRecord};
use crate::error::{Result, UpdateError};
use crate::signing::VerifiedArtifact;

/// How an artifact gets installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    /// Run a program and judge success by its exit code
    Command { program: String, args: Vec<String> },
    /// macOS disk image: mount, copy the `.app` bundle, detach
    DiskImage,
}

/// Choose the install plan for an artifact.
///
/// A configured override wins over the file-type choice; `{artifact}` and
/// `{install_dir}` are substituted in each of its arguments.
pub fn plan_for(
    artifact: &Path,
    install_dir: &Path,
    command_override: Option<&[String]>,
) -> Result<InstallPlan> {
    if let Some(template) = command_override {
        let mut argv = template.iter().map(|arg| {
            arg.replace("{artifact}", &artifact.to_string_lossy())
                .replace("{install_dir}", &install_dir.to_string_lossy())
        });
        let program = argv
            .next()
            .ok_or_else(|| UpdateError::Config("installer.command is empty".to_string()))?;
        return Ok(InstallPlan::Command {
            program,
            args: argv.collect(),
        });
    }

    let extension = artifact
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let path = artifact.to_string_lossy().into_owned();

    match extension.as_str() {
        "appimage" => Ok(InstallPlan::Command {
            program: path,
            args: Vec::new(),
        }),
        "msi" => Ok(InstallPlan::Command {
            program: "msiexec".to_string(),
            args: vec![
                "/i".to_string(),
                path,
                "/quiet".to_string(),
                "/norestart".to_string(),
            ],
        }),
        "exe" => Ok(InstallPlan::Command {
            program: path,
            args: vec!["/S".to_string()],
        }),
        "dmg" => Ok(InstallPlan::DiskImage),
        _ => Err(UpdateError::Installer(format!(
            "Unsupported artifact type: {}",
            artifact.display()
        ))),
    }
}

/// Runs installers for verified artifacts
#[derive(Debug, Clone)]
pub struct InstallerDriver {
    install_dir: PathBuf,
    timeout: Duration,
    command_override: Option<Vec<String>>,
}

impl InstallerDriver {
    pub fn new(install_dir: &Path, timeout: Duration, command_override: Option<Vec<String>>) -> Self {
        Self {
            install_dir: install_dir.to_path_buf(),
            timeout,
            command_override,
        }
    }

    /// Install `artifact`. The snapshot in `backup` is what a failure rolls
    /// back to.
    pub async fn run(&self, artifact: &VerifiedArtifact, backup: &BackupRecord) -> Result<()> {
        tracing::info!(
            "Installing {} ({}), backup at {}",
            artifact.version(),
            artifact.path().display(),
            backup.path.display()
        );

        let plan = plan_for(
            artifact.path(),
            &self.install_dir,
            self.command_override.as_deref(),
        )?;

        let outcome = tokio::time::timeout(self.timeout, self.execute(&plan, artifact.path())).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("Installer exceeded {:?}", self.timeout);
                Err(UpdateError::InstallerTimeout(self.timeout.as_secs()))
            }
        }
    }

    async fn execute(&self, plan: &InstallPlan, artifact: &Path) -> Result<()> {
        match plan {
            InstallPlan::Command { program, args } => {
                if Path::new(program) == artifact {
                    mark_executable(artifact)?;
                }
                run_command(program, args).await
            }
            InstallPlan::DiskImage => self.install_disk_image(artifact).await,
        }
    }

    async fn install_disk_image(&self, image: &Path) -> Result<()> {
        let mount_dir = tempfile::Builder::new()
            .prefix("eonplay-dmg")
            .tempdir()
            .map_err(|e| UpdateError::FileSystem(format!("Cannot create mount point: {}", e)))?;
        let mount_point = mount_dir.path().to_string_lossy().into_owned();

        run_command(
            "hdiutil",
            &[
                "attach".to_string(),
                "-nobrowse".to_string(),
                "-quiet".to_string(),
                "-mountpoint".to_string(),
                mount_point.clone(),
                image.to_string_lossy().into_owned(),
            ],
        )
        .await?;

        let copied = self.copy_app_bundle(mount_dir.path()).await;

        // Detach even when the copy failed
        if let Err(e) = run_command(
            "hdiutil",
            &["detach".to_string(), "-quiet".to_string(), mount_point],
        )
        .await
        {
            tracing::warn!("Failed to detach disk image: {}", e);
        }

        copied
    }

    async fn copy_app_bundle(&self, mount_point: &Path) -> Result<()> {
        let mount_point = mount_point.to_path_buf();
        let install_dir = self.install_dir.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let bundle = std::fs::read_dir(&mount_point)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .find(|path| path.extension().is_some_and(|ext| ext == "app"))
                .ok_or_else(|| UpdateError::Installer("No .app bundle in disk image".to_string()))?;

            let name = bundle
                .file_name()
                .ok_or_else(|| UpdateError::Installer("Bundle has no name".to_string()))?;
            let destination = install_dir.join(name);
            tracing::info!("Copying {} to {}", bundle.display(), destination.display());

            if destination.exists() {
                std::fs::remove_dir_all(&destination)?;
            }
            copy_tree(&bundle, &destination, None)?;
            Ok(())
        })
        .await?
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

async fn run_command(program: &str, args: &[String]) -> Result<()> {
    tracing::debug!("Running {} {:?}", program, args);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| UpdateError::Installer(format!("Failed to start {}: {}", program, e)))?;

    let status = child
        .wait()
        .await
        .map_err(|e| UpdateError::Installer(format!("Failed to wait for {}: {}", program, e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(UpdateError::Installer(format!("{} exited with {}", program, status)))
    }
}
