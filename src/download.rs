//! Streaming artifact download
//!
//! Artifacts are written to `{download_dir}/{name}.partial` and renamed
//! into place once the declared number of bytes has arrived. Any error,
//! timeout, or cancellation removes the partial file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, UpdateError};
use crate::manifest::UpdateInfo;
use crate::progress::{ProgressTracker, UpdateProgress};

/// Suffix of in-flight downloads
pub const PARTIAL_SUFFIX: &str = ".partial";

pub struct Downloader {
    client: Client,
    download_dir: PathBuf,
    timeout: Duration,
}

impl Downloader {
    pub fn new(download_dir: &Path, timeout: Duration) -> Result<Self> {
        // No request-level timeout: the whole transfer is bounded in download()
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("eonplay-updater/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            download_dir: download_dir.to_path_buf(),
            timeout,
        })
    }

    /// Where a finished download for `info` ends up
    pub fn artifact_path(&self, info: &UpdateInfo) -> PathBuf {
        self.download_dir.join(info.file_name())
    }

    /// Where the in-flight download for `info` is written
    pub fn partial_path(&self, info: &UpdateInfo) -> PathBuf {
        self.download_dir
            .join(format!("{}{}", info.file_name(), PARTIAL_SUFFIX))
    }

    /// Download the artifact described by `info`.
    ///
    /// Resolves early with [`UpdateError::Cancelled`] when `cancel`
    /// completes, or [`UpdateError::Timeout`] when the transfer exceeds the
    /// configured timeout.
    pub async fn download<C, F>(
        &self,
        info: &UpdateInfo,
        cancel: C,
        mut on_progress: F,
    ) -> Result<PathBuf>
    where
        C: Future<Output = ()>,
        F: FnMut(UpdateProgress),
    {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| {
                UpdateError::FileSystem(format!(
                    "Cannot create {}: {}",
                    self.download_dir.display(),
                    e
                ))
            })?;

        let partial = self.partial_path(info);
        let destination = self.artifact_path(info);
        tracing::info!("Downloading {} to {}", info.url, destination.display());

        let result = tokio::select! {
            biased;
            _ = cancel => Err(UpdateError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => Err(UpdateError::Timeout(self.timeout.as_secs())),
            result = self.transfer(info, &partial, &mut on_progress) => result,
        };

        if let Err(e) = result {
            remove_quietly(&partial).await;
            tracing::warn!("Download of {} stopped: {}", info.url, e);
            return Err(e);
        }

        if destination.exists() {
            tokio::fs::remove_file(&destination).await?;
        }
        if let Err(e) = tokio::fs::rename(&partial, &destination).await {
            remove_quietly(&partial).await;
            return Err(UpdateError::FileSystem(format!(
                "Cannot move download into place: {}",
                e
            )));
        }

        tracing::info!("Downloaded {} ({} bytes)", destination.display(), info.size);
        Ok(destination)
    }

    async fn transfer<F>(&self, info: &UpdateInfo, partial: &Path, on_progress: &mut F) -> Result<()>
    where
        F: FnMut(UpdateProgress),
    {
        let response = self.client.get(&info.url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Transport(format!(
                "Failed to download {}: HTTP {}",
                info.url,
                response.status()
            )));
        }

        let mut file = File::create(partial).await?;
        let mut stream = response.bytes_stream();
        let mut tracker = ProgressTracker::new(info.size, "Downloading", Instant::now());
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            if downloaded > info.size {
                return Err(UpdateError::Transport(format!(
                    "Server sent more than the declared {} bytes",
                    info.size
                )));
            }

            file.write_all(&chunk).await?;

            if let Some(report) = tracker.record(downloaded, Instant::now()) {
                on_progress(report);
            }
        }

        if downloaded != info.size {
            return Err(UpdateError::Transport(format!(
                "Download ended after {} of {} bytes",
                downloaded, info.size
            )));
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        on_progress(tracker.finish(Instant::now()));
        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}
