//! Update manifest retrieval and candidate selection
//!
//! ## Manifest Format
//!
//! `GET {server}/{channel}/manifest?platform={id}&current={version}`
//! answers with:
//!
//! ```json
//! { "entries": [
//!     { "version": "1.4.2", "build": "20240115",
//!       "releaseDate": "2024-01-15T10:00:00Z",
//!       "url": "https://.../EonPlay-1.4.2-linux.AppImage",
//!       "signature": "<base64>",
//!       "checksum": "sha256:<hex>",
//!       "size": 42318221,
//!       "notes": "...",
//!       "security": true, "critical": false,
//!       "platforms": ["linux-x86_64"],
//!       "minVersion": "1.2.0" } ] }
//! ```
//!
//! Unknown fields are ignored. Entries missing a required field are
//! disqualified one by one; a document that is not JSON fails as a whole.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::error::{Result, UpdateError};
use crate::signing::Checksum;
use crate::version::Version;

/// One candidate update, as published in the manifest
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInfo {
    /// Version string
    pub version: String,
    /// Build number
    pub build: Option<String>,
    /// Release timestamp
    pub release_date: Option<DateTime<Utc>>,
    /// Absolute download URL
    pub url: String,
    /// Detached signature (base64 or hex)
    pub signature: String,
    /// Expected artifact digest
    pub checksum: Checksum,
    /// Artifact size in bytes
    pub size: u64,
    /// Release notes
    pub notes: String,
    /// Fixes a security issue
    pub security: bool,
    /// Marked critical by the publisher
    pub critical: bool,
    /// Platform identifiers this artifact runs on
    pub platforms: Vec<String>,
    /// Oldest installed version allowed to upgrade to this one
    pub min_version: Option<String>,
}

impl UpdateInfo {
    /// File name the artifact is stored under
    pub fn file_name(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .map(|name| sanitize_file_name(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("eonplay-update-{}.bin", self.version))
    }
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// Manifest entry as it appears on the wire
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    version: Option<String>,
    #[serde(default)]
    build: Option<String>,
    #[serde(default)]
    release_date: Option<DateTime<Utc>>,
    url: Option<String>,
    signature: Option<String>,
    checksum: Option<String>,
    size: Option<u64>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    security: bool,
    #[serde(default)]
    critical: bool,
    platforms: Option<Vec<String>>,
    #[serde(default)]
    min_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    entries: Vec<serde_json::Value>,
}

impl RawEntry {
    fn into_update_info(self, allow_http: bool) -> std::result::Result<UpdateInfo, String> {
        let version = self.version.ok_or("missing version")?;
        if Version::parse(&version).is_none() {
            return Err(format!("unparsable version {}", version));
        }

        let url = self.url.ok_or("missing url")?;
        let parsed_url = Url::parse(&url).map_err(|_| format!("url is not absolute: {}", url))?;
        match parsed_url.scheme() {
            "https" => {}
            "http" if allow_http => {}
            scheme => return Err(format!("refusing {} artifact url", scheme)),
        }

        let checksum_str = self.checksum.ok_or("missing checksum")?;
        let checksum = Checksum::parse(&checksum_str)
            .ok_or_else(|| format!("unsupported checksum {}", checksum_str))?;

        if let Some(ref min) = self.min_version {
            if Version::parse(min).is_none() {
                return Err(format!("unparsable minVersion {}", min));
            }
        }

        Ok(UpdateInfo {
            version,
            build: self.build,
            release_date: self.release_date,
            url,
            signature: self.signature.ok_or("missing signature")?,
            checksum,
            size: self.size.ok_or("missing size")?,
            notes: self.notes.unwrap_or_default(),
            security: self.security,
            critical: self.critical,
            platforms: self.platforms.ok_or("missing platforms")?,
            min_version: self.min_version,
        })
    }
}

/// Parse a manifest document into its well-formed entries
pub fn parse_manifest(body: &str, allow_http: bool) -> Result<Vec<UpdateInfo>> {
    let manifest: RawManifest =
        serde_json::from_str(body).map_err(|e| UpdateError::Parse(e.to_string()))?;

    let mut entries = Vec::new();
    for (idx, value) in manifest.entries.into_iter().enumerate() {
        let parsed = serde_json::from_value::<RawEntry>(value)
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.into_update_info(allow_http));
        match parsed {
            Ok(info) => entries.push(info),
            Err(reason) => tracing::warn!("Skipping manifest entry {}: {}", idx, reason),
        }
    }

    Ok(entries)
}

/// Pick the best update for this installation, if any.
///
/// Candidates must support `platform`, allow upgrading from `current`, be
/// accepted by `channel`, and be strictly newer than `current`. The highest
/// version wins; equal versions go to the newer release date.
pub fn select_update(
    entries: &[UpdateInfo],
    platform: &str,
    current: &str,
    channel: Channel,
) -> Option<UpdateInfo> {
    let current_version = Version::parse(current)?;

    entries
        .iter()
        .filter_map(|entry| Version::parse(&entry.version).map(|v| (v, entry)))
        .filter(|(_, entry)| entry.platforms.iter().any(|p| p == platform))
        .filter(|(_, entry)| match entry.min_version.as_deref() {
            Some(min) => Version::parse(min).is_some_and(|min| min <= current_version),
            None => true,
        })
        .filter(|(version, _)| channel.accepts(version))
        .filter(|(version, _)| *version > current_version)
        .max_by(|(va, a), (vb, b)| va.cmp(vb).then_with(|| a.release_date.cmp(&b.release_date)))
        .map(|(_, entry)| entry.clone())
}

/// Fetches manifests from the update server
pub struct ManifestClient {
    client: reqwest::Client,
    base_url: String,
    allow_http: bool,
}

impl ManifestClient {
    pub fn new(base_url: &str, timeout: Duration, allow_http: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("eonplay-updater/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            allow_http,
        })
    }

    /// Get the URL for a channel's manifest
    pub fn manifest_url(&self, channel: Channel) -> String {
        format!("{}/{}/manifest", self.base_url, channel.as_str())
    }

    /// Download and parse the manifest for this platform and version.
    ///
    /// A non-2xx status yields no entries rather than an error.
    pub async fn fetch(
        &self,
        channel: Channel,
        platform: &str,
        current: &str,
    ) -> Result<Vec<UpdateInfo>> {
        let url = self.manifest_url(channel);
        tracing::info!("Fetching manifest: {}", url);

        let response = self
            .client
            .get(&url)
            .query(&[("platform", platform), ("current", current)])
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::warn!("Manifest request returned HTTP {}", response.status());
            return Ok(Vec::new());
        }

        let body = response.text().await?;
        let entries = parse_manifest(&body, self.allow_http)?;
        tracing::debug!("Manifest lists {} usable entries", entries.len());
        Ok(entries)
    }

    /// Fetch the manifest and select the update to offer
    pub async fn check(
        &self,
        channel: Channel,
        platform: &str,
        current: &str,
    ) -> Result<Option<UpdateInfo>> {
        let entries = self.fetch(channel, platform, current).await?;
        Ok(select_update(&entries, platform, current, channel))
    }
}
