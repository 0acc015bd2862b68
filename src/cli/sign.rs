//! Artifact signing command

use std::path::Path;

use anyhow::{Context, Result};
use base64::prelude::*;
use colored::Colorize;

use crate::signing::{self, HashAlgorithm};

pub fn run(
    artifact: &Path,
    key_path: &Path,
    version: Option<&str>,
    url: Option<&str>,
    platforms: &[String],
) -> Result<()> {
    let key = signing::load_signing_key(key_path)?;
    tracing::info!("Signing {} with {}", artifact.display(), key.fingerprint);

    let signature = signing::sign_file(&key.key, artifact)?;
    let signature_b64 = BASE64_STANDARD.encode(signature.to_bytes());
    let digest = signing::file_digest(artifact, HashAlgorithm::Sha256)
        .with_context(|| format!("Failed to hash {}", artifact.display()))?;
    let checksum = format!("sha256:{}", digest);
    let size = std::fs::metadata(artifact)
        .with_context(|| format!("Failed to stat {}", artifact.display()))?
        .len();

    if let (Some(version), Some(url)) = (version, url) {
        let entry = serde_json::json!({
            "version": version,
            "url": url,
            "signature": signature_b64,
            "checksum": checksum,
            "size": size,
            "platforms": platforms,
        });
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }

    println!("{} Signed {}", "✓".green(), artifact.display());
    println!("  {}: {} ({})", "Key".bold(), key.fingerprint, key.name);
    println!("  {}: {}", "signature".bold(), signature_b64);
    println!("  {}: {}", "checksum".bold(), checksum);
    println!("  {}: {}", "size".bold(), size);

    Ok(())
}
