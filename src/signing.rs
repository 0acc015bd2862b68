//! Artifact verification and release signing
//!
//! Artifacts are signed with Ed25519ph (RFC 8032 pre-hashed Ed25519 over
//! SHA-512) using the context string [`SIGNATURE_CONTEXT`]. Hashing first
//! lets both checksum and signature checks stream the file in bounded
//! chunks instead of loading it into memory.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::prelude::*;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::manifest::UpdateInfo;

/// Domain separation for release signatures
pub const SIGNATURE_CONTEXT: &[u8] = b"eonplay-release-v1";

const CHUNK_SIZE: usize = 64 * 1024;

/// Digest algorithms accepted for artifact checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }
}

/// An expected artifact digest, e.g. `sha256:9f86d0…`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    /// Lowercase hex digest
    pub hex: String,
}

impl Checksum {
    /// Parse `algorithm:hex`. A bare 64-character hex string is SHA-256.
    /// Weaker algorithms (md5, sha1) are refused.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (algorithm, hex) = match input.split_once(':') {
            Some((alg, hex)) => {
                let algorithm = match alg.to_ascii_lowercase().replace('-', "").as_str() {
                    "sha256" => HashAlgorithm::Sha256,
                    "sha512" => HashAlgorithm::Sha512,
                    _ => return None,
                };
                (algorithm, hex)
            }
            None => (HashAlgorithm::Sha256, input),
        };

        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        Some(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// Feed a file through a digest in bounded chunks
fn hash_file<D: Digest>(path: &Path, mut hasher: D) -> io::Result<D> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher)
}

/// Compute the hex digest of a file
pub fn file_digest(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    Ok(match algorithm {
        HashAlgorithm::Sha256 => hex::encode(hash_file(path, Sha256::new())?.finalize()),
        HashAlgorithm::Sha512 => hex::encode(hash_file(path, Sha512::new())?.finalize()),
    })
}

/// Decode a detached signature given as hex or base64
fn decode_signature(encoded: &str) -> Option<Signature> {
    let encoded = encoded.trim();
    let bytes = if encoded.len() == 128 && encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(encoded).ok()?
    } else {
        BASE64_STANDARD.decode(encoded).ok()?
    };
    Signature::from_slice(&bytes).ok()
}

/// An artifact that passed both checksum and signature verification.
///
/// Only [`Verifier::verify_artifact`] can produce one, and the installer
/// accepts nothing else.
#[derive(Debug, Clone)]
pub struct VerifiedArtifact {
    path: PathBuf,
    version: String,
}

impl VerifiedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Checks downloaded artifacts against the trusted release key.
///
/// Without a usable key every signature check fails closed.
#[derive(Debug, Clone)]
pub struct Verifier {
    key: Option<VerifyingKey>,
}

impl Verifier {
    /// Load the trusted key named by the configuration once
    pub fn from_config(config: &Config) -> Self {
        let loaded = if let Some(ref inline) = config.signing.public_key {
            Some(parse_public_key(inline))
        } else {
            config
                .signing
                .public_key_file
                .as_deref()
                .map(load_public_key)
        };

        let key = match loaded {
            Some(Ok(key)) => {
                tracing::info!("Trusted release key: {}", calculate_fingerprint(&key));
                Some(key)
            }
            Some(Err(e)) => {
                tracing::error!("Trusted release key is unusable, updates cannot be verified: {:#}", e);
                None
            }
            None => {
                tracing::warn!("No trusted release key configured, updates cannot be verified");
                None
            }
        };

        Self { key }
    }

    pub fn with_key(key: VerifyingKey) -> Self {
        Self { key: Some(key) }
    }

    /// A verifier with no key; rejects every signature
    pub fn untrusted() -> Self {
        Self { key: None }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Compare the file digest with the expected checksum
    pub fn verify_checksum(&self, path: &Path, expected: &Checksum) -> bool {
        match file_digest(path, expected.algorithm) {
            Ok(actual) if actual.eq_ignore_ascii_case(&expected.hex) => true,
            Ok(actual) => {
                tracing::warn!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    path.display(),
                    expected.hex,
                    actual
                );
                false
            }
            Err(e) => {
                tracing::warn!("Cannot hash {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Verify a detached signature over the file contents
    pub fn verify_signature(&self, path: &Path, signature: &str) -> bool {
        let Some(key) = self.key else {
            tracing::warn!("Signature check refused: no trusted key loaded");
            return false;
        };

        let Some(signature) = decode_signature(signature) else {
            tracing::warn!("Signature for {} is not valid base64/hex Ed25519", path.display());
            return false;
        };

        let hasher = match hash_file(path, Sha512::new()) {
            Ok(hasher) => hasher,
            Err(e) => {
                tracing::warn!("Cannot read {} for signature check: {}", path.display(), e);
                return false;
            }
        };

        match key.verify_prehashed(hasher, Some(SIGNATURE_CONTEXT), &signature) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!("Signature verification failed for {}", path.display());
                false
            }
        }
    }

    /// Run both checks; only a fully verified artifact comes back
    pub fn verify_artifact(&self, path: &Path, info: &UpdateInfo) -> Option<VerifiedArtifact> {
        if !self.verify_checksum(path, &info.checksum) {
            return None;
        }
        if !self.verify_signature(path, &info.signature) {
            return None;
        }
        tracing::info!("Artifact {} verified", path.display());
        Some(VerifiedArtifact {
            path: path.to_path_buf(),
            version: info.version.clone(),
        })
    }
}

/// Parse a public key given inline as PEM, base64, hex, or key-file TOML
pub fn parse_public_key(input: &str) -> Result<VerifyingKey> {
    let input = input.trim();

    if input.contains("-----BEGIN") {
        return VerifyingKey::from_public_key_pem(input)
            .map_err(|e| anyhow::anyhow!("Invalid PEM public key: {}", e));
    }

    if input.contains('=') && input.contains("key") {
        if let Ok(parsed) = toml::from_str::<toml::Value>(input) {
            let encoded = parsed
                .get("key")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("Missing key in public key file"))?;
            return parse_public_key(encoded);
        }
    }

    let bytes = if input.len() == 64 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(input)?
    } else {
        BASE64_STANDARD
            .decode(input)
            .context("Public key is neither PEM, hex nor base64")?
    };

    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid public key length: {} bytes", bytes.len()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))
}

/// Load a public key from a file
pub fn load_public_key(path: &Path) -> Result<VerifyingKey> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read public key: {}", path.display()))?;
    parse_public_key(&content)
        .with_context(|| format!("Failed to parse public key: {}", path.display()))
}

/// A loaded release signing key with its metadata
pub struct LoadedSigningKey {
    pub key: SigningKey,
    pub fingerprint: String,
    pub name: String,
}

/// Generate a new Ed25519 release key pair
pub fn generate_key(name: &str, output_dir: &Path) -> Result<(SigningKey, String)> {
    let mut csprng = OsRng;
    let signing_key = SigningKey::generate(&mut csprng);
    let verifying_key = signing_key.verifying_key();

    let fingerprint = calculate_fingerprint(&verifying_key);

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create key directory: {}", output_dir.display()))?;

    let secret_path = output_dir.join("release-key.secret");
    let secret_content = Zeroizing::new(format!(
        r#"# eonplay-release-secretkey-version: 1.0
# WARNING: Keep this file secure! Mode should be 0600.
type = "ed25519"
fingerprint = "{fingerprint}"
secret-key = "{secret_key}"

[identity]
name = "{name}"

[metadata]
created = "{timestamp}"
"#,
        fingerprint = fingerprint,
        secret_key = Zeroizing::new(BASE64_STANDARD.encode(signing_key.to_bytes())).as_str(),
        name = name,
        timestamp = chrono::Utc::now().to_rfc3339(),
    ));

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&secret_path)?;
        std::io::Write::write_all(&mut file, secret_content.as_bytes())?;
    }

    #[cfg(not(unix))]
    {
        fs::write(&secret_path, secret_content.as_bytes())?;
    }

    let public_path = output_dir.join("release-key.pub");
    let public_content = format!(
        r#"# eonplay-release-pubkey-version: 1.0
type = "ed25519"
fingerprint = "{fingerprint}"
key = "{public_key}"

[identity]
name = "{name}"

[metadata]
created = "{timestamp}"
"#,
        fingerprint = fingerprint,
        public_key = BASE64_STANDARD.encode(verifying_key.to_bytes()),
        name = name,
        timestamp = chrono::Utc::now().to_rfc3339(),
    );
    fs::write(&public_path, &public_content)?;

    Ok((signing_key, fingerprint))
}

/// Load a release signing key written by [`generate_key`]
pub fn load_signing_key(key_path: &Path) -> Result<LoadedSigningKey> {
    if !key_path.exists() {
        bail!("Signing key not found at: {}", key_path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let metadata = fs::metadata(key_path)?;
        let mode = metadata.mode() & 0o777;
        if mode != 0o600 {
            bail!(
                "Signing key has insecure permissions: {:o} (expected 0600). Fix with: chmod 600 {}",
                mode,
                key_path.display()
            );
        }
    }

    let content = Zeroizing::new(fs::read_to_string(key_path)?);
    let parsed: toml::Value = toml::from_str(&content)?;

    let secret_key_b64 = parsed
        .get("secret-key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing secret-key in key file"))?;

    let secret_bytes = Zeroizing::new(BASE64_STANDARD.decode(secret_key_b64)?);
    let key_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
        secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid secret key length"))?,
    );
    let signing_key = SigningKey::from_bytes(&key_bytes);

    let name = parsed
        .get("identity")
        .and_then(|i| i.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown")
        .to_string();

    Ok(LoadedSigningKey {
        fingerprint: calculate_fingerprint(&signing_key.verifying_key()),
        key: signing_key,
        name,
    })
}

/// Calculate the fingerprint of a verifying (public) key
pub fn calculate_fingerprint(key: &VerifyingKey) -> String {
    let hash = Sha256::digest(key.as_bytes());
    format!("ED25519:SHA256:{}", hex::encode(&hash[..16]))
}

/// Sign an artifact, returning the detached signature
pub fn sign_file(key: &SigningKey, path: &Path) -> Result<Signature> {
    let hasher = hash_file(path, Sha512::new())
        .with_context(|| format!("Failed to read {}", path.display()))?;
    key.sign_prehashed(hasher, Some(SIGNATURE_CONTEXT))
        .map_err(|e| anyhow::anyhow!("Signing failed: {}", e))
}
