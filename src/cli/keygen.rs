//! Release key generation command

use std::path::{Path, PathBuf};

use anyhow::Result;
use colored::Colorize;

use crate::config::Config;
use crate::signing;

pub fn run(name: &str, output: Option<&Path>, config: &Config) -> Result<()> {
    println!("{}", "Generating Ed25519 release key...".cyan());
    println!();

    let output_dir = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_key_dir(config));

    let (_signing_key, fingerprint) = signing::generate_key(name, &output_dir)?;

    println!("{}", "✓ Key generated successfully!".green().bold());
    println!();
    println!("  {}: {}", "Fingerprint".bold(), fingerprint);
    println!(
        "  {}: {}",
        "Public key".bold(),
        output_dir.join("release-key.pub").display()
    );
    println!(
        "  {}: {}",
        "Secret key".bold(),
        output_dir.join("release-key.secret").display()
    );
    println!();
    println!("{}", "IMPORTANT:".yellow().bold());
    println!("  Keep the secret key offline. Ship the public key with the player");
    println!("  (signing.public_key_file) so installations trust your releases.");

    Ok(())
}

/// Keys default to a `keys` directory next to the state file
fn default_key_dir(config: &Config) -> PathBuf {
    config
        .paths
        .state_file
        .parent()
        .map(|dir| dir.join("keys"))
        .unwrap_or_else(|| PathBuf::from("keys"))
}
