//! Runtime configuration for lockwire
//!
//! Configuration comes from the environment, which suits the containerized
//! deployments this daemon targets. The resulting value is built once in
//! `main` and threaded into each component explicitly.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::Result;

/// Descriptor file extension selected at bootstrap
pub const DESCRIPTOR_EXT: &str = "conf";

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane account token; empty disables the relay sync
    pub relay_account: String,
    /// Country filter for the relay roster (lower-cased codes or names)
    pub relay_countries: Vec<String>,
    /// Directory holding peer descriptor files
    pub descriptor_dir: PathBuf,
    /// Disable the outbound firewall killswitch
    pub disable_killswitch: bool,
}

impl Config {
    /// Build configuration from the process environment
    pub fn from_env() -> Self {
        Self {
            relay_account: default_string(std::env::var("RELAY_ACCOUNT").ok(), ""),
            relay_countries: default_list(std::env::var("RELAY_COUNTRIES").ok(), &["nl"]),
            descriptor_dir: PathBuf::from(default_string(
                std::env::var("DESCRIPTOR_DIR").ok(),
                "/config",
            )),
            disable_killswitch: std::env::var("DISABLE_KILLSWITCH").as_deref() == Ok("true"),
        }
    }
}

/// Fall back to a default when the input is unset or empty
fn default_string(input: Option<String>, default: &str) -> String {
    match input {
        Some(s) if !s.is_empty() => s,
        _ => default.to_string(),
    }
}

/// Split a comma-separated value, lower-casing and trimming each entry
fn default_list(input: Option<String>, default: &[&str]) -> Vec<String> {
    match input {
        Some(s) if !s.is_empty() => s
            .split(',')
            .map(|item| item.trim().to_lowercase())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Pick one descriptor file at random from a directory tree.
///
/// Returns `Ok(None)` when the directory holds no `.conf` files at all.
pub fn pick_random_descriptor(dir: &Path) -> Result<Option<PathBuf>> {
    let mut files = Vec::new();
    collect_descriptors(dir, &mut files)?;
    debug!("Found {} descriptor file(s) in {:?}", files.len(), dir);
    Ok(files.choose(&mut rand::thread_rng()).cloned())
}

fn collect_descriptors(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_descriptors(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(DESCRIPTOR_EXT) {
            out.push(path);
        }
    }
    Ok(())
}
