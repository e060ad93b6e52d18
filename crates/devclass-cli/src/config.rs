//! Configuration loading

use anyhow::{Context, Result};
use devclass_core::DigestAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub descriptor: DescriptorConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorConfig {
    /// Descriptor file to load instead of the bundled one
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backing file for label snapshots
    #[serde(default = "default_store_path")]
    pub path: Option<PathBuf>,
    /// Digest algorithm name (sha256, sha512)
    #[serde(default = "default_algorithm")]
    pub digest_algorithm: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            digest_algorithm: default_algorithm(),
        }
    }
}

impl StoreConfig {
    pub fn algorithm(&self) -> Result<DigestAlgorithm> {
        Ok(DigestAlgorithm::from_name(&self.digest_algorithm)?)
    }
}

fn default_store_path() -> Option<PathBuf> {
    Some(PathBuf::from("./devclass.store"))
}

fn default_algorithm() -> String {
    "sha256".to_string()
}

/// Load configuration from file, falling back to defaults when it is missing
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}
