use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ca::{KeyAlgorithm, Validity};

/// Name of the per-user directory the store lives in by default.
pub const DEFAULT_DIR_NAME: &str = "trustmint";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root CA parameters. Only consulted when a new root is generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaSettings {
    #[serde(default = "default_common_name")]
    pub common_name: String,
    #[serde(default = "default_organization")]
    pub organization: Option<String>,
    #[serde(default = "default_ca_algorithm")]
    pub key_algorithm: KeyAlgorithm,
    /// Defaults to the algorithm's standard size.
    #[serde(default)]
    pub key_bits: Option<u32>,
    #[serde(default = "default_ca_validity_days")]
    pub validity_days: u32,
    /// Warn when the root is this close to expiry.
    #[serde(default = "default_expiry_warning_days")]
    pub expiry_warning_days: u32,
}

/// Leaf issuance and cache parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafSettings {
    #[serde(default = "default_leaf_algorithm")]
    pub key_algorithm: KeyAlgorithm,
    #[serde(default)]
    pub key_bits: Option<u32>,
    #[serde(default = "default_leaf_validity_secs")]
    pub validity_secs: u64,
    /// Maximum cached leaves. 0 disables caching.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Period of the background expiry sweep, if any.
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

/// Store configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Config version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Store directory. Falls back to the per-user config directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Prefix of the root certificate and key file names.
    #[serde(default = "default_basename")]
    pub basename: String,

    #[serde(default)]
    pub ca: CaSettings,

    #[serde(default)]
    pub leaf: LeafSettings,
}

fn default_version() -> u32 {
    1
}

fn default_basename() -> String {
    "trustmint".to_string()
}

fn default_common_name() -> String {
    "trustmint".to_string()
}

fn default_organization() -> Option<String> {
    Some("trustmint".to_string())
}

fn default_ca_algorithm() -> KeyAlgorithm {
    KeyAlgorithm::Rsa
}

fn default_ca_validity_days() -> u32 {
    10 * 365
}

fn default_expiry_warning_days() -> u32 {
    30
}

fn default_leaf_algorithm() -> KeyAlgorithm {
    KeyAlgorithm::EcdsaP256
}

fn default_leaf_validity_secs() -> u64 {
    365 * 86_400
}

fn default_cache_capacity() -> usize {
    100
}

impl CaSettings {
    pub fn key_bits(&self) -> u32 {
        self.key_bits
            .unwrap_or_else(|| self.key_algorithm.default_bits())
    }
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            common_name: default_common_name(),
            organization: default_organization(),
            key_algorithm: default_ca_algorithm(),
            key_bits: None,
            validity_days: default_ca_validity_days(),
            expiry_warning_days: default_expiry_warning_days(),
        }
    }
}

impl LeafSettings {
    pub fn key_bits(&self) -> u32 {
        self.key_bits
            .unwrap_or_else(|| self.key_algorithm.default_bits())
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

impl Default for LeafSettings {
    fn default() -> Self {
        Self {
            key_algorithm: default_leaf_algorithm(),
            key_bits: None,
            validity_secs: default_leaf_validity_secs(),
            cache_capacity: default_cache_capacity(),
            sweep_interval_secs: None,
        }
    }
}

impl StoreConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Default settings rooted at `dir`.
    pub fn in_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(dir.into()),
            ..Self::default()
        }
    }

    /// The configured directory, or the per-user default.
    pub fn store_directory(&self) -> Option<PathBuf> {
        self.directory.clone().or_else(default_store_dir)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.basename.is_empty()
            || self.basename.starts_with('.')
            || self.basename.contains(['/', '\\'])
            || self.basename.chars().any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(ConfigError::Invalid(format!(
                "basename {:?} must be a plain file name prefix",
                self.basename
            )));
        }
        if self.ca.common_name.trim().is_empty() {
            return Err(ConfigError::Invalid("ca.common_name is empty".to_string()));
        }
        if self.ca.validity_days == 0 {
            return Err(ConfigError::Invalid(
                "ca.validity_days must be positive".to_string(),
            ));
        }
        if self.leaf.validity_secs == 0 {
            return Err(ConfigError::Invalid(
                "leaf.validity_secs must be positive".to_string(),
            ));
        }
        Validity::days_from_now(self.ca.validity_days)
            .map_err(|e| ConfigError::Invalid(format!("ca.validity_days: {e}")))?;
        Validity::for_duration(self.leaf.validity())
            .map_err(|e| ConfigError::Invalid(format!("leaf.validity_secs: {e}")))?;
        if self.leaf.sweep_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "leaf.sweep_interval_secs must be positive".to_string(),
            ));
        }
        self.ca
            .key_algorithm
            .check_bits(self.ca.key_bits())
            .map_err(|e| ConfigError::Invalid(format!("ca: {e}")))?;
        self.leaf
            .key_algorithm
            .check_bits(self.leaf.key_bits())
            .map_err(|e| ConfigError::Invalid(format!("leaf: {e}")))?;
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            directory: None,
            basename: default_basename(),
            ca: CaSettings::default(),
            leaf: LeafSettings::default(),
        }
    }
}

/// `<config dir>/trustmint`, e.g. `~/.config/trustmint` on Linux.
pub fn default_store_dir() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .map(|base| base.join(DEFAULT_DIR_NAME))
}
