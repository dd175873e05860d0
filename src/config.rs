use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::billing::BillingConfig;
use crate::live::LiveAccountingConfig;

/// Top-level settings for both stores, usually read from a TOML file:
///
/// ```toml
/// [live]
/// storage_backend = "redis://127.0.0.1:6379/0"
/// batch_size = 5000
///
/// [billing]
/// database_path = "/var/lib/accounting/billing.sqlite"
/// busy_timeout_ms = 5000
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountingConfig {
    #[serde(default)]
    pub live: LiveAccountingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl AccountingConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }
}
