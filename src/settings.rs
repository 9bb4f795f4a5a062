//! On-disk settings file (`settings.toml`).
//!
//! Every field has a default so a missing file, or a file that only sets a
//! few keys, still yields a complete `Settings`. Environment variables take
//! precedence over these values; see `crate::config`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Env var naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "RETAINER_LEDGER_SETTINGS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub gateway: GatewaySettings,
    pub billing: BillingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// `libsql` or `postgres`.
    pub backend: String,
    pub url: Option<String>,
    pub pool_size: usize,
    pub libsql_path: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: "libsql".to_string(),
            url: None,
            pool_size: 10,
            libsql_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3080,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    pub split_tolerance_minutes: i64,
    /// `one_month_retainer`, `unlimited`, or a decimal number of hours.
    pub negative_carry_limit: String,
    pub invoice_prefix: String,
    pub audit: BillingAuditSettings,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            split_tolerance_minutes: 0,
            negative_carry_limit: "one_month_retainer".to_string(),
            invoice_prefix: "RL".to_string(),
            audit: BillingAuditSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingAuditSettings {
    pub enabled: bool,
    pub path: String,
    pub hash_chain: bool,
}

impl Default for BillingAuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "logs/billing-audit.jsonl".to_string(),
            hash_chain: true,
        }
    }
}

/// `~/.retainer-ledger`, falling back to the working directory.
pub fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".retainer-ledger")
}

pub fn default_settings_path() -> PathBuf {
    base_dir().join("settings.toml")
}

impl Settings {
    /// Load from `RETAINER_LEDGER_SETTINGS` or the default path.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var(SETTINGS_PATH_ENV) {
            Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
            _ => default_settings_path(),
        };
        Self::load_from(&path)
    }

    /// Missing file yields defaults; unreadable or malformed files are errors.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        };
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
