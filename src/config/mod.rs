//! Runtime configuration.
//!
//! Values come from the settings file first, then `.env` / process
//! environment overrides. Every override is validated at resolve time and
//! reported as `ConfigError::InvalidValue` naming the offending key.

mod billing;
pub(crate) mod helpers;

use std::path::PathBuf;

use secrecy::SecretString;

pub use self::billing::{BillingAuditConfig, BillingConfig};
use crate::config::helpers::{optional_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::{Settings, base_dir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    LibSql,
    Postgres,
}

impl DatabaseBackend {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "libsql" | "sqlite" | "turso" => Ok(Self::LibSql),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            other => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LibSql => "libsql",
            Self::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: Option<SecretString>,
    pub pool_size: usize,
    pub libsql_path: Option<PathBuf>,
}

/// Default embedded database location.
pub fn default_libsql_path() -> PathBuf {
    base_dir().join("ledger.db")
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for every non-health route. `None` disables the API.
    pub auth_token: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub billing: BillingConfig,
}

impl Config {
    /// Load `.env`, the settings file, then environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let settings = Settings::load()?;
        Self::resolve(&settings)
    }

    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let backend = DatabaseBackend::parse(&parse_string_env(
            "DATABASE_BACKEND",
            settings.database.backend.clone(),
        )?)?;
        let url = optional_env("DATABASE_URL")?.or_else(|| settings.database.url.clone());
        if backend == DatabaseBackend::Postgres && url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL".to_string()));
        }
        let pool_size = parse_env("DATABASE_POOL_SIZE", settings.database.pool_size)?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "pool size must be at least 1".to_string(),
            });
        }
        let libsql_path = optional_env("LIBSQL_PATH")?
            .or_else(|| settings.database.libsql_path.clone())
            .map(PathBuf::from);

        let auth_token = optional_env("GATEWAY_AUTH_TOKEN")?
            .or_else(|| settings.gateway.auth_token.clone())
            .map(SecretString::from);

        Ok(Self {
            database: DatabaseConfig {
                backend,
                url: url.map(SecretString::from),
                pool_size,
                libsql_path,
            },
            gateway: GatewayConfig {
                host: parse_string_env("GATEWAY_HOST", settings.gateway.host.clone())?,
                port: parse_env("GATEWAY_PORT", settings.gateway.port)?,
                auth_token,
            },
            billing: BillingConfig::resolve(settings)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, DatabaseBackend};
    use crate::error::ConfigError;
    use crate::settings::Settings;

    #[test]
    fn defaults_select_embedded_backend() {
        let config = Config::resolve(&Settings::default()).expect("config");
        assert_eq!(config.database.backend, DatabaseBackend::LibSql);
        assert_eq!(config.database.pool_size, 10);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 3080);
    }

    #[test]
    fn postgres_requires_a_url() {
        let mut settings = Settings::default();
        settings.database.backend = "postgres".to_string();
        settings.database.url = None;
        assert!(matches!(
            Config::resolve(&settings),
            Err(ConfigError::Missing(key)) if key == "DATABASE_URL"
        ));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut settings = Settings::default();
        settings.database.backend = "mongodb".to_string();
        assert!(matches!(
            Config::resolve(&settings),
            Err(ConfigError::InvalidValue { key, .. }) if key == "DATABASE_BACKEND"
        ));
    }
}
