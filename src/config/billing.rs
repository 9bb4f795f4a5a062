use std::path::{Component, PathBuf};

use rust_decimal::Decimal;

use crate::billing::allocation::AllocationPolicy;
use crate::billing::balance::NegativeCarryLimit;
use crate::config::helpers::{optional_env, parse_bool_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::{Settings, base_dir};

/// Billing audit trail controls.
#[derive(Debug, Clone)]
pub struct BillingAuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub hash_chain: bool,
}

/// Engine policy and invoice numbering.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub allocation: AllocationPolicy,
    pub negative_carry_limit: NegativeCarryLimit,
    pub invoice_prefix: String,
    pub audit: BillingAuditConfig,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            allocation: AllocationPolicy::default(),
            negative_carry_limit: NegativeCarryLimit::default(),
            invoice_prefix: "RL".to_string(),
            audit: BillingAuditConfig {
                enabled: false,
                path: base_dir().join("logs/billing-audit.jsonl"),
                hash_chain: true,
            },
        }
    }
}

pub(crate) fn parse_negative_carry_limit(raw: &str) -> Result<NegativeCarryLimit, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "one_month_retainer" | "one-month-retainer" | "retainer" => {
            Ok(NegativeCarryLimit::OneMonthRetainer)
        }
        "unlimited" | "none" => Ok(NegativeCarryLimit::Unlimited),
        other => {
            let hours: Decimal = other.parse().map_err(|_| ConfigError::InvalidValue {
                key: "BILLING_NEGATIVE_CARRY_LIMIT".to_string(),
                message: format!(
                    "expected 'one_month_retainer', 'unlimited' or a number of hours, got '{other}'"
                ),
            })?;
            if hours < Decimal::ZERO {
                return Err(ConfigError::InvalidValue {
                    key: "BILLING_NEGATIVE_CARRY_LIMIT".to_string(),
                    message: "carry limit must not be negative".to_string(),
                });
            }
            Ok(NegativeCarryLimit::Hours(hours))
        }
    }
}

fn validate_invoice_prefix(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConfigError::InvalidValue {
            key: "BILLING_INVOICE_PREFIX".to_string(),
            message: "prefix must be non-empty ASCII letters, digits, '-' or '_'".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

/// Relative path under `logs/`, resolved against the data directory.
fn validate_audit_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "BILLING_AUDIT_PATH".to_string(),
        message: message.to_string(),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("audit log path must not be empty"));
    }

    let mut normalized = PathBuf::new();
    for component in PathBuf::from(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(invalid("audit log path must not contain '..' components"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("audit log path must be relative"));
            }
        }
    }

    if normalized.components().count() < 2 || !normalized.starts_with("logs") {
        return Err(invalid(
            "audit log path must be under 'logs/' and include a filename",
        ));
    }
    Ok(normalized)
}

impl BillingConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let split_tolerance_minutes = parse_env(
            "BILLING_SPLIT_TOLERANCE_MINUTES",
            settings.billing.split_tolerance_minutes,
        )?;
        if split_tolerance_minutes < 0 {
            return Err(ConfigError::InvalidValue {
                key: "BILLING_SPLIT_TOLERANCE_MINUTES".to_string(),
                message: "tolerance must not be negative".to_string(),
            });
        }

        let carry_raw = optional_env("BILLING_NEGATIVE_CARRY_LIMIT")?
            .unwrap_or_else(|| settings.billing.negative_carry_limit.clone());

        Ok(Self {
            allocation: AllocationPolicy {
                split_tolerance_minutes,
            },
            negative_carry_limit: parse_negative_carry_limit(&carry_raw)?,
            invoice_prefix: {
                let raw = parse_string_env(
                    "BILLING_INVOICE_PREFIX",
                    settings.billing.invoice_prefix.clone(),
                )?;
                validate_invoice_prefix(&raw)?
            },
            audit: BillingAuditConfig {
                enabled: parse_bool_env("BILLING_AUDIT_ENABLED", settings.billing.audit.enabled)?,
                path: {
                    let raw =
                        parse_string_env("BILLING_AUDIT_PATH", settings.billing.audit.path.clone())?;
                    base_dir().join(validate_audit_path(&raw)?)
                },
                hash_chain: parse_bool_env(
                    "BILLING_AUDIT_HASH_CHAIN",
                    settings.billing.audit.hash_chain,
                )?,
            },
        })
    }
}
