//! Error types for configuration, persistence, the billing engine, and the
//! HTTP gateway.

use std::path::PathBuf;

/// Configuration resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to read settings file {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("failed to parse settings file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Store-level failures.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A uniqueness or state guard rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        Self::Query(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Query(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::Pool(e.to_string())
    }
}

/// Errors surfaced by the retainer balance and allocation engine.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Malformed input rejected before any computation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An invoice already covers the period, or an entry is already linked.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The store failed; the commit was rolled back.
    #[error("persistence failed: {0}")]
    Persistence(DatabaseError),
}

impl From<DatabaseError> for BillingError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Persistence(other),
        }
    }
}

/// Gateway lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::{BillingError, DatabaseError};

    #[test]
    fn store_conflict_maps_to_billing_conflict() {
        let err: BillingError = DatabaseError::Conflict("period already invoiced".to_string()).into();
        assert!(matches!(err, BillingError::Conflict(msg) if msg == "period already invoiced"));
    }

    #[test]
    fn store_failures_map_to_persistence() {
        let err: BillingError = DatabaseError::Query("disk full".to_string()).into();
        assert!(matches!(err, BillingError::Persistence(DatabaseError::Query(_))));
    }
}
