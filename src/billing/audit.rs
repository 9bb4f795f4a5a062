//! Append-only JSONL trail of invoice lifecycle events.
//!
//! Each line carries a running counter snapshot and, when enabled, a SHA-256
//! hash over the event that includes the previous line's hash.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::BillingAuditConfig;

pub const INVOICE_GENERATED: &str = "invoice_generated";
pub const INVOICE_GENERATION_REJECTED: &str = "invoice_generation_rejected";
pub const INVOICE_STATUS_CHANGED: &str = "invoice_status_changed";
pub const INVOICE_VOIDED: &str = "invoice_voided";

#[derive(Debug, Default, Clone, Serialize)]
struct BillingMetrics {
    invoices_generated: u64,
    generations_rejected: u64,
    invoices_voided: u64,
}

impl BillingMetrics {
    fn count(&mut self, event_type: &str) {
        match event_type {
            INVOICE_GENERATED => self.invoices_generated += 1,
            INVOICE_GENERATION_REJECTED => self.generations_rejected += 1,
            INVOICE_VOIDED => self.invoices_voided += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditEvent<'a> {
    ts: String,
    event_type: &'a str,
    details: serde_json::Value,
    metrics: BillingMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

struct AuditLogger {
    path: PathBuf,
    hash_chain: bool,
    state: Mutex<Option<String>>,
    metrics: Mutex<BillingMetrics>,
}

impl AuditLogger {
    fn new(path: PathBuf, hash_chain: bool) -> Self {
        Self {
            path,
            hash_chain,
            state: Mutex::new(None),
            metrics: Mutex::new(BillingMetrics::default()),
        }
    }

    fn write(&self, event_type: &str, details: serde_json::Value) {
        // Hold both locks through the append so the counter snapshot and the
        // chain link match the line actually written.
        let mut metrics_guard = match self.metrics.lock() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Billing audit metrics lock poisoned: {}", e);
                return;
            }
        };
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Billing audit state lock poisoned: {}", e);
                return;
            }
        };
        // Counters only advance once the line is on disk.
        let mut counted = metrics_guard.clone();
        counted.count(event_type);

        let mut event = AuditEvent {
            ts: Utc::now().to_rfc3339(),
            event_type,
            details,
            metrics: counted,
            prev_hash: state.clone(),
            hash: None,
        };

        let mut next_hash = None;
        if self.hash_chain {
            let to_hash = match serde_json::to_string(&event) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to serialize billing audit event for hashing: {}", e);
                    return;
                }
            };
            let mut hasher = Sha256::new();
            hasher.update(to_hash.as_bytes());
            let hash = format!("{:x}", hasher.finalize());
            event.hash = Some(hash.clone());
            next_hash = Some(hash);
        }

        let line = match serde_json::to_string(&event) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to serialize billing audit event: {}", e);
                return;
            }
        };

        if let Some(parent) = self.path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("Failed to create billing audit log dir {:?}: {}", parent, e);
            return;
        }

        // New files are created 0600. Existing files with broader modes are
        // refused rather than written to.
        let mut open_opts = OpenOptions::new();
        open_opts.create(true).append(true);
        #[cfg(unix)]
        open_opts.mode(0o600);
        let mut file = match open_opts.open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Failed to open billing audit log {:?}: {}", self.path, e);
                return;
            }
        };
        #[cfg(unix)]
        {
            let mode = match file.metadata() {
                Ok(meta) => meta.permissions().mode() & 0o777,
                Err(e) => {
                    tracing::warn!(
                        "Failed to read permissions for billing audit log {:?}: {}",
                        self.path,
                        e
                    );
                    return;
                }
            };
            if mode != 0o600 {
                tracing::warn!(
                    "Refusing to write billing audit event; insecure mode {:o} on {:?} (expected 600)",
                    mode,
                    self.path
                );
                return;
            }
        }
        match writeln!(file, "{line}") {
            Ok(()) => {
                if next_hash.is_some() {
                    *state = next_hash;
                }
                *metrics_guard = event.metrics;
            }
            Err(e) => tracing::warn!("Failed to append billing audit event: {}", e),
        }
    }
}

static LOGGER: OnceLock<AuditLogger> = OnceLock::new();
#[cfg(test)]
static TEST_EVENTS: OnceLock<Mutex<Vec<TestAuditEvent>>> = OnceLock::new();

#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct TestAuditEvent {
    pub event_type: String,
    pub details: serde_json::Value,
}

/// Initialize the billing audit logger. Later calls are ignored.
pub fn init(config: &BillingAuditConfig) {
    if !config.enabled {
        return;
    }
    let _ = LOGGER.set(AuditLogger::new(config.path.clone(), config.hash_chain));
}

/// Record a billing audit event.
pub fn record(event_type: &str, details: serde_json::Value) {
    #[cfg(test)]
    push_test_event(event_type, &details);
    if let Some(logger) = LOGGER.get() {
        logger.write(event_type, details);
    }
}

pub fn enabled() -> bool {
    LOGGER.get().is_some()
}

#[cfg(test)]
fn push_test_event(event_type: &str, details: &serde_json::Value) {
    let events = TEST_EVENTS.get_or_init(|| Mutex::new(Vec::new()));
    if let Ok(mut lock) = events.lock() {
        lock.push(TestAuditEvent {
            event_type: event_type.to_string(),
            details: details.clone(),
        });
    }
}

/// Events recorded so far whose details mention `client_id`.
#[cfg(test)]
pub(crate) fn test_events_for_client(client_id: &str) -> Vec<TestAuditEvent> {
    TEST_EVENTS
        .get()
        .and_then(|events| events.lock().ok().map(|lock| lock.clone()))
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.details.get("client_id").and_then(|v| v.as_str()) == Some(client_id))
        .collect()
}
