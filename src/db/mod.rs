//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies the persistence
//! operations the billing engine depends on. Two implementations exist behind
//! feature flags:
//!
//! - `postgres` (default): Uses `deadpool-postgres` + `tokio-postgres`
//! - `libsql`: Uses libSQL (Turso's SQLite fork) for embedded deployment

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::allocation::AllocationType;
use crate::error::DatabaseError;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        crate::config::DatabaseBackend::LibSql => {
            let default_path = crate::config::default_libsql_path();
            let db_path = config.libsql_path.as_deref().unwrap_or(&default_path);
            let backend = libsql::LibSqlBackend::new_local(db_path).await?;
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "postgres")]
        crate::config::DatabaseBackend::Postgres => {
            let pg = postgres::PgBackend::new(config).await?;
            pg.run_migrations().await?;
            Ok(Arc::new(pg))
        }
        #[allow(unreachable_patterns)]
        _ => Err(DatabaseError::Pool(
            "No database backend available. Enable 'postgres' or 'libsql' feature.".to_string(),
        )),
    }
}

/// Invoice lifecycle: `draft` → `issued` → `paid` | `void`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Issued => "issued",
            Self::Paid => "paid",
            Self::Void => "void",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "issued" => Some(Self::Issued),
            "paid" => Some(Self::Paid),
            "void" => Some(Self::Void),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Issued)
                | (Self::Issued, Self::Paid)
                | (Self::Draft, Self::Void)
                | (Self::Issued, Self::Void)
        )
    }
}

/// Kind of charge an invoice line represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceLineType {
    RetainerFee,
    CurrentMonthRetainer,
    PriorMonthRetainer,
    CatchUp,
    BillableCatchup,
}

impl InvoiceLineType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetainerFee => "retainer_fee",
            Self::CurrentMonthRetainer => "current_month_retainer",
            Self::PriorMonthRetainer => "prior_month_retainer",
            Self::CatchUp => "catch_up",
            Self::BillableCatchup => "billable_catchup",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "retainer_fee" => Some(Self::RetainerFee),
            "current_month_retainer" => Some(Self::CurrentMonthRetainer),
            "prior_month_retainer" => Some(Self::PriorMonthRetainer),
            "catch_up" => Some(Self::CatchUp),
            "billable_catchup" => Some(Self::BillableCatchup),
            _ => None,
        }
    }

    /// Line type that carries fragments of the given allocation, if any.
    pub fn for_allocation(allocation: AllocationType) -> Option<Self> {
        match allocation {
            AllocationType::CurrentMonthRetainer => Some(Self::CurrentMonthRetainer),
            AllocationType::PriorMonthRetainer => Some(Self::PriorMonthRetainer),
            AllocationType::CatchUp => Some(Self::CatchUp),
            AllocationType::BillableCatchup => Some(Self::BillableCatchup),
            AllocationType::Unallocated => None,
        }
    }
}

/// One contractual billing period for a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    pub active_from: NaiveDate,
    /// Exclusive end date.
    pub terminated_at: Option<NaiveDate>,
    pub monthly_retainer_hours: Decimal,
    pub rollover_months: u32,
    pub hourly_rate: Decimal,
    pub monthly_fee: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateAgreementParams {
    pub active_from: NaiveDate,
    pub terminated_at: Option<NaiveDate>,
    pub monthly_retainer_hours: Decimal,
    pub rollover_months: u32,
    pub hourly_rate: Decimal,
    pub monthly_fee: Decimal,
}

/// One logged unit of work on a single calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntryRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    pub user_id: String,
    pub description: String,
    pub minutes_worked: i64,
    pub date_worked: NaiveDate,
    pub billable: bool,
    pub invoice_line_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTimeEntryParams {
    pub user_id: String,
    pub description: String,
    pub minutes_worked: i64,
    pub date_worked: NaiveDate,
    pub billable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    pub invoice_number: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: InvoiceStatus,
    pub retainer_hours_included: Decimal,
    pub hours_worked: Decimal,
    pub rollover_hours_used: Decimal,
    pub unused_hours_balance: Decimal,
    pub negative_hours_balance: Decimal,
    pub hours_billed_at_rate: Decimal,
    pub invoice_total: Decimal,
    pub issued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineRecord {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub line_type: InvoiceLineType,
    pub description: String,
    pub hours: Decimal,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub sort_order: i32,
}

/// A committed slice of a time entry bound to an invoice line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentRecord {
    pub id: Uuid,
    pub time_entry_id: Uuid,
    pub invoice_line_id: Uuid,
    pub minutes: i64,
    pub date_worked: NaiveDate,
    pub allocation_type: AllocationType,
}

#[derive(Debug, Clone)]
pub struct CommitFragmentParams {
    pub time_entry_id: Uuid,
    pub minutes: i64,
    pub date_worked: NaiveDate,
    pub allocation_type: AllocationType,
}

#[derive(Debug, Clone)]
pub struct CommitInvoiceLineParams {
    pub line_type: InvoiceLineType,
    pub description: String,
    pub hours: Decimal,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub sort_order: i32,
    pub fragments: Vec<CommitFragmentParams>,
}

/// Everything written by one invoice-generation commit.
#[derive(Debug, Clone)]
pub struct CommitInvoiceParams {
    pub client_id: Uuid,
    pub invoice_number: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub retainer_hours_included: Decimal,
    pub hours_worked: Decimal,
    pub rollover_hours_used: Decimal,
    pub unused_hours_balance: Decimal,
    pub negative_hours_balance: Decimal,
    pub hours_billed_at_rate: Decimal,
    pub invoice_total: Decimal,
    pub lines: Vec<CommitInvoiceLineParams>,
}

impl CommitInvoiceParams {
    /// Entry ids in line order, each paired with the index of the first line
    /// holding one of its fragments.
    pub fn entry_links(&self) -> Vec<(Uuid, usize)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (line_idx, line) in self.lines.iter().enumerate() {
            for fragment in &line.fragments {
                if seen.insert(fragment.time_entry_id) {
                    out.push((fragment.time_entry_id, line_idx));
                }
            }
        }
        out
    }
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. The `Database` supertrait
// combines them all; leaf consumers can depend on a specific sub-trait instead.

#[async_trait]
pub trait AgreementStore: Send + Sync {
    async fn create_agreement(
        &self,
        client_id: Uuid,
        input: &CreateAgreementParams,
    ) -> Result<AgreementRecord, DatabaseError>;
    async fn list_agreements(&self, client_id: Uuid) -> Result<Vec<AgreementRecord>, DatabaseError>;
    async fn get_agreement(&self, agreement_id: Uuid)
    -> Result<Option<AgreementRecord>, DatabaseError>;
    /// Set the exclusive end date. The only mutation a signed agreement allows.
    async fn terminate_agreement(
        &self,
        agreement_id: Uuid,
        terminated_at: NaiveDate,
    ) -> Result<Option<AgreementRecord>, DatabaseError>;
}

#[async_trait]
pub trait TimeEntryStore: Send + Sync {
    async fn create_time_entry(
        &self,
        client_id: Uuid,
        input: &CreateTimeEntryParams,
    ) -> Result<TimeEntryRecord, DatabaseError>;
    /// Entries for a client, oldest first, excluding soft-removed rows.
    async fn list_time_entries(&self, client_id: Uuid)
    -> Result<Vec<TimeEntryRecord>, DatabaseError>;
    async fn get_time_entry(&self, entry_id: Uuid) -> Result<Option<TimeEntryRecord>, DatabaseError>;
    /// Soft-remove an entry. Invoiced entries are rejected with `Conflict`.
    async fn soft_remove_time_entry(&self, entry_id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn list_invoices(&self, client_id: Uuid) -> Result<Vec<InvoiceRecord>, DatabaseError>;
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError>;
    async fn list_invoice_lines(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineRecord>, DatabaseError>;
    async fn list_invoice_fragments(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<FragmentRecord>, DatabaseError>;
    /// Persist invoice, lines, fragments and entry links in one transaction,
    /// leaving the invoice `issued`. Fails with `Conflict` when a non-void
    /// invoice overlaps the period or any entry is already linked.
    async fn commit_invoice(
        &self,
        input: &CommitInvoiceParams,
    ) -> Result<(InvoiceRecord, Vec<InvoiceLineRecord>), DatabaseError>;
    /// Move an invoice along its lifecycle. Voiding clears its entry links.
    async fn set_invoice_status(
        &self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<Option<InvoiceRecord>, DatabaseError>;
    /// Reset `invoice_total` to the sum of the invoice's line totals.
    async fn recompute_invoice_total(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<InvoiceRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database: AgreementStore + TimeEntryStore + InvoiceStore + Send + Sync {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
