//! Request and response DTOs for the billing HTTP API.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::balance::MonthSummary;
use crate::billing::period::YearMonth;
use crate::db::{
    AgreementRecord, CreateAgreementParams, CreateTimeEntryParams, InvoiceRecord, TimeEntryRecord,
};

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub uptime_secs: u64,
}

// --- Balances ---

#[derive(Debug, Default, Deserialize)]
pub struct BalancesQuery {
    /// Extend the ledger through this month even without later entries.
    pub through: Option<YearMonth>,
}

#[derive(Debug, Serialize)]
pub struct BalancesResponse {
    pub client_id: Uuid,
    /// Most recent month first.
    pub months: Vec<MonthSummary>,
}

// --- Invoices ---

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct GenerateInvoiceRequest {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct InvoiceListResponse {
    pub invoices: Vec<InvoiceRecord>,
}

// --- Agreements ---

#[derive(Debug, Deserialize)]
pub struct CreateAgreementRequest {
    pub active_from: NaiveDate,
    #[serde(default)]
    pub terminated_at: Option<NaiveDate>,
    pub monthly_retainer_hours: Decimal,
    pub rollover_months: u32,
    pub hourly_rate: Decimal,
    pub monthly_fee: Decimal,
}

impl From<CreateAgreementRequest> for CreateAgreementParams {
    fn from(req: CreateAgreementRequest) -> Self {
        Self {
            active_from: req.active_from,
            terminated_at: req.terminated_at,
            monthly_retainer_hours: req.monthly_retainer_hours,
            rollover_months: req.rollover_months,
            hourly_rate: req.hourly_rate,
            monthly_fee: req.monthly_fee,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TerminateAgreementRequest {
    pub terminated_at: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct AgreementListResponse {
    pub agreements: Vec<AgreementRecord>,
}

// --- Time entries ---

fn default_billable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CreateTimeEntryRequest {
    pub user_id: String,
    #[serde(default)]
    pub description: String,
    pub minutes_worked: i64,
    pub date_worked: NaiveDate,
    #[serde(default = "default_billable")]
    pub billable: bool,
}

impl From<CreateTimeEntryRequest> for CreateTimeEntryParams {
    fn from(req: CreateTimeEntryRequest) -> Self {
        Self {
            user_id: req.user_id,
            description: req.description,
            minutes_worked: req.minutes_worked,
            date_worked: req.date_worked,
            billable: req.billable,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TimeEntryListResponse {
    pub entries: Vec<TimeEntryRecord>,
}
