//! Fixtures shared by unit tests.

#[cfg(feature = "libsql")]
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::db::{AgreementRecord, CreateAgreementParams, CreateTimeEntryParams, TimeEntryRecord};

#[cfg(feature = "libsql")]
use crate::db::Database;

/// Client every in-memory fixture belongs to.
pub const CLIENT_ID: Uuid = Uuid::from_u128(0x5eed_0000_0000_4000_8000_0000_0000_0001);

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid fixture date")
}

pub fn agreement_params(
    active_from: NaiveDate,
    terminated_at: Option<NaiveDate>,
    monthly_retainer_hours: Decimal,
    rollover_months: u32,
) -> CreateAgreementParams {
    CreateAgreementParams {
        active_from,
        terminated_at,
        monthly_retainer_hours,
        rollover_months,
        hourly_rate: dec!(150),
        monthly_fee: dec!(1200),
    }
}

pub fn agreement(
    active_from: NaiveDate,
    terminated_at: Option<NaiveDate>,
    monthly_retainer_hours: Decimal,
    rollover_months: u32,
) -> AgreementRecord {
    let params = agreement_params(active_from, terminated_at, monthly_retainer_hours, rollover_months);
    let now = Utc::now();
    AgreementRecord {
        id: Uuid::new_v4(),
        client_id: CLIENT_ID,
        active_from: params.active_from,
        terminated_at: params.terminated_at,
        monthly_retainer_hours: params.monthly_retainer_hours,
        rollover_months: params.rollover_months,
        hourly_rate: params.hourly_rate,
        monthly_fee: params.monthly_fee,
        created_at: now,
        updated_at: now,
    }
}

pub fn entry_params(date_worked: NaiveDate, minutes_worked: i64) -> CreateTimeEntryParams {
    CreateTimeEntryParams {
        user_id: "avery".to_string(),
        description: format!("Support work on {date_worked}"),
        minutes_worked,
        date_worked,
        billable: true,
    }
}

pub fn entry(date_worked: NaiveDate, minutes_worked: i64) -> TimeEntryRecord {
    let params = entry_params(date_worked, minutes_worked);
    let now = Utc::now();
    TimeEntryRecord {
        id: Uuid::new_v4(),
        client_id: CLIENT_ID,
        user_id: params.user_id,
        description: params.description,
        minutes_worked: params.minutes_worked,
        date_worked: params.date_worked,
        billable: params.billable,
        invoice_line_id: None,
        created_at: now,
        updated_at: now,
    }
}

/// A migrated libSQL database in a temp dir. Keep the `TempDir` alive for
/// the duration of the test.
#[cfg(feature = "libsql")]
pub async fn test_db() -> (Arc<dyn Database>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.db");
    let backend = crate::db::libsql::LibSqlBackend::new_local(&path)
        .await
        .expect("open libsql");
    backend.run_migrations().await.expect("migrations");
    (Arc::new(backend), dir)
}
