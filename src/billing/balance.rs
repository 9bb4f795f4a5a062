//! Monthly balance calculator.
//!
//! Walks calendar months oldest first and folds each month's billable minutes
//! into an explicit [`LedgerState`]: a queue of rollover buckets, the carried
//! negative balance, pre-agreement minutes waiting for the next active month,
//! and overage already billed at the hourly rate.
//!
//! The fold is a pure function of (agreements, entries, policy), so the
//! read-only history view and the invoice allocator always agree.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::agreement::{AgreementTimeline, validate_agreements};
use crate::billing::period::{YearMonth, minutes_to_hours, month_range};
use crate::db::{AgreementRecord, TimeEntryRecord};
use crate::error::BillingError;

/// How much overage may carry forward as a negative balance before the rest
/// is billed at the hourly rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegativeCarryLimit {
    /// One month of the governing agreement's retainer.
    #[default]
    OneMonthRetainer,
    Hours(Decimal),
    Unlimited,
}

impl NegativeCarryLimit {
    fn limit_for(self, retainer_hours: Decimal) -> Option<Decimal> {
        match self {
            Self::OneMonthRetainer => Some(retainer_hours),
            Self::Hours(hours) => Some(hours.max(Decimal::ZERO)),
            Self::Unlimited => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningBalance {
    pub retainer_hours: Decimal,
    pub rollover_hours: Decimal,
    pub expired_hours: Decimal,
    pub total_available: Decimal,
    pub negative_offset: Decimal,
    pub invoiced_negative_balance: Decimal,
    pub effective_retainer_hours: Decimal,
    pub remaining_negative_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingBalance {
    pub hours_used_from_retainer: Decimal,
    pub hours_used_from_rollover: Decimal,
    pub unused_hours: Decimal,
    pub excess_hours: Decimal,
    /// Excess carried forward, to be recovered from the next retainer.
    pub catch_up_hours: Decimal,
    /// Excess beyond the carry limit, billed at the hourly rate.
    pub billable_overage_hours: Decimal,
    pub negative_balance: Decimal,
    pub remaining_rollover: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthSummary {
    pub year_month: YearMonth,
    pub has_agreement: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement_id: Option<Uuid>,
    /// Billable hours counted this month, including folded pre-agreement work.
    pub hours_worked: Decimal,
    pub minutes_worked: i64,
    /// Pre-agreement hours folded into this month.
    pub folded_unbilled_hours: Decimal,
    pub retainer_hours: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opening: Option<OpeningBalance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closing: Option<ClosingBalance>,
    /// Hours waiting for the next agreement (no-agreement months only).
    pub unbilled_hours: Decimal,
    pub will_be_billed_in_next_agreement: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct RolloverBucket {
    /// Last month the credit may be used in.
    usable_through: YearMonth,
    hours: Decimal,
}

/// State carried between months.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerState {
    rollover_buckets: VecDeque<RolloverBucket>,
    carried_negative_balance: Decimal,
    pending_unbilled_minutes: i64,
    billed_overage: Decimal,
}

impl LedgerState {
    fn rollover_hours(&self) -> Decimal {
        self.rollover_buckets.iter().map(|b| b.hours).sum()
    }
}

/// Inputs that widen the walked month range.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceOptions {
    /// Walk at least through this month even if no work was logged.
    pub through: Option<YearMonth>,
    pub negative_carry_limit: NegativeCarryLimit,
}

/// Advance the ledger by one month.
pub fn advance(
    mut state: LedgerState,
    month: YearMonth,
    minutes: i64,
    agreement: Option<&AgreementRecord>,
    limit: NegativeCarryLimit,
) -> (LedgerState, MonthSummary) {
    let Some(agreement) = agreement else {
        state.pending_unbilled_minutes += minutes;
        let summary = MonthSummary {
            year_month: month,
            has_agreement: false,
            agreement_id: None,
            hours_worked: minutes_to_hours(minutes),
            minutes_worked: minutes,
            folded_unbilled_hours: Decimal::ZERO,
            retainer_hours: Decimal::ZERO,
            opening: None,
            closing: None,
            unbilled_hours: minutes_to_hours(state.pending_unbilled_minutes),
            will_be_billed_in_next_agreement: true,
        };
        return (state, summary);
    };

    let folded_minutes = std::mem::take(&mut state.pending_unbilled_minutes);
    let worked_minutes = minutes + folded_minutes;
    let hours_worked = minutes_to_hours(worked_minutes);
    let retainer_hours = agreement.monthly_retainer_hours;

    let mut expired_hours = Decimal::ZERO;
    state.rollover_buckets.retain(|bucket| {
        if bucket.usable_through < month {
            expired_hours += bucket.hours;
            false
        } else {
            true
        }
    });
    let rollover_hours = state.rollover_hours();

    let carried = state.carried_negative_balance;
    let invoiced_negative_balance = std::mem::take(&mut state.billed_overage).min(carried);
    let chargeable_negative = carried - invoiced_negative_balance;
    let negative_offset = chargeable_negative.min(retainer_hours);
    let remaining_negative_balance = chargeable_negative - negative_offset;
    let effective_retainer_hours = (retainer_hours - negative_offset).max(Decimal::ZERO);

    let opening = OpeningBalance {
        retainer_hours,
        rollover_hours,
        expired_hours,
        total_available: retainer_hours + rollover_hours,
        negative_offset,
        invoiced_negative_balance,
        effective_retainer_hours,
        remaining_negative_balance,
    };

    let hours_used_from_retainer = hours_worked.min(effective_retainer_hours);
    let mut left = hours_worked - hours_used_from_retainer;
    let mut hours_used_from_rollover = Decimal::ZERO;
    for bucket in state.rollover_buckets.iter_mut() {
        if left <= Decimal::ZERO {
            break;
        }
        let take = left.min(bucket.hours);
        bucket.hours -= take;
        hours_used_from_rollover += take;
        left -= take;
    }
    state
        .rollover_buckets
        .retain(|bucket| bucket.hours > Decimal::ZERO);
    let excess_hours = left;
    let remaining_rollover = state.rollover_hours();

    let retainer_left = effective_retainer_hours - hours_used_from_retainer;
    if retainer_left > Decimal::ZERO {
        state.rollover_buckets.push_back(RolloverBucket {
            usable_through: month
                .add_months(agreement.rollover_months)
                .unwrap_or(month),
            hours: retainer_left,
        });
    }

    let catch_up_hours = match limit.limit_for(retainer_hours) {
        Some(limit) => excess_hours.min((limit - remaining_negative_balance).max(Decimal::ZERO)),
        None => excess_hours,
    };
    let billable_overage_hours = excess_hours - catch_up_hours;
    let negative_balance = remaining_negative_balance + excess_hours;
    state.carried_negative_balance = negative_balance;
    state.billed_overage = billable_overage_hours;

    let closing = ClosingBalance {
        hours_used_from_retainer,
        hours_used_from_rollover,
        unused_hours: retainer_left + remaining_rollover,
        excess_hours,
        catch_up_hours,
        billable_overage_hours,
        negative_balance,
        remaining_rollover,
    };

    tracing::debug!(
        month = %month,
        hours_worked = %hours_worked,
        effective_retainer = %effective_retainer_hours,
        rollover = %rollover_hours,
        excess = %excess_hours,
        negative_balance = %negative_balance,
        "advanced retainer ledger"
    );

    let summary = MonthSummary {
        year_month: month,
        has_agreement: true,
        agreement_id: Some(agreement.id),
        hours_worked,
        minutes_worked: worked_minutes,
        folded_unbilled_hours: minutes_to_hours(folded_minutes),
        retainer_hours,
        opening: Some(opening),
        closing: Some(closing),
        unbilled_hours: Decimal::ZERO,
        will_be_billed_in_next_agreement: false,
    };
    (state, summary)
}

/// Reject entries the ledger cannot account for.
pub fn validate_entries(entries: &[TimeEntryRecord]) -> Result<(), BillingError> {
    for entry in entries {
        if entry.minutes_worked <= 0 {
            return Err(BillingError::Validation(format!(
                "time entry {} has non-positive minutes ({})",
                entry.id, entry.minutes_worked
            )));
        }
    }
    Ok(())
}

/// Billable minutes per month.
pub fn billable_minutes_by_month(entries: &[TimeEntryRecord]) -> BTreeMap<YearMonth, i64> {
    let mut by_month = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.billable) {
        *by_month
            .entry(YearMonth::from_date(entry.date_worked))
            .or_insert(0) += entry.minutes_worked;
    }
    by_month
}

/// Month summaries oldest first, from the first billable entry's month.
pub fn compute_ledger(
    agreements: &[AgreementRecord],
    entries: &[TimeEntryRecord],
    options: &BalanceOptions,
) -> Result<Vec<MonthSummary>, BillingError> {
    validate_agreements(agreements)?;
    validate_entries(entries)?;

    let by_month = billable_minutes_by_month(entries);
    let (Some(first), Some(last)) = (
        by_month.keys().next().copied(),
        by_month.keys().next_back().copied(),
    ) else {
        return Ok(Vec::new());
    };
    let end = options.through.map_or(last, |through| through.max(last));

    let timeline = AgreementTimeline::new(agreements);
    let mut state = LedgerState::default();
    let mut out = Vec::new();
    for month in month_range(first, end) {
        let minutes = by_month.get(&month).copied().unwrap_or(0);
        let (next, summary) = advance(
            state,
            month,
            minutes,
            timeline.resolve(month),
            options.negative_carry_limit,
        );
        state = next;
        out.push(summary);
    }
    Ok(out)
}

/// Month-by-month history, most recent first.
pub fn monthly_balances(
    agreements: &[AgreementRecord],
    entries: &[TimeEntryRecord],
    options: &BalanceOptions,
) -> Result<Vec<MonthSummary>, BillingError> {
    let mut summaries = compute_ledger(agreements, entries, options)?;
    summaries.reverse();
    Ok(summaries)
}
