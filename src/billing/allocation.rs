//! Time-entry allocator.
//!
//! Replays every billable entry month by month against the pools the balance
//! calculator derived for that month, oldest work first, and slices the
//! entries that belong to the billing period into fragments. Entries already
//! linked to an invoice line still consume pool capacity during the replay
//! but never produce fragments.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::balance::MonthSummary;
use crate::billing::period::{BillingPeriod, YearMonth, hours_to_minutes, minutes_to_hours};
use crate::db::{AgreementRecord, TimeEntryRecord};
use crate::error::BillingError;

/// Billing category a fragment of work is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    PriorMonthRetainer,
    CurrentMonthRetainer,
    CatchUp,
    BillableCatchup,
    Unallocated,
}

impl AllocationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriorMonthRetainer => "prior_month_retainer",
            Self::CurrentMonthRetainer => "current_month_retainer",
            Self::CatchUp => "catch_up",
            Self::BillableCatchup => "billable_catchup",
            Self::Unallocated => "unallocated",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "prior_month_retainer" => Some(Self::PriorMonthRetainer),
            "current_month_retainer" => Some(Self::CurrentMonthRetainer),
            "catch_up" => Some(Self::CatchUp),
            "billable_catchup" => Some(Self::BillableCatchup),
            "unallocated" => Some(Self::Unallocated),
            _ => None,
        }
    }

    /// Billed at the hourly rate rather than covered by the retainer.
    pub fn is_billed_at_rate(self) -> bool {
        matches!(self, Self::BillableCatchup)
    }
}

/// How the allocator breaks ties at pool boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationPolicy {
    /// An entry that overflows an included pool by at most this many minutes
    /// is kept whole in that pool instead of being split. Zero always splits.
    pub split_tolerance_minutes: i64,
}

/// A slice of one time entry assigned to one billing category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntryFragment {
    pub original_time_entry_id: Uuid,
    pub minutes: i64,
    pub date_worked: chrono::NaiveDate,
    pub description: String,
    pub user_id: String,
    /// Set once the fragment is committed to an invoice line.
    pub client_invoice_line_id: Option<Uuid>,
    pub allocation_type: AllocationType,
    /// Month whose pools the fragment was drawn from.
    pub billing_month: YearMonth,
    /// Hourly rate of the agreement governing `billing_month`.
    pub hourly_rate: Decimal,
}

impl TimeEntryFragment {
    pub fn hours(&self) -> Decimal {
        minutes_to_hours(self.minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationTotals {
    pub prior_month_retainer_hours: Decimal,
    pub current_month_retainer_hours: Decimal,
    pub catch_up_hours: Decimal,
    pub billable_catchup_hours: Decimal,
    pub unallocated_hours: Decimal,
}

/// Categorized fragments for one invoice-generation attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub prior_month_retainer: Vec<TimeEntryFragment>,
    pub current_month_retainer: Vec<TimeEntryFragment>,
    pub catch_up: Vec<TimeEntryFragment>,
    pub billable_catchup: Vec<TimeEntryFragment>,
    /// In-period work with no agreement to bill it under yet.
    pub unallocated: Vec<TimeEntryFragment>,
}

impl AllocationPlan {
    fn push(&mut self, fragment: TimeEntryFragment) {
        let bucket = match fragment.allocation_type {
            AllocationType::PriorMonthRetainer => &mut self.prior_month_retainer,
            AllocationType::CurrentMonthRetainer => &mut self.current_month_retainer,
            AllocationType::CatchUp => &mut self.catch_up,
            AllocationType::BillableCatchup => &mut self.billable_catchup,
            AllocationType::Unallocated => &mut self.unallocated,
        };
        bucket.push(fragment);
    }

    pub fn fragments(&self, allocation: AllocationType) -> &[TimeEntryFragment] {
        match allocation {
            AllocationType::PriorMonthRetainer => &self.prior_month_retainer,
            AllocationType::CurrentMonthRetainer => &self.current_month_retainer,
            AllocationType::CatchUp => &self.catch_up,
            AllocationType::BillableCatchup => &self.billable_catchup,
            AllocationType::Unallocated => &self.unallocated,
        }
    }

    /// Fragments that land on an invoice line.
    pub fn allocated(&self) -> impl Iterator<Item = &TimeEntryFragment> {
        self.current_month_retainer
            .iter()
            .chain(&self.prior_month_retainer)
            .chain(&self.catch_up)
            .chain(&self.billable_catchup)
    }

    pub fn hours(&self, allocation: AllocationType) -> Decimal {
        minutes_to_hours(self.fragments(allocation).iter().map(|f| f.minutes).sum())
    }

    pub fn totals(&self) -> AllocationTotals {
        AllocationTotals {
            prior_month_retainer_hours: self.hours(AllocationType::PriorMonthRetainer),
            current_month_retainer_hours: self.hours(AllocationType::CurrentMonthRetainer),
            catch_up_hours: self.hours(AllocationType::CatchUp),
            billable_catchup_hours: self.hours(AllocationType::BillableCatchup),
            unallocated_hours: self.hours(AllocationType::Unallocated),
        }
    }
}

/// Remaining minutes in each pool of one month, in consumption order.
struct MonthPools {
    pools: [(AllocationType, i64); 3],
}

impl MonthPools {
    fn from_summary(summary: &MonthSummary) -> Self {
        let (current, prior, catch_up) = match (&summary.opening, &summary.closing) {
            (Some(opening), Some(closing)) => (
                hours_to_minutes(opening.effective_retainer_hours),
                hours_to_minutes(opening.rollover_hours),
                hours_to_minutes(closing.catch_up_hours),
            ),
            _ => (0, 0, 0),
        };
        Self {
            pools: [
                (AllocationType::CurrentMonthRetainer, current),
                (AllocationType::PriorMonthRetainer, prior),
                (AllocationType::CatchUp, catch_up),
            ],
        }
    }

    /// Split `minutes` across the pools; whatever is left is billed at rate.
    fn take(&mut self, minutes: i64, tolerance: i64) -> Vec<(AllocationType, i64)> {
        let mut out = Vec::new();
        let mut left = minutes;
        for idx in 0..self.pools.len() {
            if left == 0 {
                break;
            }
            let (allocation, available) = self.pools[idx];
            if available <= 0 {
                continue;
            }
            if left <= available {
                self.pools[idx].1 -= left;
                out.push((allocation, left));
                left = 0;
                break;
            }
            let overflow = left - available;
            if out.is_empty() && overflow <= tolerance && overflow <= self.remaining_after(idx) {
                self.pools[idx].1 = 0;
                out.push((allocation, left));
                left = 0;
                self.absorb(idx + 1, overflow);
                break;
            }
            self.pools[idx].1 = 0;
            out.push((allocation, available));
            left -= available;
        }
        if left > 0 {
            out.push((AllocationType::BillableCatchup, left));
        }
        out
    }

    fn remaining_after(&self, idx: usize) -> i64 {
        self.pools.iter().skip(idx + 1).map(|pool| pool.1).sum()
    }

    /// Charge minutes kept whole in an earlier pool against the later ones.
    fn absorb(&mut self, from: usize, mut minutes: i64) {
        for pool in self.pools.iter_mut().skip(from) {
            let taken = minutes.min(pool.1);
            pool.1 -= taken;
            minutes -= taken;
        }
    }
}

fn fragment(
    entry: &TimeEntryRecord,
    minutes: i64,
    allocation: AllocationType,
    billing_month: YearMonth,
    hourly_rate: Decimal,
) -> TimeEntryFragment {
    TimeEntryFragment {
        original_time_entry_id: entry.id,
        minutes,
        date_worked: entry.date_worked,
        description: entry.description.clone(),
        user_id: entry.user_id.clone(),
        client_invoice_line_id: None,
        allocation_type: allocation,
        billing_month,
        hourly_rate,
    }
}

/// Partition the period's billable work into fragments.
///
/// `months` must be the oldest-first ledger computed from the same
/// `agreements` and `entries`, walked at least through the period's last
/// month.
pub fn allocate(
    entries: &[TimeEntryRecord],
    months: &[MonthSummary],
    agreements: &[AgreementRecord],
    period: &BillingPeriod,
    policy: &AllocationPolicy,
) -> Result<AllocationPlan, BillingError> {
    if policy.split_tolerance_minutes < 0 {
        return Err(BillingError::Validation(
            "split tolerance must not be negative".to_string(),
        ));
    }

    let mut by_month: BTreeMap<YearMonth, Vec<&TimeEntryRecord>> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.billable) {
        if entry.minutes_worked <= 0 {
            return Err(BillingError::Validation(format!(
                "time entry {} has non-positive minutes ({})",
                entry.id, entry.minutes_worked
            )));
        }
        by_month
            .entry(YearMonth::from_date(entry.date_worked))
            .or_default()
            .push(entry);
    }
    for queue in by_month.values_mut() {
        queue.sort_by_key(|e| (e.date_worked, e.created_at, e.id));
    }

    let rates: HashMap<Uuid, Decimal> = agreements.iter().map(|a| (a.id, a.hourly_rate)).collect();
    let eligible_in_period =
        |entry: &TimeEntryRecord| entry.invoice_line_id.is_none() && period.contains(entry.date_worked);

    let mut plan = AllocationPlan::default();
    let mut pending: Vec<&TimeEntryRecord> = Vec::new();
    // In-period work that only found an agreement after the period ended.
    let mut deferred: Vec<&TimeEntryRecord> = Vec::new();

    for summary in months {
        let month = summary.year_month;
        let month_entries = by_month.get(&month).map(Vec::as_slice).unwrap_or_default();

        let Some(agreement_id) = summary.agreement_id.filter(|_| summary.has_agreement) else {
            pending.extend_from_slice(month_entries);
            continue;
        };
        let hourly_rate = rates.get(&agreement_id).copied().ok_or_else(|| {
            BillingError::Validation(format!(
                "month {} references unknown agreement {}",
                month, agreement_id
            ))
        })?;

        let folded = std::mem::take(&mut pending);
        let folded_count = folded.len();
        let mut pools = MonthPools::from_summary(summary);

        for (idx, entry) in folded.iter().chain(month_entries).enumerate() {
            let split = pools.take(entry.minutes_worked, policy.split_tolerance_minutes);
            let was_pending = idx < folded_count;
            if was_pending && !period.touches(month) {
                deferred.push(*entry);
                continue;
            }
            let eligible = entry.invoice_line_id.is_none()
                && (was_pending || period.contains(entry.date_worked));
            if !eligible {
                continue;
            }
            for (allocation, minutes) in split {
                let rate = if allocation.is_billed_at_rate() {
                    hourly_rate
                } else {
                    Decimal::ZERO
                };
                plan.push(fragment(entry, minutes, allocation, month, rate));
            }
        }
    }

    // Work with no agreement month inside the period to bill it under.
    for entry in deferred
        .into_iter()
        .chain(pending)
        .filter(|e| eligible_in_period(e))
    {
        plan.push(fragment(
            entry,
            entry.minutes_worked,
            AllocationType::Unallocated,
            YearMonth::from_date(entry.date_worked),
            Decimal::ZERO,
        ));
    }

    tracing::debug!(
        period = %period,
        current = plan.current_month_retainer.len(),
        prior = plan.prior_month_retainer.len(),
        catch_up = plan.catch_up.len(),
        billable = plan.billable_catchup.len(),
        unallocated = plan.unallocated.len(),
        "allocated time entries"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::{AllocationPlan, AllocationPolicy, AllocationType, allocate};
    use crate::billing::balance::{BalanceOptions, NegativeCarryLimit, compute_ledger};
    use crate::billing::period::{BillingPeriod, YearMonth, hours_to_minutes};
    use crate::db::{AgreementRecord, TimeEntryRecord};
    use crate::testing::{agreement, date, entry};

    fn plan_for(
        agreements: &[AgreementRecord],
        entries: &[TimeEntryRecord],
        period: BillingPeriod,
        policy: AllocationPolicy,
    ) -> AllocationPlan {
        let ledger = compute_ledger(
            agreements,
            entries,
            &BalanceOptions {
                through: Some(period.last_month()),
                ..Default::default()
            },
        )
        .expect("ledger");
        allocate(entries, &ledger, agreements, &period, &policy).expect("plan")
    }

    fn period(start: (i32, u32, u32), end: (i32, u32, u32)) -> BillingPeriod {
        BillingPeriod::new(date(start.0, start.1, start.2), date(end.0, end.1, end.2))
            .expect("period")
    }

    fn minutes_by_entry(plan: &AllocationPlan) -> HashMap<Uuid, i64> {
        let mut out = HashMap::new();
        for fragment in plan.allocated().chain(&plan.unallocated) {
            *out.entry(fragment.original_time_entry_id).or_insert(0) += fragment.minutes;
        }
        out
    }

    #[test]
    fn entry_within_retainer_is_one_fragment() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(10), 1)];
        let entries = vec![entry(date(2026, 1, 5), 120)];
        let plan = plan_for(
            &agreements,
            &entries,
            period((2026, 1, 1), (2026, 1, 31)),
            AllocationPolicy::default(),
        );
        assert_eq!(plan.current_month_retainer.len(), 1);
        assert_eq!(plan.current_month_retainer[0].minutes, 120);
        assert!(plan.billable_catchup.is_empty());
    }

    #[test]
    fn overflowing_entry_is_split_without_losing_minutes() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(1), 0)];
        let entries = vec![entry(date(2026, 1, 5), 45), entry(date(2026, 1, 6), 45)];
        let plan = plan_for(
            &agreements,
            &entries,
            period((2026, 1, 1), (2026, 1, 31)),
            AllocationPolicy::default(),
        );

        assert_eq!(plan.hours(AllocationType::CurrentMonthRetainer), dec!(1));
        assert_eq!(plan.catch_up.len(), 1);
        assert_eq!(plan.catch_up[0].minutes, 30);
        assert_eq!(plan.catch_up[0].original_time_entry_id, entries[1].id);

        let totals = minutes_by_entry(&plan);
        for e in &entries {
            assert_eq!(totals[&e.id], e.minutes_worked);
        }
    }

    #[test]
    fn rollover_is_consumed_after_current_retainer() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(2), 1)];
        let entries = vec![entry(date(2026, 1, 5), 60), entry(date(2026, 2, 5), 150)];
        let plan = plan_for(
            &agreements,
            &entries,
            period((2026, 2, 1), (2026, 2, 28)),
            AllocationPolicy::default(),
        );
        assert_eq!(plan.hours(AllocationType::CurrentMonthRetainer), dec!(2));
        assert_eq!(plan.hours(AllocationType::PriorMonthRetainer), dec!(0.5));
        assert!(plan.catch_up.is_empty());
        // January's entry is outside the period and never appears.
        assert!(
            plan.allocated()
                .all(|f| f.original_time_entry_id == entries[1].id)
        );
    }

    #[test]
    fn overage_beyond_carry_limit_is_billed_at_rate() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(1), 0)];
        let entries = vec![entry(date(2026, 1, 5), 4 * 60)];
        let plan = plan_for(
            &agreements,
            &entries,
            period((2026, 1, 1), (2026, 1, 31)),
            AllocationPolicy::default(),
        );
        let totals = plan.totals();
        assert_eq!(totals.current_month_retainer_hours, dec!(1));
        assert_eq!(totals.catch_up_hours, dec!(1));
        assert_eq!(totals.billable_catchup_hours, dec!(2));
        assert_eq!(plan.billable_catchup[0].hourly_rate, agreements[0].hourly_rate);
        assert_eq!(plan.catch_up[0].hourly_rate, Decimal::ZERO);
    }

    #[test]
    fn linked_entries_consume_pools_but_never_reappear() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(1), 0)];
        let mut invoiced = entry(date(2026, 1, 5), 60);
        invoiced.invoice_line_id = Some(Uuid::new_v4());
        let fresh = entry(date(2026, 1, 20), 30);
        let entries = vec![invoiced.clone(), fresh.clone()];

        let plan = plan_for(
            &agreements,
            &entries,
            period((2026, 1, 1), (2026, 1, 31)),
            AllocationPolicy::default(),
        );
        assert!(
            plan.allocated()
                .all(|f| f.original_time_entry_id != invoiced.id)
        );
        assert!(plan.current_month_retainer.is_empty());
        assert_eq!(plan.catch_up.len(), 1);
        assert_eq!(plan.catch_up[0].original_time_entry_id, fresh.id);
    }

    #[test]
    fn pre_agreement_entries_fold_into_first_active_month() {
        let agreements = vec![agreement(date(2026, 2, 1), None, dec!(10), 1)];
        let early = entry(date(2026, 1, 20), 60);
        let later = entry(date(2026, 2, 3), 60);
        let entries = vec![early.clone(), later.clone()];

        let plan = plan_for(
            &agreements,
            &entries,
            period((2026, 2, 1), (2026, 2, 28)),
            AllocationPolicy::default(),
        );
        assert_eq!(plan.current_month_retainer.len(), 2);
        assert_eq!(plan.current_month_retainer[0].original_time_entry_id, early.id);
        let feb = YearMonth::new(2026, 2).expect("month");
        assert!(plan.current_month_retainer.iter().all(|f| f.billing_month == feb));
    }

    #[test]
    fn in_period_work_without_agreement_is_unallocated() {
        let agreements = vec![agreement(date(2026, 3, 1), None, dec!(10), 1)];
        let entries = vec![entry(date(2026, 1, 20), 60)];
        let plan = plan_for(
            &agreements,
            &entries,
            period((2026, 1, 1), (2026, 1, 31)),
            AllocationPolicy::default(),
        );
        assert_eq!(plan.allocated().count(), 0);
        assert_eq!(plan.unallocated.len(), 1);
        assert_eq!(plan.totals().unallocated_hours, dec!(1));
    }

    #[test]
    fn work_folded_after_the_period_stays_unallocated() {
        let agreements = vec![agreement(date(2026, 3, 1), None, dec!(10), 1)];
        let january = entry(date(2026, 1, 20), 60);
        let april = entry(date(2026, 4, 5), 60);
        let entries = vec![january.clone(), april];
        let period = period((2026, 1, 1), (2026, 1, 31));

        // The later entry walks the ledger into March, where January's work folds.
        let ledger =
            compute_ledger(&agreements, &entries, &BalanceOptions::default()).expect("ledger");
        assert!(ledger.iter().any(|m| m.year_month == YearMonth::new(2026, 3).expect("month")));
        let plan = allocate(
            &entries,
            &ledger,
            &agreements,
            &period,
            &AllocationPolicy::default(),
        )
        .expect("plan");

        assert_eq!(plan.allocated().count(), 0);
        assert_eq!(plan.unallocated.len(), 1);
        assert_eq!(plan.unallocated[0].original_time_entry_id, january.id);
        assert_eq!(
            plan,
            plan_for(&agreements, &entries, period, AllocationPolicy::default())
        );
    }

    #[test]
    fn tolerance_never_hides_overage_when_later_pools_are_empty() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(1), 0)];
        let entries = vec![entry(date(2026, 1, 5), 50), entry(date(2026, 1, 6), 15)];
        let ledger = compute_ledger(
            &agreements,
            &entries,
            &BalanceOptions {
                negative_carry_limit: NegativeCarryLimit::Hours(Decimal::ZERO),
                ..Default::default()
            },
        )
        .expect("ledger");
        let closing = ledger[0].closing.as_ref().expect("closing");
        assert_eq!(hours_to_minutes(closing.billable_overage_hours), 5);

        let plan = allocate(
            &entries,
            &ledger,
            &agreements,
            &period((2026, 1, 1), (2026, 1, 31)),
            &AllocationPolicy {
                split_tolerance_minutes: 10,
            },
        )
        .expect("plan");
        assert_eq!(plan.billable_catchup.len(), 1);
        assert_eq!(plan.billable_catchup[0].minutes, 5);
        assert_eq!(plan.billable_catchup[0].original_time_entry_id, entries[1].id);
        assert_eq!(plan.hours(AllocationType::CurrentMonthRetainer), dec!(1));
    }

    #[test]
    fn tolerance_keeps_small_overflow_whole() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(1), 0)];
        let entries = vec![entry(date(2026, 1, 5), 50), entry(date(2026, 1, 6), 15)];

        let strict = plan_for(
            &agreements,
            &entries,
            period((2026, 1, 1), (2026, 1, 31)),
            AllocationPolicy::default(),
        );
        assert_eq!(strict.current_month_retainer.len(), 2);
        assert_eq!(strict.catch_up.len(), 1);

        let lenient = plan_for(
            &agreements,
            &entries,
            period((2026, 1, 1), (2026, 1, 31)),
            AllocationPolicy {
                split_tolerance_minutes: 5,
            },
        );
        assert_eq!(lenient.current_month_retainer.len(), 2);
        assert!(lenient.catch_up.is_empty());
        assert_eq!(lenient.hours(AllocationType::CurrentMonthRetainer), dec!(65) / dec!(60));
    }

    #[test]
    fn conservation_holds_across_many_entries() {
        let agreements = vec![
            agreement(date(2025, 11, 1), Some(date(2026, 2, 1)), dec!(3), 1),
            agreement(date(2026, 2, 1), None, dec!(5), 2),
        ];
        let mut entries = Vec::new();
        for (day, minutes) in [(3, 95), (9, 40), (17, 170), (23, 55), (28, 10)] {
            entries.push(entry(date(2025, 10, day), minutes));
            entries.push(entry(date(2025, 12, day), minutes + 7));
            entries.push(entry(date(2026, 2, day), minutes * 2));
            entries.push(entry(date(2026, 3, day), minutes + 31));
        }
        let plan = plan_for(
            &agreements,
            &entries,
            period((2025, 10, 1), (2026, 3, 31)),
            AllocationPolicy::default(),
        );
        let totals = minutes_by_entry(&plan);
        assert_eq!(totals.len(), entries.len());
        for e in &entries {
            assert_eq!(totals[&e.id], e.minutes_worked, "entry on {}", e.date_worked);
        }
        assert!(plan.unallocated.is_empty());
    }

    #[test]
    fn negative_tolerance_is_rejected() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(1), 0)];
        let entries = vec![entry(date(2026, 1, 5), 30)];
        let period = period((2026, 1, 1), (2026, 1, 31));
        let ledger =
            compute_ledger(&agreements, &entries, &BalanceOptions::default()).expect("ledger");
        let err = allocate(
            &entries,
            &ledger,
            &agreements,
            &period,
            &AllocationPolicy {
                split_tolerance_minutes: -1,
            },
        );
        assert!(err.is_err());
    }
}
