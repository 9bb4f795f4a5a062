//! Agreement validation and the month → agreement timeline.

use rust_decimal::Decimal;

use crate::billing::period::YearMonth;
use crate::db::{AgreementRecord, CreateAgreementParams};
use crate::error::BillingError;

/// Reject agreement terms that cannot be billed against.
pub fn validate_terms(input: &CreateAgreementParams) -> Result<(), BillingError> {
    if input.monthly_retainer_hours < Decimal::ZERO {
        return Err(BillingError::Validation(
            "monthly retainer hours must not be negative".to_string(),
        ));
    }
    if input.hourly_rate < Decimal::ZERO {
        return Err(BillingError::Validation(
            "hourly rate must not be negative".to_string(),
        ));
    }
    if input.monthly_fee < Decimal::ZERO {
        return Err(BillingError::Validation(
            "monthly fee must not be negative".to_string(),
        ));
    }
    if let Some(end) = input.terminated_at
        && end <= input.active_from
    {
        return Err(BillingError::Validation(format!(
            "agreement terminated at {} must end after it becomes active on {}",
            end, input.active_from
        )));
    }
    Ok(())
}

fn terms_of(agreement: &AgreementRecord) -> CreateAgreementParams {
    CreateAgreementParams {
        active_from: agreement.active_from,
        terminated_at: agreement.terminated_at,
        monthly_retainer_hours: agreement.monthly_retainer_hours,
        rollover_months: agreement.rollover_months,
        hourly_rate: agreement.hourly_rate,
        monthly_fee: agreement.monthly_fee,
    }
}

/// Validate every agreement and ensure no calendar day is covered twice.
pub fn validate_agreements(agreements: &[AgreementRecord]) -> Result<(), BillingError> {
    for agreement in agreements {
        validate_terms(&terms_of(agreement))?;
    }

    let mut ordered: Vec<&AgreementRecord> = agreements.iter().collect();
    ordered.sort_by_key(|a| (a.active_from, a.created_at, a.id));
    for pair in ordered.windows(2) {
        let (earlier, later) = (pair[0], pair[1]);
        let overlaps = earlier
            .terminated_at
            .is_none_or(|end| end > later.active_from);
        if overlaps {
            return Err(BillingError::Validation(format!(
                "agreements {} and {} overlap from {}",
                earlier.id, later.id, later.active_from
            )));
        }
    }
    Ok(())
}

/// Check that a proposed agreement fits alongside the existing ones.
pub fn ensure_no_overlap(
    existing: &[AgreementRecord],
    proposed: &CreateAgreementParams,
) -> Result<(), BillingError> {
    validate_terms(proposed)?;
    for agreement in existing {
        let starts_before_existing_ends = agreement
            .terminated_at
            .is_none_or(|end| proposed.active_from < end);
        let ends_after_existing_starts = proposed
            .terminated_at
            .is_none_or(|end| end > agreement.active_from);
        if starts_before_existing_ends && ends_after_existing_starts {
            return Err(BillingError::Validation(format!(
                "agreement starting {} overlaps existing agreement {} (active from {})",
                proposed.active_from, agreement.id, agreement.active_from
            )));
        }
    }
    Ok(())
}

/// Resolves which agreement governs each calendar month.
#[derive(Debug, Clone)]
pub struct AgreementTimeline<'a> {
    agreements: Vec<&'a AgreementRecord>,
}

impl<'a> AgreementTimeline<'a> {
    pub fn new(agreements: &'a [AgreementRecord]) -> Self {
        let mut agreements: Vec<&AgreementRecord> = agreements.iter().collect();
        agreements.sort_by_key(|a| (a.active_from, a.created_at, a.id));
        Self { agreements }
    }

    /// The agreement covering any day of `month`. When a transition happens
    /// mid-month the later agreement governs the whole month.
    pub fn resolve(&self, month: YearMonth) -> Option<&'a AgreementRecord> {
        self.agreements
            .iter()
            .rev()
            .find(|a| month.intersects(a.active_from, a.terminated_at))
            .copied()
    }
}

/// Convenience wrapper over [`AgreementTimeline::resolve`].
pub fn resolve(agreements: &[AgreementRecord], month: YearMonth) -> Option<&AgreementRecord> {
    AgreementTimeline::new(agreements).resolve(month)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::{AgreementTimeline, ensure_no_overlap, resolve, validate_agreements};
    use crate::billing::period::YearMonth;
    use crate::error::BillingError;
    use crate::testing::{agreement, date};

    fn ym(year: i32, month: u32) -> YearMonth {
        YearMonth::new(year, month).expect("valid month")
    }

    #[test]
    fn resolve_returns_none_before_first_agreement() {
        let agreements = vec![agreement(date(2026, 3, 1), None, dec!(10), 1)];
        assert!(resolve(&agreements, ym(2026, 2)).is_none());
        assert_eq!(
            resolve(&agreements, ym(2026, 3)).map(|a| a.id),
            Some(agreements[0].id)
        );
        assert!(resolve(&agreements, ym(2030, 1)).is_some());
    }

    #[test]
    fn resolve_honors_exclusive_termination() {
        let agreements = vec![agreement(date(2026, 1, 1), Some(date(2026, 3, 1)), dec!(10), 0)];
        assert!(resolve(&agreements, ym(2026, 2)).is_some());
        assert!(resolve(&agreements, ym(2026, 3)).is_none());
    }

    #[test]
    fn later_agreement_wins_mid_month_transition() {
        let first = agreement(date(2026, 1, 1), Some(date(2026, 4, 15)), dec!(10), 1);
        let second = agreement(date(2026, 4, 15), None, dec!(20), 2);
        let agreements = vec![second.clone(), first.clone()];
        let timeline = AgreementTimeline::new(&agreements);

        assert_eq!(timeline.resolve(ym(2026, 3)).map(|a| a.id), Some(first.id));
        assert_eq!(timeline.resolve(ym(2026, 4)).map(|a| a.id), Some(second.id));
        assert_eq!(timeline.resolve(ym(2026, 5)).map(|a| a.id), Some(second.id));
    }

    #[test]
    fn overlapping_agreements_are_rejected() {
        let agreements = vec![
            agreement(date(2026, 1, 1), None, dec!(10), 1),
            agreement(date(2026, 6, 1), None, dec!(5), 0),
        ];
        let err = validate_agreements(&agreements).expect_err("open-ended overlap");
        assert!(matches!(err, BillingError::Validation(msg) if msg.contains("overlap")));
    }

    #[test]
    fn back_to_back_agreements_are_valid() {
        let agreements = vec![
            agreement(date(2026, 1, 1), Some(date(2026, 6, 1)), dec!(10), 1),
            agreement(date(2026, 6, 1), None, dec!(5), 0),
        ];
        validate_agreements(&agreements).expect("adjacent agreements do not overlap");
    }

    #[test]
    fn negative_retainer_is_rejected() {
        let agreements = vec![agreement(date(2026, 1, 1), None, dec!(-1), 1)];
        assert!(matches!(
            validate_agreements(&agreements),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn proposed_agreement_must_not_overlap_existing() {
        let existing = vec![agreement(date(2026, 1, 1), Some(date(2026, 6, 1)), dec!(10), 1)];
        let mut proposed = crate::testing::agreement_params(date(2026, 5, 1), None, dec!(8), 0);
        assert!(ensure_no_overlap(&existing, &proposed).is_err());

        proposed.active_from = date(2026, 6, 1);
        ensure_no_overlap(&existing, &proposed).expect("starts when the old one ends");
    }
}
