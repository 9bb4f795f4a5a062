//! Invoice assembler and the billing operations exposed to callers.
//!
//! `assemble` is pure: it turns an allocation plan and the period's month
//! summaries into totals and grouped lines. The async functions load a
//! client's agreements and entries from the store, run the engine, and for
//! `generate_invoice` hand the result to a single store transaction.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::billing::agreement::{AgreementTimeline, ensure_no_overlap};
use crate::billing::allocation::{
    AllocationPlan, AllocationTotals, AllocationType, TimeEntryFragment, allocate,
};
use crate::billing::audit;
use crate::billing::balance::{BalanceOptions, MonthSummary, compute_ledger, monthly_balances};
use crate::billing::period::{BillingPeriod, YearMonth, minutes_to_hours, month_range};
use crate::config::BillingConfig;
use crate::db::{
    AgreementRecord, CommitFragmentParams, CommitInvoiceLineParams, CommitInvoiceParams,
    CreateAgreementParams, CreateTimeEntryParams, Database, FragmentRecord, InvoiceLineRecord,
    InvoiceLineType, InvoiceRecord, InvoiceStatus, TimeEntryRecord,
};
use crate::error::BillingError;

/// Line categories in invoice order, after the retainer fee lines.
const WORK_LINE_ORDER: [AllocationType; 4] = [
    AllocationType::CurrentMonthRetainer,
    AllocationType::PriorMonthRetainer,
    AllocationType::CatchUp,
    AllocationType::BillableCatchup,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceTotals {
    pub retainer_hours_included: Decimal,
    pub hours_worked: Decimal,
    pub rollover_hours_used: Decimal,
    pub unused_hours_balance: Decimal,
    pub negative_hours_balance: Decimal,
    pub hours_billed_at_rate: Decimal,
    pub retainer_fees: Decimal,
    pub invoice_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceLineDraft {
    pub line_type: InvoiceLineType,
    pub description: String,
    pub hours: Decimal,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub sort_order: i32,
    pub fragments: Vec<TimeEntryFragment>,
}

/// Everything a preview shows; generation commits exactly this.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoicePreview {
    pub client_id: Uuid,
    pub period: BillingPeriod,
    pub totals: InvoiceTotals,
    pub allocation: AllocationTotals,
    pub lines: Vec<InvoiceLineDraft>,
    /// In-period work waiting for an agreement; not billed by this invoice.
    pub unallocated: Vec<TimeEntryFragment>,
    /// Ledger months touching the period, oldest first.
    pub months: Vec<MonthSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceDetail {
    pub invoice: InvoiceRecord,
    pub lines: Vec<InvoiceLineRecord>,
    pub fragments: Vec<FragmentRecord>,
}

fn work_line_description(allocation: AllocationType, unit_price: Decimal) -> String {
    match allocation {
        AllocationType::CurrentMonthRetainer => "Retainer hours (current month)".to_string(),
        AllocationType::PriorMonthRetainer => "Rollover hours from prior months".to_string(),
        AllocationType::CatchUp => "Catch-up hours carried against the next retainer".to_string(),
        AllocationType::BillableCatchup => format!("Hours billed at {}/hour", unit_price),
        AllocationType::Unallocated => "Unallocated hours".to_string(),
    }
}

fn sort_order(idx: usize) -> i32 {
    i32::try_from(idx).unwrap_or(i32::MAX)
}

/// Months whose retainer fee falls in the period.
fn fee_months<'a>(
    agreements: &'a [AgreementRecord],
    period: &BillingPeriod,
) -> Vec<(YearMonth, &'a AgreementRecord)> {
    let timeline = AgreementTimeline::new(agreements);
    month_range(period.first_month(), period.last_month())
        .into_iter()
        .filter(|month| period.contains(month.first_day()))
        .filter_map(|month| timeline.resolve(month).map(|a| (month, a)))
        .collect()
}

/// Build totals and grouped lines from a computed plan.
pub fn assemble(
    client_id: Uuid,
    agreements: &[AgreementRecord],
    ledger: &[MonthSummary],
    plan: AllocationPlan,
    period: BillingPeriod,
) -> InvoicePreview {
    let mut lines = Vec::new();

    let fees = fee_months(agreements, &period);
    for (month, agreement) in &fees {
        let fee = agreement.monthly_fee.round_dp(2);
        lines.push(InvoiceLineDraft {
            line_type: InvoiceLineType::RetainerFee,
            description: format!(
                "Monthly retainer {} ({} hours included)",
                month,
                agreement.monthly_retainer_hours.normalize()
            ),
            hours: Decimal::ONE,
            unit_price: fee,
            line_total: fee,
            sort_order: sort_order(lines.len()),
            fragments: Vec::new(),
        });
    }

    for allocation in WORK_LINE_ORDER {
        let Some(line_type) = InvoiceLineType::for_allocation(allocation) else {
            continue;
        };
        let mut by_price: BTreeMap<Decimal, Vec<TimeEntryFragment>> = BTreeMap::new();
        for fragment in plan.fragments(allocation) {
            by_price
                .entry(fragment.hourly_rate)
                .or_default()
                .push(fragment.clone());
        }
        for (unit_price, fragments) in by_price {
            let hours = minutes_to_hours(fragments.iter().map(|f| f.minutes).sum());
            lines.push(InvoiceLineDraft {
                line_type,
                description: work_line_description(allocation, unit_price),
                hours: hours.round_dp(4),
                unit_price,
                line_total: (hours * unit_price).round_dp(2),
                sort_order: sort_order(lines.len()),
                fragments,
            });
        }
    }

    let months: Vec<MonthSummary> = ledger
        .iter()
        .filter(|m| period.touches(m.year_month))
        .cloned()
        .collect();
    let (unused_hours_balance, negative_hours_balance) = months
        .iter()
        .rev()
        .find_map(|m| m.closing.as_ref())
        .map(|closing| {
            (
                closing.unused_hours,
                closing.negative_balance - closing.billable_overage_hours,
            )
        })
        .unwrap_or((Decimal::ZERO, Decimal::ZERO));

    let retainer_fees: Decimal = lines
        .iter()
        .filter(|l| l.line_type == InvoiceLineType::RetainerFee)
        .map(|l| l.line_total)
        .sum();
    let invoice_total = lines.iter().map(|l| l.line_total).sum();
    let allocated_minutes: i64 = plan.allocated().map(|f| f.minutes).sum();

    let totals = InvoiceTotals {
        retainer_hours_included: fees.iter().map(|(_, a)| a.monthly_retainer_hours).sum(),
        hours_worked: minutes_to_hours(allocated_minutes).round_dp(4),
        rollover_hours_used: plan.hours(AllocationType::PriorMonthRetainer).round_dp(4),
        unused_hours_balance: unused_hours_balance.round_dp(4),
        negative_hours_balance: negative_hours_balance.round_dp(4),
        hours_billed_at_rate: plan.hours(AllocationType::BillableCatchup).round_dp(4),
        retainer_fees,
        invoice_total,
    };

    InvoicePreview {
        client_id,
        period,
        totals,
        allocation: plan.totals(),
        lines,
        unallocated: plan.unallocated,
        months,
    }
}

/// Run the full engine over already-loaded inputs.
pub fn compute_preview(
    client_id: Uuid,
    agreements: &[AgreementRecord],
    entries: &[TimeEntryRecord],
    period: BillingPeriod,
    config: &BillingConfig,
) -> Result<InvoicePreview, BillingError> {
    let ledger = compute_ledger(
        agreements,
        entries,
        &BalanceOptions {
            through: Some(period.last_month()),
            negative_carry_limit: config.negative_carry_limit,
        },
    )?;
    let plan = allocate(entries, &ledger, agreements, &period, &config.allocation)?;
    Ok(assemble(client_id, agreements, &ledger, plan, period))
}

/// Month-by-month history for a client, most recent first.
pub async fn get_monthly_balances(
    db: &dyn Database,
    client_id: Uuid,
    through: Option<YearMonth>,
    config: &BillingConfig,
) -> Result<Vec<MonthSummary>, BillingError> {
    let agreements = db.list_agreements(client_id).await?;
    let entries = db.list_time_entries(client_id).await?;
    monthly_balances(
        &agreements,
        &entries,
        &BalanceOptions {
            through,
            negative_carry_limit: config.negative_carry_limit,
        },
    )
}

/// Compute what `generate_invoice` would commit, without side effects.
pub async fn preview_invoice(
    db: &dyn Database,
    client_id: Uuid,
    period_start: NaiveDate,
    period_end: NaiveDate,
    config: &BillingConfig,
) -> Result<InvoicePreview, BillingError> {
    let period = BillingPeriod::new(period_start, period_end)?;
    let agreements = db.list_agreements(client_id).await?;
    let entries = db.list_time_entries(client_id).await?;
    compute_preview(client_id, &agreements, &entries, period, config)
}

fn invoice_number(prefix: &str, client_id: Uuid, period: &BillingPeriod, sequence: usize) -> String {
    let client = client_id.simple().to_string();
    format!(
        "{}-{}-{}-{}",
        prefix,
        &client[..8],
        period.start.format("%Y%m%d"),
        sequence
    )
}

fn commit_params(preview: &InvoicePreview, invoice_number: String) -> CommitInvoiceParams {
    let totals = &preview.totals;
    CommitInvoiceParams {
        client_id: preview.client_id,
        invoice_number,
        period_start: preview.period.start,
        period_end: preview.period.end,
        retainer_hours_included: totals.retainer_hours_included,
        hours_worked: totals.hours_worked,
        rollover_hours_used: totals.rollover_hours_used,
        unused_hours_balance: totals.unused_hours_balance,
        negative_hours_balance: totals.negative_hours_balance,
        hours_billed_at_rate: totals.hours_billed_at_rate,
        invoice_total: totals.invoice_total,
        lines: preview
            .lines
            .iter()
            .map(|line| CommitInvoiceLineParams {
                line_type: line.line_type,
                description: line.description.clone(),
                hours: line.hours,
                unit_price: line.unit_price,
                line_total: line.line_total,
                sort_order: line.sort_order,
                fragments: line
                    .fragments
                    .iter()
                    .map(|f| CommitFragmentParams {
                        time_entry_id: f.original_time_entry_id,
                        minutes: f.minutes,
                        date_worked: f.date_worked,
                        allocation_type: f.allocation_type,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Allocate and persist one invoice for the period.
///
/// The overlap guard and entry-link checks run inside the store transaction,
/// so a concurrent second request for the same period fails with `Conflict`.
pub async fn generate_invoice(
    db: &dyn Database,
    client_id: Uuid,
    period_start: NaiveDate,
    period_end: NaiveDate,
    config: &BillingConfig,
) -> Result<InvoiceDetail, BillingError> {
    let preview = preview_invoice(db, client_id, period_start, period_end, config).await?;
    if preview.lines.is_empty() {
        return Err(BillingError::Validation(format!(
            "nothing to invoice for client {} in {}",
            client_id, preview.period
        )));
    }

    let sequence = db.list_invoices(client_id).await?.len() + 1;
    let number = invoice_number(&config.invoice_prefix, client_id, &preview.period, sequence);
    let params = commit_params(&preview, number);

    let (invoice, lines) = match db.commit_invoice(&params).await {
        Ok(committed) => committed,
        Err(e) => {
            let err = BillingError::from(e);
            tracing::warn!(
                client_id = %client_id,
                period = %preview.period,
                "Invoice generation rejected: {}",
                err
            );
            audit::record(
                audit::INVOICE_GENERATION_REJECTED,
                serde_json::json!({
                    "client_id": client_id.to_string(),
                    "period_start": preview.period.start.to_string(),
                    "period_end": preview.period.end.to_string(),
                    "reason": err.to_string(),
                }),
            );
            return Err(err);
        }
    };

    tracing::info!(
        client_id = %client_id,
        invoice_id = %invoice.id,
        invoice_number = %invoice.invoice_number,
        period = %preview.period,
        total = %invoice.invoice_total,
        hours_worked = %invoice.hours_worked,
        "Invoice generated"
    );
    audit::record(
        audit::INVOICE_GENERATED,
        serde_json::json!({
            "client_id": client_id.to_string(),
            "invoice_id": invoice.id.to_string(),
            "invoice_number": invoice.invoice_number,
            "period_start": invoice.period_start.to_string(),
            "period_end": invoice.period_end.to_string(),
            "invoice_total": invoice.invoice_total.to_string(),
            "line_count": lines.len(),
        }),
    );

    let fragments = db.list_invoice_fragments(invoice.id).await?;
    Ok(InvoiceDetail {
        invoice,
        lines,
        fragments,
    })
}

pub async fn get_invoice_detail(
    db: &dyn Database,
    invoice_id: Uuid,
) -> Result<InvoiceDetail, BillingError> {
    let invoice = db
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))?;
    let lines = db.list_invoice_lines(invoice_id).await?;
    let fragments = db.list_invoice_fragments(invoice_id).await?;
    Ok(InvoiceDetail {
        invoice,
        lines,
        fragments,
    })
}

async fn transition(
    db: &dyn Database,
    invoice_id: Uuid,
    next: InvoiceStatus,
) -> Result<InvoiceRecord, BillingError> {
    let current = db
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))?;
    if !current.status.can_transition_to(next) {
        return Err(BillingError::Conflict(format!(
            "invoice {} cannot move from '{}' to '{}'",
            current.invoice_number,
            current.status.as_str(),
            next.as_str()
        )));
    }
    let updated = db
        .set_invoice_status(invoice_id, next)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))?;

    let event = if next == InvoiceStatus::Void {
        audit::INVOICE_VOIDED
    } else {
        audit::INVOICE_STATUS_CHANGED
    };
    audit::record(
        event,
        serde_json::json!({
            "client_id": updated.client_id.to_string(),
            "invoice_id": updated.id.to_string(),
            "invoice_number": updated.invoice_number,
            "from": current.status.as_str(),
            "to": updated.status.as_str(),
        }),
    );
    tracing::info!(
        invoice_id = %updated.id,
        from = current.status.as_str(),
        to = updated.status.as_str(),
        "Invoice status changed"
    );
    Ok(updated)
}

pub async fn mark_paid(db: &dyn Database, invoice_id: Uuid) -> Result<InvoiceRecord, BillingError> {
    transition(db, invoice_id, InvoiceStatus::Paid).await
}

/// Void an invoice and release its time entries for the next run.
pub async fn void_invoice(
    db: &dyn Database,
    invoice_id: Uuid,
) -> Result<InvoiceRecord, BillingError> {
    transition(db, invoice_id, InvoiceStatus::Void).await
}

pub async fn recompute_invoice_total(
    db: &dyn Database,
    invoice_id: Uuid,
) -> Result<InvoiceRecord, BillingError> {
    db.recompute_invoice_total(invoice_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))
}

/// Create an agreement after checking it against the client's existing ones.
/// The store repeats the overlap check under its write lock, so a concurrent
/// insert that slips past this check fails with `Conflict`.
pub async fn add_agreement(
    db: &dyn Database,
    client_id: Uuid,
    input: &CreateAgreementParams,
) -> Result<AgreementRecord, BillingError> {
    let existing = db.list_agreements(client_id).await?;
    ensure_no_overlap(&existing, input)?;
    let created = db.create_agreement(client_id, input).await?;
    tracing::info!(
        client_id = %client_id,
        agreement_id = %created.id,
        active_from = %created.active_from,
        "Agreement created"
    );
    Ok(created)
}

pub async fn terminate_agreement(
    db: &dyn Database,
    agreement_id: Uuid,
    terminated_at: NaiveDate,
) -> Result<AgreementRecord, BillingError> {
    let agreement = db
        .get_agreement(agreement_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("agreement {agreement_id}")))?;
    if let Some(existing) = agreement.terminated_at {
        return Err(BillingError::Conflict(format!(
            "agreement {} already terminated at {}",
            agreement_id, existing
        )));
    }
    if terminated_at <= agreement.active_from {
        return Err(BillingError::Validation(format!(
            "termination date {} must be after the agreement start {}",
            terminated_at, agreement.active_from
        )));
    }
    db.terminate_agreement(agreement_id, terminated_at)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("agreement {agreement_id}")))
}

pub async fn log_time_entry(
    db: &dyn Database,
    client_id: Uuid,
    input: &CreateTimeEntryParams,
) -> Result<TimeEntryRecord, BillingError> {
    if input.minutes_worked <= 0 {
        return Err(BillingError::Validation(format!(
            "minutes worked must be positive, got {}",
            input.minutes_worked
        )));
    }
    if input.user_id.trim().is_empty() {
        return Err(BillingError::Validation("user id is required".to_string()));
    }
    Ok(db.create_time_entry(client_id, input).await?)
}

/// Soft-remove an entry that has not been invoiced.
pub async fn remove_time_entry(db: &dyn Database, entry_id: Uuid) -> Result<(), BillingError> {
    if db.soft_remove_time_entry(entry_id).await? {
        Ok(())
    } else {
        Err(BillingError::NotFound(format!("time entry {entry_id}")))
    }
}
