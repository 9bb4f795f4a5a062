use chrono::{NaiveDate, Utc};
use libsql::params;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::billing::allocation::AllocationType;
use crate::db::{
    AgreementRecord, AgreementStore, CommitInvoiceParams, CreateAgreementParams,
    CreateTimeEntryParams, FragmentRecord, InvoiceLineRecord, InvoiceLineType, InvoiceRecord,
    InvoiceStatus, InvoiceStore, TimeEntryRecord, TimeEntryStore,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_i64, get_opt_text, get_text, opt_text, parse_date, parse_decimal,
    parse_timestamp, parse_uuid,
};

const AGREEMENT_COLUMNS: &str = "id, client_id, active_from, terminated_at, monthly_retainer_hours, \
     rollover_months, hourly_rate, monthly_fee, created_at, updated_at";

const TIME_ENTRY_COLUMNS: &str = "id, client_id, user_id, description, minutes_worked, date_worked, \
     billable, invoice_line_id, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, client_id, invoice_number, period_start, period_end, status, \
     retainer_hours_included, hours_worked, rollover_hours_used, unused_hours_balance, \
     negative_hours_balance, hours_billed_at_rate, invoice_total, issued_at, created_at, updated_at";

const LINE_COLUMNS: &str =
    "id, invoice_id, line_type, description, hours, unit_price, line_total, sort_order";

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn row_to_agreement(row: &libsql::Row) -> Result<AgreementRecord, DatabaseError> {
    let rollover_months = u32::try_from(get_i64(row, 5))
        .map_err(|_| DatabaseError::Serialization("invalid rollover_months".to_string()))?;
    Ok(AgreementRecord {
        id: parse_uuid(&get_text(row, 0), "agreement.id")?,
        client_id: parse_uuid(&get_text(row, 1), "agreement.client_id")?,
        active_from: parse_date(&get_text(row, 2), "active_from")?,
        terminated_at: get_opt_text(row, 3)
            .map(|raw| parse_date(&raw, "terminated_at"))
            .transpose()?,
        monthly_retainer_hours: parse_decimal(&get_text(row, 4), "monthly_retainer_hours")?,
        rollover_months,
        hourly_rate: parse_decimal(&get_text(row, 6), "hourly_rate")?,
        monthly_fee: parse_decimal(&get_text(row, 7), "monthly_fee")?,
        created_at: parse_timestamp(&get_text(row, 8))?,
        updated_at: parse_timestamp(&get_text(row, 9))?,
    })
}

fn row_to_time_entry(row: &libsql::Row) -> Result<TimeEntryRecord, DatabaseError> {
    Ok(TimeEntryRecord {
        id: parse_uuid(&get_text(row, 0), "time_entry.id")?,
        client_id: parse_uuid(&get_text(row, 1), "time_entry.client_id")?,
        user_id: get_text(row, 2),
        description: get_text(row, 3),
        minutes_worked: get_i64(row, 4),
        date_worked: parse_date(&get_text(row, 5), "date_worked")?,
        billable: get_i64(row, 6) != 0,
        invoice_line_id: get_opt_text(row, 7)
            .map(|raw| parse_uuid(&raw, "time_entry.invoice_line_id"))
            .transpose()?,
        created_at: parse_timestamp(&get_text(row, 8))?,
        updated_at: parse_timestamp(&get_text(row, 9))?,
    })
}

fn row_to_invoice(row: &libsql::Row) -> Result<InvoiceRecord, DatabaseError> {
    let status_raw = get_text(row, 5);
    Ok(InvoiceRecord {
        id: parse_uuid(&get_text(row, 0), "invoice.id")?,
        client_id: parse_uuid(&get_text(row, 1), "invoice.client_id")?,
        invoice_number: get_text(row, 2),
        period_start: parse_date(&get_text(row, 3), "period_start")?,
        period_end: parse_date(&get_text(row, 4), "period_end")?,
        status: InvoiceStatus::from_db_value(&status_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid invoice status '{}'", status_raw))
        })?,
        retainer_hours_included: parse_decimal(&get_text(row, 6), "retainer_hours_included")?,
        hours_worked: parse_decimal(&get_text(row, 7), "hours_worked")?,
        rollover_hours_used: parse_decimal(&get_text(row, 8), "rollover_hours_used")?,
        unused_hours_balance: parse_decimal(&get_text(row, 9), "unused_hours_balance")?,
        negative_hours_balance: parse_decimal(&get_text(row, 10), "negative_hours_balance")?,
        hours_billed_at_rate: parse_decimal(&get_text(row, 11), "hours_billed_at_rate")?,
        invoice_total: parse_decimal(&get_text(row, 12), "invoice_total")?,
        issued_at: get_opt_text(row, 13)
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
        created_at: parse_timestamp(&get_text(row, 14))?,
        updated_at: parse_timestamp(&get_text(row, 15))?,
    })
}

fn row_to_line(row: &libsql::Row) -> Result<InvoiceLineRecord, DatabaseError> {
    let line_type_raw = get_text(row, 2);
    Ok(InvoiceLineRecord {
        id: parse_uuid(&get_text(row, 0), "line.id")?,
        invoice_id: parse_uuid(&get_text(row, 1), "line.invoice_id")?,
        line_type: InvoiceLineType::from_db_value(&line_type_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid line type '{}'", line_type_raw))
        })?,
        description: get_text(row, 3),
        hours: parse_decimal(&get_text(row, 4), "hours")?,
        unit_price: parse_decimal(&get_text(row, 5), "unit_price")?,
        line_total: parse_decimal(&get_text(row, 6), "line_total")?,
        sort_order: i32::try_from(get_i64(row, 7))
            .map_err(|_| DatabaseError::Serialization("invalid sort_order".to_string()))?,
    })
}

fn row_to_fragment(row: &libsql::Row) -> Result<FragmentRecord, DatabaseError> {
    let allocation_raw = get_text(row, 5);
    Ok(FragmentRecord {
        id: parse_uuid(&get_text(row, 0), "fragment.id")?,
        time_entry_id: parse_uuid(&get_text(row, 1), "fragment.time_entry_id")?,
        invoice_line_id: parse_uuid(&get_text(row, 2), "fragment.invoice_line_id")?,
        minutes: get_i64(row, 3),
        date_worked: parse_date(&get_text(row, 4), "fragment.date_worked")?,
        allocation_type: AllocationType::from_db_value(&allocation_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid allocation type '{}'", allocation_raw))
        })?,
    })
}

async fn load_invoice(
    conn: &libsql::Connection,
    invoice_id: &str,
) -> Result<Option<InvoiceRecord>, DatabaseError> {
    let row = conn
        .query(
            &format!("SELECT {INVOICE_COLUMNS} FROM client_invoices WHERE id = ?1 LIMIT 1"),
            params![invoice_id],
        )
        .await?
        .next()
        .await?;
    row.map(|row| row_to_invoice(&row)).transpose()
}

async fn load_lines(
    conn: &libsql::Connection,
    invoice_id: &str,
) -> Result<Vec<InvoiceLineRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {LINE_COLUMNS} FROM client_invoice_lines \
                 WHERE invoice_id = ?1 ORDER BY sort_order ASC"
            ),
            params![invoice_id],
        )
        .await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row_to_line(&row)?);
    }
    Ok(out)
}

#[async_trait::async_trait]
impl AgreementStore for LibSqlBackend {
    async fn create_agreement(
        &self,
        client_id: Uuid,
        input: &CreateAgreementParams,
    ) -> Result<AgreementRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4().to_string();
        let client = client_id.to_string();
        let now = fmt_ts(&Utc::now());
        let active_from = fmt_date(input.active_from);
        let terminated_at = input.terminated_at.map(fmt_date);

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            let mut rows = conn
                .query(
                    "SELECT id, active_from FROM agreements \
                     WHERE client_id = ?1 \
                       AND (terminated_at IS NULL OR ?2 < terminated_at) \
                       AND (?3 IS NULL OR ?3 > active_from) \
                     LIMIT 1",
                    params![
                        client.as_str(),
                        active_from.as_str(),
                        opt_text(terminated_at.as_deref()),
                    ],
                )
                .await?;
            if let Some(row) = rows.next().await? {
                return Err(DatabaseError::Conflict(format!(
                    "agreement starting {} overlaps agreement {} (active from {})",
                    input.active_from,
                    get_text(&row, 0),
                    get_text(&row, 1)
                )));
            }

            conn.execute(
                &format!(
                    "INSERT INTO agreements ({AGREEMENT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)"
                ),
                params![
                    id.as_str(),
                    client.as_str(),
                    active_from.as_str(),
                    opt_text(terminated_at.as_deref()),
                    input.monthly_retainer_hours.to_string(),
                    i64::from(input.rollover_months),
                    input.hourly_rate.to_string(),
                    input.monthly_fee.to_string(),
                    now.as_str(),
                ],
            )
            .await?;

            let row = conn
                .query(
                    &format!("SELECT {AGREEMENT_COLUMNS} FROM agreements WHERE id = ?1 LIMIT 1"),
                    params![id.as_str()],
                )
                .await?
                .next()
                .await?
                .ok_or_else(|| {
                    DatabaseError::Query("failed to load created agreement".to_string())
                })?;
            row_to_agreement(&row)
        }
        .await;

        match result {
            Ok(created) => {
                conn.execute("COMMIT", ()).await?;
                Ok(created)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn list_agreements(&self, client_id: Uuid) -> Result<Vec<AgreementRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {AGREEMENT_COLUMNS} FROM agreements \
                     WHERE client_id = ?1 ORDER BY active_from ASC, created_at ASC"
                ),
                params![client_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_agreement(&row)?);
        }
        Ok(out)
    }

    async fn get_agreement(
        &self,
        agreement_id: Uuid,
    ) -> Result<Option<AgreementRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!("SELECT {AGREEMENT_COLUMNS} FROM agreements WHERE id = ?1 LIMIT 1"),
                params![agreement_id.to_string()],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_agreement(&row)).transpose()
    }

    async fn terminate_agreement(
        &self,
        agreement_id: Uuid,
        terminated_at: NaiveDate,
    ) -> Result<Option<AgreementRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let updated = conn
            .execute(
                "UPDATE agreements SET terminated_at = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND terminated_at IS NULL AND active_from < ?2",
                params![
                    agreement_id.to_string(),
                    fmt_date(terminated_at),
                    fmt_ts(&Utc::now()),
                ],
            )
            .await?;
        if updated == 0 {
            return match self.get_agreement(agreement_id).await? {
                Some(_) => Err(DatabaseError::Conflict(format!(
                    "agreement {} cannot be terminated at {}",
                    agreement_id, terminated_at
                ))),
                None => Ok(None),
            };
        }
        self.get_agreement(agreement_id).await
    }
}

#[async_trait::async_trait]
impl TimeEntryStore for LibSqlBackend {
    async fn create_time_entry(
        &self,
        client_id: Uuid,
        input: &CreateTimeEntryParams,
    ) -> Result<TimeEntryRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4().to_string();
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "INSERT INTO time_entries \
             (id, client_id, user_id, description, minutes_worked, date_worked, billable, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id.as_str(),
                client_id.to_string(),
                input.user_id.trim(),
                input.description.trim(),
                input.minutes_worked,
                fmt_date(input.date_worked),
                i64::from(input.billable),
                now.as_str(),
            ],
        )
        .await?;

        let row = conn
            .query(
                &format!("SELECT {TIME_ENTRY_COLUMNS} FROM time_entries WHERE id = ?1 LIMIT 1"),
                params![id.as_str()],
            )
            .await?
            .next()
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created time entry".to_string()))?;
        row_to_time_entry(&row)
    }

    async fn list_time_entries(
        &self,
        client_id: Uuid,
    ) -> Result<Vec<TimeEntryRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TIME_ENTRY_COLUMNS} FROM time_entries \
                     WHERE client_id = ?1 AND removed_at IS NULL \
                     ORDER BY date_worked ASC, created_at ASC, id ASC"
                ),
                params![client_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_time_entry(&row)?);
        }
        Ok(out)
    }

    async fn get_time_entry(&self, entry_id: Uuid) -> Result<Option<TimeEntryRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!(
                    "SELECT {TIME_ENTRY_COLUMNS} FROM time_entries \
                     WHERE id = ?1 AND removed_at IS NULL LIMIT 1"
                ),
                params![entry_id.to_string()],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_time_entry(&row)).transpose()
    }

    async fn soft_remove_time_entry(&self, entry_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let now = fmt_ts(&Utc::now());
        let updated = conn
            .execute(
                "UPDATE time_entries SET removed_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND removed_at IS NULL AND invoice_line_id IS NULL",
                params![entry_id.to_string(), now.as_str()],
            )
            .await?;
        if updated > 0 {
            return Ok(true);
        }
        match self.get_time_entry(entry_id).await? {
            Some(entry) if entry.invoice_line_id.is_some() => Err(DatabaseError::Conflict(format!(
                "time entry {} is invoiced and cannot be removed",
                entry_id
            ))),
            _ => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl InvoiceStore for LibSqlBackend {
    async fn list_invoices(&self, client_id: Uuid) -> Result<Vec<InvoiceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INVOICE_COLUMNS} FROM client_invoices \
                     WHERE client_id = ?1 ORDER BY period_start DESC, created_at DESC"
                ),
                params![client_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_invoice(&row)?);
        }
        Ok(out)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        load_invoice(&conn, &invoice_id.to_string()).await
    }

    async fn list_invoice_lines(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineRecord>, DatabaseError> {
        let conn = self.connect().await?;
        load_lines(&conn, &invoice_id.to_string()).await
    }

    async fn list_invoice_fragments(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<FragmentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT f.id, f.time_entry_id, f.invoice_line_id, f.minutes, f.date_worked, f.allocation_type \
                 FROM time_entry_fragments f \
                 JOIN client_invoice_lines l ON l.id = f.invoice_line_id \
                 WHERE l.invoice_id = ?1 \
                 ORDER BY l.sort_order ASC, f.date_worked ASC, f.created_at ASC",
                params![invoice_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_fragment(&row)?);
        }
        Ok(out)
    }

    async fn commit_invoice(
        &self,
        input: &CommitInvoiceParams,
    ) -> Result<(InvoiceRecord, Vec<InvoiceLineRecord>), DatabaseError> {
        let conn = self.connect().await?;
        // IMMEDIATE takes the write lock up front so the overlap guard below
        // and the inserts see the same state.
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            let client_id = input.client_id.to_string();
            let overlapping = conn
                .query(
                    "SELECT invoice_number FROM client_invoices \
                     WHERE client_id = ?1 AND status != 'void' \
                       AND period_start <= ?3 AND period_end >= ?2 \
                     LIMIT 1",
                    params![
                        client_id.as_str(),
                        fmt_date(input.period_start),
                        fmt_date(input.period_end),
                    ],
                )
                .await?
                .next()
                .await?;
            if let Some(row) = overlapping {
                return Err(DatabaseError::Conflict(format!(
                    "invoice {} already covers part of {}..={}",
                    get_text(&row, 0),
                    input.period_start,
                    input.period_end
                )));
            }

            let invoice_id = Uuid::new_v4().to_string();
            let now = fmt_ts(&Utc::now());
            conn.execute(
                &format!(
                    "INSERT INTO client_invoices ({INVOICE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 'draft', ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13, ?13)"
                ),
                params![
                    invoice_id.as_str(),
                    client_id.as_str(),
                    input.invoice_number.as_str(),
                    fmt_date(input.period_start),
                    fmt_date(input.period_end),
                    input.retainer_hours_included.to_string(),
                    input.hours_worked.to_string(),
                    input.rollover_hours_used.to_string(),
                    input.unused_hours_balance.to_string(),
                    input.negative_hours_balance.to_string(),
                    input.hours_billed_at_rate.to_string(),
                    input.invoice_total.to_string(),
                    now.as_str(),
                ],
            )
            .await?;

            let mut line_ids = Vec::with_capacity(input.lines.len());
            for line in &input.lines {
                let line_id = Uuid::new_v4().to_string();
                conn.execute(
                    &format!(
                        "INSERT INTO client_invoice_lines ({LINE_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                    ),
                    params![
                        line_id.as_str(),
                        invoice_id.as_str(),
                        line.line_type.as_str(),
                        line.description.as_str(),
                        line.hours.to_string(),
                        line.unit_price.to_string(),
                        line.line_total.to_string(),
                        i64::from(line.sort_order),
                    ],
                )
                .await?;
                for fragment in &line.fragments {
                    conn.execute(
                        "INSERT INTO time_entry_fragments \
                         (id, time_entry_id, invoice_line_id, minutes, date_worked, allocation_type, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            Uuid::new_v4().to_string(),
                            fragment.time_entry_id.to_string(),
                            line_id.as_str(),
                            fragment.minutes,
                            fmt_date(fragment.date_worked),
                            fragment.allocation_type.as_str(),
                            now.as_str(),
                        ],
                    )
                    .await?;
                }
                line_ids.push(line_id);
            }

            for (entry_id, line_idx) in input.entry_links() {
                let line_id = line_ids.get(line_idx).ok_or_else(|| {
                    DatabaseError::Query(format!("fragment references missing line {line_idx}"))
                })?;
                let linked = conn
                    .execute(
                        "UPDATE time_entries SET invoice_line_id = ?2, updated_at = ?4 \
                         WHERE id = ?1 AND client_id = ?3 \
                           AND invoice_line_id IS NULL AND removed_at IS NULL",
                        params![
                            entry_id.to_string(),
                            line_id.as_str(),
                            client_id.as_str(),
                            now.as_str(),
                        ],
                    )
                    .await?;
                if linked != 1 {
                    return Err(DatabaseError::Conflict(format!(
                        "time entry {} is already invoiced or no longer exists",
                        entry_id
                    )));
                }
            }

            conn.execute(
                "UPDATE client_invoices SET status = 'issued', issued_at = ?2, updated_at = ?2 \
                 WHERE id = ?1",
                params![invoice_id.as_str(), now.as_str()],
            )
            .await?;

            let invoice = load_invoice(&conn, &invoice_id)
                .await?
                .ok_or_else(|| DatabaseError::Query("failed to load created invoice".to_string()))?;
            let lines = load_lines(&conn, &invoice_id).await?;
            Ok((invoice, lines))
        }
        .await;

        match result {
            Ok(committed) => {
                conn.execute("COMMIT", ()).await?;
                Ok(committed)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn set_invoice_status(
        &self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            let id = invoice_id.to_string();
            let Some(current) = load_invoice(&conn, &id).await? else {
                return Ok(None);
            };
            if !current.status.can_transition_to(status) {
                return Err(DatabaseError::Conflict(format!(
                    "invoice {} cannot move from '{}' to '{}'",
                    current.invoice_number,
                    current.status.as_str(),
                    status.as_str()
                )));
            }

            let now = fmt_ts(&Utc::now());
            if status == InvoiceStatus::Void {
                conn.execute(
                    "UPDATE time_entries SET invoice_line_id = NULL, updated_at = ?2 \
                     WHERE invoice_line_id IN \
                       (SELECT id FROM client_invoice_lines WHERE invoice_id = ?1)",
                    params![id.as_str(), now.as_str()],
                )
                .await?;
            }
            let issued_at = if status == InvoiceStatus::Issued {
                Some(now.clone())
            } else {
                None
            };
            conn.execute(
                "UPDATE client_invoices \
                 SET status = ?2, issued_at = COALESCE(?3, issued_at), updated_at = ?4 \
                 WHERE id = ?1",
                params![
                    id.as_str(),
                    status.as_str(),
                    opt_text(issued_at.as_deref()),
                    now.as_str(),
                ],
            )
            .await?;
            load_invoice(&conn, &id).await
        }
        .await;

        match result {
            Ok(updated) => {
                conn.execute("COMMIT", ()).await?;
                Ok(updated)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn recompute_invoice_total(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            let id = invoice_id.to_string();
            if load_invoice(&conn, &id).await?.is_none() {
                return Ok(None);
            }
            let total: Decimal = load_lines(&conn, &id)
                .await?
                .iter()
                .map(|line| line.line_total)
                .sum();
            conn.execute(
                "UPDATE client_invoices SET invoice_total = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_str(), total.to_string(), fmt_ts(&Utc::now())],
            )
            .await?;
            load_invoice(&conn, &id).await
        }
        .await;

        match result {
            Ok(updated) => {
                conn.execute("COMMIT", ()).await?;
                Ok(updated)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use crate::billing::allocation::AllocationType;
    use crate::db::{
        CommitFragmentParams, CommitInvoiceLineParams, CommitInvoiceParams, InvoiceLineType,
        InvoiceStatus,
    };
    use crate::error::DatabaseError;
    use crate::testing::{agreement_params, date, entry_params, test_db};

    fn commit_for(
        client_id: Uuid,
        number: &str,
        entry_id: Uuid,
        minutes: i64,
    ) -> CommitInvoiceParams {
        CommitInvoiceParams {
            client_id,
            invoice_number: number.to_string(),
            period_start: date(2026, 1, 1),
            period_end: date(2026, 1, 31),
            retainer_hours_included: dec!(10),
            hours_worked: Decimal::from(minutes) / dec!(60),
            rollover_hours_used: Decimal::ZERO,
            unused_hours_balance: dec!(9),
            negative_hours_balance: Decimal::ZERO,
            hours_billed_at_rate: Decimal::ZERO,
            invoice_total: dec!(1200),
            lines: vec![
                CommitInvoiceLineParams {
                    line_type: InvoiceLineType::RetainerFee,
                    description: "Monthly retainer".to_string(),
                    hours: Decimal::ONE,
                    unit_price: dec!(1200),
                    line_total: dec!(1200),
                    sort_order: 0,
                    fragments: Vec::new(),
                },
                CommitInvoiceLineParams {
                    line_type: InvoiceLineType::CurrentMonthRetainer,
                    description: "Retainer hours".to_string(),
                    hours: Decimal::from(minutes) / dec!(60),
                    unit_price: Decimal::ZERO,
                    line_total: Decimal::ZERO,
                    sort_order: 1,
                    fragments: vec![CommitFragmentParams {
                        time_entry_id: entry_id,
                        minutes,
                        date_worked: date(2026, 1, 5),
                        allocation_type: AllocationType::CurrentMonthRetainer,
                    }],
                },
            ],
        }
    }

    #[tokio::test]
    async fn agreement_round_trips_decimals_and_dates() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let mut params = agreement_params(date(2026, 1, 1), Some(date(2026, 7, 1)), dec!(12.5), 2);
        params.hourly_rate = dec!(162.75);

        let created = db.create_agreement(client, &params).await.expect("create");
        assert_eq!(created.monthly_retainer_hours, dec!(12.5));
        assert_eq!(created.hourly_rate, dec!(162.75));
        assert_eq!(created.terminated_at, Some(date(2026, 7, 1)));

        let listed = db.list_agreements(client).await.expect("list");
        assert_eq!(listed, vec![created]);
    }

    #[tokio::test]
    async fn overlapping_agreement_insert_is_rejected() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let first = db
            .create_agreement(
                client,
                &agreement_params(date(2026, 1, 1), Some(date(2026, 4, 1)), dec!(10), 1),
            )
            .await
            .expect("first");

        let err = db
            .create_agreement(client, &agreement_params(date(2026, 3, 15), None, dec!(5), 0))
            .await
            .expect_err("overlap");
        assert!(matches!(err, DatabaseError::Conflict(_)), "got {err:?}");

        // Starting on the exclusive end date is fine, as is another client.
        db.create_agreement(client, &agreement_params(date(2026, 4, 1), None, dec!(5), 0))
            .await
            .expect("adjacent");
        db.create_agreement(
            Uuid::new_v4(),
            &agreement_params(date(2026, 2, 1), None, dec!(5), 0),
        )
        .await
        .expect("other client");

        let listed = db.list_agreements(client).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
    }

    #[tokio::test]
    async fn concurrent_agreement_inserts_keep_one() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let params = agreement_params(date(2026, 1, 1), None, dec!(10), 1);

        let (a, b) = tokio::join!(
            db.create_agreement(client, &params),
            db.create_agreement(client, &params)
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(db.list_agreements(client).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn terminate_only_once() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let created = db
            .create_agreement(client, &agreement_params(date(2026, 1, 1), None, dec!(10), 1))
            .await
            .expect("create");

        let terminated = db
            .terminate_agreement(created.id, date(2026, 4, 1))
            .await
            .expect("terminate")
            .expect("exists");
        assert_eq!(terminated.terminated_at, Some(date(2026, 4, 1)));

        let again = db.terminate_agreement(created.id, date(2026, 3, 1)).await;
        assert!(matches!(again, Err(DatabaseError::Conflict(_))));
        assert!(
            db.terminate_agreement(Uuid::new_v4(), date(2026, 3, 1))
                .await
                .expect("missing")
                .is_none()
        );
    }

    #[tokio::test]
    async fn commit_links_entries_and_issues_invoice() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let entry = db
            .create_time_entry(client, &entry_params(date(2026, 1, 5), 60))
            .await
            .expect("entry");

        let (invoice, lines) = db
            .commit_invoice(&commit_for(client, "RL-1", entry.id, 60))
            .await
            .expect("commit");
        assert_eq!(invoice.status, InvoiceStatus::Issued);
        assert!(invoice.issued_at.is_some());
        assert_eq!(lines.len(), 2);

        let linked = db.get_time_entry(entry.id).await.expect("get").expect("entry");
        assert_eq!(linked.invoice_line_id, Some(lines[1].id));

        let fragments = db.list_invoice_fragments(invoice.id).await.expect("fragments");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].minutes, 60);
        assert_eq!(fragments[0].invoice_line_id, lines[1].id);
    }

    #[tokio::test]
    async fn overlapping_commit_is_rejected_and_rolled_back() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let first = db
            .create_time_entry(client, &entry_params(date(2026, 1, 5), 60))
            .await
            .expect("entry");
        let second = db
            .create_time_entry(client, &entry_params(date(2026, 1, 6), 30))
            .await
            .expect("entry");

        db.commit_invoice(&commit_for(client, "RL-1", first.id, 60))
            .await
            .expect("first commit");
        let err = db
            .commit_invoice(&commit_for(client, "RL-2", second.id, 30))
            .await
            .expect_err("overlap");
        assert!(matches!(err, DatabaseError::Conflict(_)));

        assert_eq!(db.list_invoices(client).await.expect("list").len(), 1);
        let untouched = db.get_time_entry(second.id).await.expect("get").expect("entry");
        assert!(untouched.invoice_line_id.is_none());
    }

    #[tokio::test]
    async fn already_linked_entry_aborts_commit() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let entry = db
            .create_time_entry(client, &entry_params(date(2026, 1, 5), 60))
            .await
            .expect("entry");
        let (invoice, _) = db
            .commit_invoice(&commit_for(client, "RL-1", entry.id, 60))
            .await
            .expect("commit");
        db.set_invoice_status(invoice.id, InvoiceStatus::Paid)
            .await
            .expect("paid");

        // Different period, same entry.
        let mut again = commit_for(client, "RL-2", entry.id, 60);
        again.period_start = date(2026, 2, 1);
        again.period_end = date(2026, 2, 28);
        let err = db.commit_invoice(&again).await.expect_err("linked entry");
        assert!(matches!(err, DatabaseError::Conflict(_)));
        assert_eq!(db.list_invoices(client).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn void_releases_entries() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let entry = db
            .create_time_entry(client, &entry_params(date(2026, 1, 5), 60))
            .await
            .expect("entry");
        let (invoice, _) = db
            .commit_invoice(&commit_for(client, "RL-1", entry.id, 60))
            .await
            .expect("commit");

        let voided = db
            .set_invoice_status(invoice.id, InvoiceStatus::Void)
            .await
            .expect("void")
            .expect("exists");
        assert_eq!(voided.status, InvoiceStatus::Void);
        let released = db.get_time_entry(entry.id).await.expect("get").expect("entry");
        assert!(released.invoice_line_id.is_none());

        let err = db.set_invoice_status(invoice.id, InvoiceStatus::Paid).await;
        assert!(matches!(err, Err(DatabaseError::Conflict(_))));

        db.commit_invoice(&commit_for(client, "RL-2", entry.id, 60))
            .await
            .expect("period is free again");
    }

    #[tokio::test]
    async fn invoiced_entries_cannot_be_removed() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let invoiced = db
            .create_time_entry(client, &entry_params(date(2026, 1, 5), 60))
            .await
            .expect("entry");
        let loose = db
            .create_time_entry(client, &entry_params(date(2026, 2, 5), 15))
            .await
            .expect("entry");
        db.commit_invoice(&commit_for(client, "RL-1", invoiced.id, 60))
            .await
            .expect("commit");

        let err = db.soft_remove_time_entry(invoiced.id).await;
        assert!(matches!(err, Err(DatabaseError::Conflict(_))));

        assert!(db.soft_remove_time_entry(loose.id).await.expect("remove"));
        let remaining = db.list_time_entries(client).await.expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, invoiced.id);
        assert!(!db.soft_remove_time_entry(loose.id).await.expect("second remove"));
    }

    #[tokio::test]
    async fn recompute_resets_total_to_line_sum() {
        let (db, _dir) = test_db().await;
        let client = Uuid::new_v4();
        let entry = db
            .create_time_entry(client, &entry_params(date(2026, 1, 5), 60))
            .await
            .expect("entry");
        let mut params = commit_for(client, "RL-1", entry.id, 60);
        params.invoice_total = dec!(1);
        let (invoice, _) = db.commit_invoice(&params).await.expect("commit");
        assert_eq!(invoice.invoice_total, dec!(1));

        let fixed = db
            .recompute_invoice_total(invoice.id)
            .await
            .expect("recompute")
            .expect("exists");
        assert_eq!(fixed.invoice_total, dec!(1200));
    }
}
