//! PostgreSQL backend for the Database trait.
//!
//! Money and hours live in NUMERIC columns and map straight onto
//! `rust_decimal::Decimal`; dates are DATE and map onto `NaiveDate`.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use deadpool_postgres::{
    Config as PoolSettings, GenericClient, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use secrecy::ExposeSecret;
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::billing::allocation::AllocationType;
use crate::config::DatabaseConfig;
use crate::db::{
    AgreementRecord, AgreementStore, CommitInvoiceParams, CreateAgreementParams,
    CreateTimeEntryParams, Database, FragmentRecord, InvoiceLineRecord, InvoiceLineType,
    InvoiceRecord, InvoiceStatus, InvoiceStore, TimeEntryRecord, TimeEntryStore,
};
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const AGREEMENT_COLUMNS: &str = "id, client_id, active_from, terminated_at, monthly_retainer_hours, \
     rollover_months, hourly_rate, monthly_fee, created_at, updated_at";

const TIME_ENTRY_COLUMNS: &str = "id, client_id, user_id, description, minutes_worked, date_worked, \
     billable, invoice_line_id, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, client_id, invoice_number, period_start, period_end, status, \
     retainer_hours_included, hours_worked, rollover_hours_used, unused_hours_balance, \
     negative_hours_balance, hours_billed_at_rate, invoice_total, issued_at, created_at, updated_at";

const LINE_COLUMNS: &str =
    "id, invoice_id, line_type, description, hours, unit_price, line_total, sort_order";

/// PostgreSQL database backend.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Create a new PostgreSQL backend from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| DatabaseError::Pool("DATABASE_URL is not set".to_string()))?;

        let mut settings = PoolSettings::new();
        settings.url = Some(url.expose_secret().to_string());
        settings.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        settings.pool = Some(PoolConfig::new(config.pool_size.max(1)));

        let pool = settings
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(format!("failed to create pool: {}", e)))?;

        // Fail fast on bad credentials instead of on the first request.
        let _ = pool.get().await?;
        tracing::debug!("Connected to PostgreSQL (pool size {})", config.pool_size);
        Ok(Self { pool })
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

/// Serializes invoice commits and agreement inserts per client for the life
/// of the transaction.
fn client_lock_key(client_id: Uuid) -> i64 {
    let (high, low) = client_id.as_u64_pair();
    (high ^ low) as i64
}

fn row_to_agreement(row: &tokio_postgres::Row) -> Result<AgreementRecord, DatabaseError> {
    let rollover_months: i32 = row.get("rollover_months");
    Ok(AgreementRecord {
        id: row.get("id"),
        client_id: row.get("client_id"),
        active_from: row.get("active_from"),
        terminated_at: row.get("terminated_at"),
        monthly_retainer_hours: row.get("monthly_retainer_hours"),
        rollover_months: u32::try_from(rollover_months)
            .map_err(|_| DatabaseError::Serialization("invalid rollover_months".to_string()))?,
        hourly_rate: row.get("hourly_rate"),
        monthly_fee: row.get("monthly_fee"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_time_entry(row: &tokio_postgres::Row) -> TimeEntryRecord {
    TimeEntryRecord {
        id: row.get("id"),
        client_id: row.get("client_id"),
        user_id: row.get("user_id"),
        description: row.get("description"),
        minutes_worked: row.get("minutes_worked"),
        date_worked: row.get("date_worked"),
        billable: row.get("billable"),
        invoice_line_id: row.get("invoice_line_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_invoice(row: &tokio_postgres::Row) -> Result<InvoiceRecord, DatabaseError> {
    let status_raw: String = row.get("status");
    Ok(InvoiceRecord {
        id: row.get("id"),
        client_id: row.get("client_id"),
        invoice_number: row.get("invoice_number"),
        period_start: row.get("period_start"),
        period_end: row.get("period_end"),
        status: InvoiceStatus::from_db_value(&status_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid invoice status '{}'", status_raw))
        })?,
        retainer_hours_included: row.get("retainer_hours_included"),
        hours_worked: row.get("hours_worked"),
        rollover_hours_used: row.get("rollover_hours_used"),
        unused_hours_balance: row.get("unused_hours_balance"),
        negative_hours_balance: row.get("negative_hours_balance"),
        hours_billed_at_rate: row.get("hours_billed_at_rate"),
        invoice_total: row.get("invoice_total"),
        issued_at: row.get("issued_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_line(row: &tokio_postgres::Row) -> Result<InvoiceLineRecord, DatabaseError> {
    let line_type_raw: String = row.get("line_type");
    Ok(InvoiceLineRecord {
        id: row.get("id"),
        invoice_id: row.get("invoice_id"),
        line_type: InvoiceLineType::from_db_value(&line_type_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid line type '{}'", line_type_raw))
        })?,
        description: row.get("description"),
        hours: row.get("hours"),
        unit_price: row.get("unit_price"),
        line_total: row.get("line_total"),
        sort_order: row.get("sort_order"),
    })
}

fn row_to_fragment(row: &tokio_postgres::Row) -> Result<FragmentRecord, DatabaseError> {
    let allocation_raw: String = row.get("allocation_type");
    Ok(FragmentRecord {
        id: row.get("id"),
        time_entry_id: row.get("time_entry_id"),
        invoice_line_id: row.get("invoice_line_id"),
        minutes: row.get("minutes"),
        date_worked: row.get("date_worked"),
        allocation_type: AllocationType::from_db_value(&allocation_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid allocation type '{}'", allocation_raw))
        })?,
    })
}

async fn load_invoice<C: GenericClient + Sync>(
    client: &C,
    invoice_id: Uuid,
) -> Result<Option<InvoiceRecord>, DatabaseError> {
    let row = client
        .query_opt(
            &*format!("SELECT {INVOICE_COLUMNS} FROM client_invoices WHERE id = $1"),
            &[&invoice_id],
        )
        .await?;
    row.as_ref().map(row_to_invoice).transpose()
}

async fn load_lines<C: GenericClient + Sync>(
    client: &C,
    invoice_id: Uuid,
) -> Result<Vec<InvoiceLineRecord>, DatabaseError> {
    let rows = client
        .query(
            &*format!(
                "SELECT {LINE_COLUMNS} FROM client_invoice_lines \
                 WHERE invoice_id = $1 ORDER BY sort_order ASC"
            ),
            &[&invoice_id],
        )
        .await?;
    rows.iter().map(row_to_line).collect()
}

#[async_trait]
impl AgreementStore for PgBackend {
    async fn create_agreement(
        &self,
        client_id: Uuid,
        input: &CreateAgreementParams,
    ) -> Result<AgreementRecord, DatabaseError> {
        let mut conn = self.conn().await?;
        let rollover_months = i32::try_from(input.rollover_months)
            .map_err(|_| DatabaseError::Serialization("rollover_months out of range".to_string()))?;
        let tx = conn.transaction().await?;

        tx.execute(
            "SELECT pg_advisory_xact_lock($1)",
            &[&client_lock_key(client_id)],
        )
        .await?;

        let overlapping = tx
            .query_opt(
                "SELECT id, active_from FROM agreements \
                 WHERE client_id = $1 \
                   AND (terminated_at IS NULL OR $2::date < terminated_at) \
                   AND ($3::date IS NULL OR $3::date > active_from) \
                 LIMIT 1",
                &[&client_id, &input.active_from, &input.terminated_at],
            )
            .await?;
        if let Some(row) = overlapping {
            let existing: Uuid = row.get("id");
            let existing_from: NaiveDate = row.get("active_from");
            return Err(DatabaseError::Conflict(format!(
                "agreement starting {} overlaps agreement {} (active from {})",
                input.active_from, existing, existing_from
            )));
        }

        let row = tx
            .query_one(
                &*format!(
                    "INSERT INTO agreements \
                     (id, client_id, active_from, terminated_at, monthly_retainer_hours, \
                      rollover_months, hourly_rate, monthly_fee) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     RETURNING {AGREEMENT_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &client_id,
                    &input.active_from,
                    &input.terminated_at,
                    &input.monthly_retainer_hours,
                    &rollover_months,
                    &input.hourly_rate,
                    &input.monthly_fee,
                ],
            )
            .await?;
        let created = row_to_agreement(&row)?;
        tx.commit().await?;
        Ok(created)
    }

    async fn list_agreements(&self, client_id: Uuid) -> Result<Vec<AgreementRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &*format!(
                    "SELECT {AGREEMENT_COLUMNS} FROM agreements \
                     WHERE client_id = $1 ORDER BY active_from ASC, created_at ASC"
                ),
                &[&client_id],
            )
            .await?;
        rows.iter().map(row_to_agreement).collect()
    }

    async fn get_agreement(
        &self,
        agreement_id: Uuid,
    ) -> Result<Option<AgreementRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &*format!("SELECT {AGREEMENT_COLUMNS} FROM agreements WHERE id = $1"),
                &[&agreement_id],
            )
            .await?;
        row.as_ref().map(row_to_agreement).transpose()
    }

    async fn terminate_agreement(
        &self,
        agreement_id: Uuid,
        terminated_at: NaiveDate,
    ) -> Result<Option<AgreementRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &*format!(
                    "UPDATE agreements SET terminated_at = $2, updated_at = NOW() \
                     WHERE id = $1 AND terminated_at IS NULL AND active_from < $2 \
                     RETURNING {AGREEMENT_COLUMNS}"
                ),
                &[&agreement_id, &terminated_at],
            )
            .await?;
        if let Some(row) = row {
            return row_to_agreement(&row).map(Some);
        }
        match self.get_agreement(agreement_id).await? {
            Some(_) => Err(DatabaseError::Conflict(format!(
                "agreement {} cannot be terminated at {}",
                agreement_id, terminated_at
            ))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TimeEntryStore for PgBackend {
    async fn create_time_entry(
        &self,
        client_id: Uuid,
        input: &CreateTimeEntryParams,
    ) -> Result<TimeEntryRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &*format!(
                    "INSERT INTO time_entries \
                     (id, client_id, user_id, description, minutes_worked, date_worked, billable) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     RETURNING {TIME_ENTRY_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &client_id,
                    &input.user_id.trim(),
                    &input.description.trim(),
                    &input.minutes_worked,
                    &input.date_worked,
                    &input.billable,
                ],
            )
            .await?;
        Ok(row_to_time_entry(&row))
    }

    async fn list_time_entries(
        &self,
        client_id: Uuid,
    ) -> Result<Vec<TimeEntryRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &*format!(
                    "SELECT {TIME_ENTRY_COLUMNS} FROM time_entries \
                     WHERE client_id = $1 AND removed_at IS NULL \
                     ORDER BY date_worked ASC, created_at ASC, id ASC"
                ),
                &[&client_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_time_entry).collect())
    }

    async fn get_time_entry(&self, entry_id: Uuid) -> Result<Option<TimeEntryRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &*format!(
                    "SELECT {TIME_ENTRY_COLUMNS} FROM time_entries \
                     WHERE id = $1 AND removed_at IS NULL"
                ),
                &[&entry_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_time_entry))
    }

    async fn soft_remove_time_entry(&self, entry_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE time_entries SET removed_at = NOW(), updated_at = NOW() \
                 WHERE id = $1 AND removed_at IS NULL AND invoice_line_id IS NULL",
                &[&entry_id],
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

#[async_trait]
impl InvoiceStore for PgBackend {
    async fn list_invoices(&self, client_id: Uuid) -> Result<Vec<InvoiceRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &*format!(
                    "SELECT {INVOICE_COLUMNS} FROM client_invoices \
                     WHERE client_id = $1 ORDER BY period_start DESC, created_at DESC"
                ),
                &[&client_id],
            )
            .await?;
        rows.iter().map(row_to_invoice).collect()
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.conn().await?;
        load_invoice(&conn, invoice_id).await
    }

    async fn list_invoice_lines(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineRecord>, DatabaseError> {
        let conn = self.conn().await?;
        load_lines(&conn, invoice_id).await
    }

    async fn list_invoice_fragments(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<FragmentRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT f.id, f.time_entry_id, f.invoice_line_id, f.minutes, f.date_worked, f.allocation_type \
                 FROM time_entry_fragments f \
                 JOIN client_invoice_lines l ON l.id = f.invoice_line_id \
                 WHERE l.invoice_id = $1 \
                 ORDER BY l.sort_order ASC, f.date_worked ASC, f.created_at ASC",
                &[&invoice_id],
            )
            .await?;
        rows.iter().map(row_to_fragment).collect()
    }

    async fn commit_invoice(
        &self,
        input: &CommitInvoiceParams,
    ) -> Result<(InvoiceRecord, Vec<InvoiceLineRecord>), DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            "SELECT pg_advisory_xact_lock($1)",
            &[&client_lock_key(input.client_id)],
        )
        .await?;

        let overlapping = tx
            .query_opt(
                "SELECT invoice_number FROM client_invoices \
                 WHERE client_id = $1 AND status <> 'void' \
                   AND period_start <= $3 AND period_end >= $2 \
                 LIMIT 1",
                &[&input.client_id, &input.period_start, &input.period_end],
            )
            .await?;
        if let Some(row) = overlapping {
            let number: String = row.get(0);
            return Err(DatabaseError::Conflict(format!(
                "invoice {} already covers part of {}..={}",
                number, input.period_start, input.period_end
            )));
        }

        let invoice_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO client_invoices \
             (id, client_id, invoice_number, period_start, period_end, status, \
              retainer_hours_included, hours_worked, rollover_hours_used, unused_hours_balance, \
              negative_hours_balance, hours_billed_at_rate, invoice_total) \
             VALUES ($1, $2, $3, $4, $5, 'draft', $6, $7, $8, $9, $10, $11, $12)",
            &[
                &invoice_id,
                &input.client_id,
                &input.invoice_number,
                &input.period_start,
                &input.period_end,
                &input.retainer_hours_included,
                &input.hours_worked,
                &input.rollover_hours_used,
                &input.unused_hours_balance,
                &input.negative_hours_balance,
                &input.hours_billed_at_rate,
                &input.invoice_total,
            ],
        )
        .await?;

        let mut line_ids = Vec::with_capacity(input.lines.len());
        for line in &input.lines {
            let line_id = Uuid::new_v4();
            tx.execute(
                &*format!(
                    "INSERT INTO client_invoice_lines ({LINE_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
                ),
                &[
                    &line_id,
                    &invoice_id,
                    &line.line_type.as_str(),
                    &line.description,
                    &line.hours,
                    &line.unit_price,
                    &line.line_total,
                    &line.sort_order,
                ],
            )
            .await?;
            for fragment in &line.fragments {
                tx.execute(
                    "INSERT INTO time_entry_fragments \
                     (id, time_entry_id, invoice_line_id, minutes, date_worked, allocation_type) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                    &[
                        &Uuid::new_v4(),
                        &fragment.time_entry_id,
                        &line_id,
                        &fragment.minutes,
                        &fragment.date_worked,
                        &fragment.allocation_type.as_str(),
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
            let linked = tx
                .execute(
                    "UPDATE time_entries SET invoice_line_id = $2, updated_at = NOW() \
                     WHERE id = $1 AND client_id = $3 \
                       AND invoice_line_id IS NULL AND removed_at IS NULL",
                    &[&entry_id, line_id, &input.client_id],
                )
                .await?;
            if linked != 1 {
                return Err(DatabaseError::Conflict(format!(
                    "time entry {} is already invoiced or no longer exists",
                    entry_id
                )));
            }
        }

        tx.execute(
            "UPDATE client_invoices SET status = 'issued', issued_at = $2, updated_at = $2 \
             WHERE id = $1",
            &[&invoice_id, &Utc::now()],
        )
        .await?;

        let invoice = load_invoice(&tx, invoice_id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created invoice".to_string()))?;
        let lines = load_lines(&tx, invoice_id).await?;
        tx.commit().await?;
        Ok((invoice, lines))
    }

    async fn set_invoice_status(
        &self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let Some(row) = tx
            .query_opt(
                &*format!("SELECT {INVOICE_COLUMNS} FROM client_invoices WHERE id = $1 FOR UPDATE"),
                &[&invoice_id],
            )
            .await?
        else {
            return Ok(None);
        };
        let current = row_to_invoice(&row)?;
        if !current.status.can_transition_to(status) {
            return Err(DatabaseError::Conflict(format!(
                "invoice {} cannot move from '{}' to '{}'",
                current.invoice_number,
                current.status.as_str(),
                status.as_str()
            )));
        }

        if status == InvoiceStatus::Void {
            tx.execute(
                "UPDATE time_entries SET invoice_line_id = NULL, updated_at = NOW() \
                 WHERE invoice_line_id IN \
                   (SELECT id FROM client_invoice_lines WHERE invoice_id = $1)",
                &[&invoice_id],
            )
            .await?;
        }
        let issued_at = (status == InvoiceStatus::Issued).then(Utc::now);
        tx.execute(
            "UPDATE client_invoices \
             SET status = $2, issued_at = COALESCE($3, issued_at), updated_at = NOW() \
             WHERE id = $1",
            &[&invoice_id, &status.as_str(), &issued_at],
        )
        .await?;

        let updated = load_invoice(&tx, invoice_id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn recompute_invoice_total(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE client_invoices SET \
                invoice_total = COALESCE( \
                    (SELECT SUM(line_total) FROM client_invoice_lines WHERE invoice_id = $1), 0), \
                updated_at = NOW() \
             WHERE id = $1",
            &[&invoice_id],
        )
        .await?;
        load_invoice(&conn, invoice_id).await
    }
}

#[async_trait]
impl Database for PgBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }
}
