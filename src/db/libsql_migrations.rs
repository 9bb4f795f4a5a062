//! Embedded libSQL schema. Idempotent; applied on every startup.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agreements (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    active_from TEXT NOT NULL,
    terminated_at TEXT,
    monthly_retainer_hours TEXT NOT NULL,
    rollover_months INTEGER NOT NULL CHECK (rollover_months >= 0),
    hourly_rate TEXT NOT NULL,
    monthly_fee TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agreements_client ON agreements (client_id, active_from);

CREATE TABLE IF NOT EXISTS client_invoices (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    invoice_number TEXT NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('draft', 'issued', 'paid', 'void')),
    retainer_hours_included TEXT NOT NULL,
    hours_worked TEXT NOT NULL,
    rollover_hours_used TEXT NOT NULL,
    unused_hours_balance TEXT NOT NULL,
    negative_hours_balance TEXT NOT NULL,
    hours_billed_at_rate TEXT NOT NULL,
    invoice_total TEXT NOT NULL,
    issued_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_client_invoices_client
    ON client_invoices (client_id, period_start);

CREATE TABLE IF NOT EXISTS client_invoice_lines (
    id TEXT PRIMARY KEY,
    invoice_id TEXT NOT NULL REFERENCES client_invoices (id),
    line_type TEXT NOT NULL,
    description TEXT NOT NULL,
    hours TEXT NOT NULL,
    unit_price TEXT NOT NULL,
    line_total TEXT NOT NULL,
    sort_order INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_client_invoice_lines_invoice
    ON client_invoice_lines (invoice_id, sort_order);

CREATE TABLE IF NOT EXISTS time_entries (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    description TEXT NOT NULL,
    minutes_worked INTEGER NOT NULL CHECK (minutes_worked > 0),
    date_worked TEXT NOT NULL,
    billable INTEGER NOT NULL DEFAULT 1,
    invoice_line_id TEXT REFERENCES client_invoice_lines (id),
    removed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_time_entries_client ON time_entries (client_id, date_worked);
CREATE INDEX IF NOT EXISTS idx_time_entries_line ON time_entries (invoice_line_id);

CREATE TABLE IF NOT EXISTS time_entry_fragments (
    id TEXT PRIMARY KEY,
    time_entry_id TEXT NOT NULL REFERENCES time_entries (id),
    invoice_line_id TEXT NOT NULL REFERENCES client_invoice_lines (id),
    minutes INTEGER NOT NULL CHECK (minutes > 0),
    date_worked TEXT NOT NULL,
    allocation_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_time_entry_fragments_line ON time_entry_fragments (invoice_line_id);
"#;
