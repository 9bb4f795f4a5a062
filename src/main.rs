//! retainer-ledger - retainer balances and invoice generation.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use retainer_ledger::billing::{audit, invoice, period::YearMonth};
use retainer_ledger::config::Config;
use retainer_ledger::db::{self, CreateAgreementParams, CreateTimeEntryParams, Database};
use retainer_ledger::web::{GatewayState, start_server};

/// Retainer balance and time-allocation engine
#[derive(Parser, Debug)]
#[command(name = "retainer-ledger")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway
    Serve,

    /// Month-by-month balances for a client, most recent first
    Balances {
        client: Uuid,
        /// Extend the ledger through this month (YYYY-MM)
        #[arg(long)]
        through: Option<YearMonth>,
    },

    /// Show what an invoice for the period would contain without saving it
    Preview {
        client: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    },

    /// Generate and issue an invoice for the period
    Generate {
        client: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    },

    /// Manage retainer agreements
    #[command(subcommand)]
    Agreement(AgreementCommand),

    /// Manage time entries
    #[command(subcommand)]
    Entry(EntryCommand),

    /// Inspect and settle invoices
    #[command(subcommand)]
    Invoice(InvoiceCommand),
}

#[derive(Subcommand, Debug)]
enum AgreementCommand {
    /// Add an agreement for a client
    Add {
        client: Uuid,
        #[arg(long)]
        active_from: NaiveDate,
        /// Exclusive end date
        #[arg(long)]
        terminated_at: Option<NaiveDate>,
        /// Monthly retainer hours
        #[arg(long)]
        hours: Decimal,
        #[arg(long, default_value_t = 0)]
        rollover_months: u32,
        /// Hourly rate for overage
        #[arg(long)]
        rate: Decimal,
        /// Monthly retainer fee
        #[arg(long)]
        fee: Decimal,
    },
    /// List a client's agreements
    List { client: Uuid },
    /// Set an agreement's end date
    Terminate { agreement: Uuid, date: NaiveDate },
}

#[derive(Subcommand, Debug)]
enum EntryCommand {
    /// Log time for a client
    Add {
        client: Uuid,
        #[arg(long)]
        user: String,
        #[arg(long)]
        minutes: i64,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        non_billable: bool,
    },
    /// List a client's time entries
    List { client: Uuid },
    /// Remove an entry that has not been invoiced
    Remove { entry: Uuid },
}

#[derive(Subcommand, Debug)]
enum InvoiceCommand {
    /// List a client's invoices
    List { client: Uuid },
    /// Show an invoice with its lines and fragments
    Show { invoice: Uuid },
    /// Mark an issued invoice as paid
    Paid { invoice: Uuid },
    /// Void an invoice and release its time entries
    Void { invoice: Uuid },
    /// Reset the invoice total to the sum of its lines
    Recompute { invoice: Uuid },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("retainer_ledger=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    audit::init(&config.billing.audit);

    let store = db::connect_from_config(&config.database)
        .await
        .context("failed to open database")?;
    tracing::debug!(
        backend = config.database.backend.as_str(),
        audit = audit::enabled(),
        "Database ready"
    );

    run(cli.command, &config, store).await
}

async fn run(command: Commands, config: &Config, store: Arc<dyn Database>) -> Result<()> {
    let db = store.as_ref();
    match command {
        Commands::Serve => {
            let Some(token) = config.gateway.auth_token.as_ref() else {
                bail!("GATEWAY_AUTH_TOKEN must be set to serve the API");
            };
            let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
                .parse()
                .context("invalid gateway address")?;
            let state = GatewayState::new(Arc::clone(&store), config.billing.clone());
            start_server(addr, Arc::clone(&state), token.expose_secret().to_string()).await?;

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            if let Some(tx) = state.shutdown_tx.write().await.take() {
                let _ = tx.send(());
            }
        }
        Commands::Balances { client, through } => {
            print_json(&invoice::get_monthly_balances(db, client, through, &config.billing).await?)?;
        }
        Commands::Preview { client, start, end } => {
            print_json(&invoice::preview_invoice(db, client, start, end, &config.billing).await?)?;
        }
        Commands::Generate { client, start, end } => {
            print_json(&invoice::generate_invoice(db, client, start, end, &config.billing).await?)?;
        }
        Commands::Agreement(cmd) => match cmd {
            AgreementCommand::Add {
                client,
                active_from,
                terminated_at,
                hours,
                rollover_months,
                rate,
                fee,
            } => {
                let params = CreateAgreementParams {
                    active_from,
                    terminated_at,
                    monthly_retainer_hours: hours,
                    rollover_months,
                    hourly_rate: rate,
                    monthly_fee: fee,
                };
                print_json(&invoice::add_agreement(db, client, &params).await?)?;
            }
            AgreementCommand::List { client } => print_json(&db.list_agreements(client).await?)?,
            AgreementCommand::Terminate { agreement, date } => {
                print_json(&invoice::terminate_agreement(db, agreement, date).await?)?;
            }
        },
        Commands::Entry(cmd) => match cmd {
            EntryCommand::Add {
                client,
                user,
                minutes,
                date,
                description,
                non_billable,
            } => {
                let params = CreateTimeEntryParams {
                    user_id: user,
                    description,
                    minutes_worked: minutes,
                    date_worked: date,
                    billable: !non_billable,
                };
                print_json(&invoice::log_time_entry(db, client, &params).await?)?;
            }
            EntryCommand::List { client } => print_json(&db.list_time_entries(client).await?)?,
            EntryCommand::Remove { entry } => {
                invoice::remove_time_entry(db, entry).await?;
                print_json(&serde_json::json!({ "removed": entry }))?;
            }
        },
        Commands::Invoice(cmd) => match cmd {
            InvoiceCommand::List { client } => print_json(&db.list_invoices(client).await?)?,
            InvoiceCommand::Show { invoice: id } => {
                print_json(&invoice::get_invoice_detail(db, id).await?)?;
            }
            InvoiceCommand::Paid { invoice: id } => print_json(&invoice::mark_paid(db, id).await?)?,
            InvoiceCommand::Void { invoice: id } => {
                print_json(&invoice::void_invoice(db, id).await?)?;
            }
            InvoiceCommand::Recompute { invoice: id } => {
                print_json(&invoice::recompute_invoice_total(db, id).await?)?;
            }
        },
    }
    Ok(())
}
