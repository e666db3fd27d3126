//! Ledger operations CLI
//!
//! Meant to be run by an external scheduler: reconcile a tenant's balance
//! cache against its entry log, or sweep stale reservations. Results are
//! printed as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use balance_ledger::{Config, Ledger, TenantId};
use clap::{Parser, Subcommand};
use prometheus::{Encoder, TextEncoder};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ledger-reconcile")]
#[command(about = "Balance ledger reconciliation and reservation sweeping", long_about = None)]
struct Cli {
    /// TOML config file (LEDGER_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Print Prometheus metrics to stderr when done
    #[arg(long, global = true, default_value_t = false)]
    print_metrics: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find balance drift and optionally correct it
    Reconcile {
        /// Tenant to reconcile
        #[arg(long)]
        tenant: String,

        /// Rewrite drifted cache rows (defaults to reconciliation.auto_fix)
        #[arg(long)]
        auto_fix: bool,
    },

    /// Release ACTIVE reservations older than a threshold
    SweepReservations {
        /// Tenant to sweep
        #[arg(long)]
        tenant: String,

        /// Age in seconds (defaults to reservations.stale_after_secs)
        #[arg(long)]
        older_than_secs: Option<u64>,

        /// Release reason recorded on each reservation
        #[arg(long, default_value = "expired")]
        reason: String,
    },

    /// Print entry, subject and reservation counts
    Stats {
        /// Tenant to inspect
        #[arg(long)]
        tenant: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?
            .with_env_overrides()?,
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_ref())?;
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        database_url = %config.database_url,
        "Starting ledger-reconcile"
    );

    let ledger = Ledger::open(config).await.context("opening ledger")?;

    let code = match cli.cmd {
        Commands::Reconcile { tenant, auto_fix } => {
            let auto_fix = auto_fix || ledger.config().reconciliation.auto_fix;
            let summary = ledger
                .run_scheduled_reconciliation(&TenantId::new(tenant), auto_fix)
                .await?;
            print_json(&summary)?;
            if auto_fix && !summary.unresolved.is_empty() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Commands::SweepReservations {
            tenant,
            older_than_secs,
            reason,
        } => {
            let secs = older_than_secs.unwrap_or(ledger.config().reservations.stale_after_secs);
            let older_than = chrono::Duration::seconds(
                i64::try_from(secs).context("older-than-secs out of range")?,
            );
            let released = ledger
                .release_stale_reservations(&TenantId::new(tenant), older_than, &reason)
                .await?;
            print_json(&released)?;
            ExitCode::SUCCESS
        }
        Commands::Stats { tenant } => {
            let stats = ledger.storage().get_stats(&TenantId::new(tenant)).await?;
            print_json(&serde_json::json!({
                "total_entries": stats.total_entries,
                "voided_entries": stats.voided_entries,
                "total_subjects": stats.total_subjects,
                "active_reservations": stats.active_reservations,
            }))?;
            ExitCode::SUCCESS
        }
    };

    if cli.print_metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&ledger.metrics().registry().gather(), &mut buffer)?;
        eprintln!("{}", String::from_utf8_lossy(&buffer));
    }

    ledger.storage().clone().close().await;
    Ok(code)
}
