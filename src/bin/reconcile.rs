//! Consistency reconciliation CLI
//!
//! ```bash
//! reconcile check --category ratings --category ledger --output report.json
//! reconcile fix --dry-run
//! reconcile fix --apply
//! ```
//!
//! Exits with code 1 when the report still has unresolved issues.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use escrow_settlement::bootstrap::initialize_database;
use escrow_settlement::ledger::PgLedgerRepository;
use escrow_settlement::reconcile::{
    CheckFilter, ConsistencyReconciler, FixMode, IssueCategory, ReconcileReport, Severity,
};

/// Escrow settlement consistency reconciler
#[derive(Parser)]
#[command(name = "reconcile")]
#[command(version)]
#[command(about = "Detect and repair drift between cached aggregates, references and the payment ledger", long_about = None)]
struct Cli {
    /// Postgres URL (defaults to DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report issues without changing anything
    Check {
        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Limit the check to these categories (repeatable)
        #[arg(long = "category", value_enum)]
        categories: Vec<IssueCategory>,
    },

    /// Apply auto-fixable corrections
    Fix {
        /// Show what would change (default)
        #[arg(long, conflicts_with = "apply")]
        dry_run: bool,

        /// Write the corrections
        #[arg(long)]
        apply: bool,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,escrow_settlement=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let database_url = match cli.database_url {
        Some(url) => url,
        None => std::env::var("DATABASE_URL").context("DATABASE_URL must be set or passed with --database-url")?,
    };

    let pool = initialize_database(&database_url).await?;
    let reconciler = ConsistencyReconciler::new(Arc::new(PgLedgerRepository::new(pool)));

    let (report, output) = match cli.command {
        Commands::Check { output, categories } => {
            let report = reconciler.check(&CheckFilter::only(categories)).await?;
            (report, output)
        }
        Commands::Fix { dry_run, apply, output } => {
            let mode = if apply && !dry_run {
                FixMode::Apply
            } else {
                FixMode::DryRun
            };
            (reconciler.fix(mode).await?, output)
        }
    };

    write_report(&report, output.as_ref())?;

    info!(
        "{} issues ({} critical, {} high), {} fixed, {} unresolved",
        report.summary.issues_found,
        report.count_by_severity(Severity::Critical),
        report.count_by_severity(Severity::High),
        report.summary.issues_fixed,
        report.summary.unresolved
    );

    Ok(if report.has_unresolved() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn write_report(report: &ReconcileReport, output: Option<&PathBuf>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
