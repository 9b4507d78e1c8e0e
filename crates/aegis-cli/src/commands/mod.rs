//! Mirror subcommand implementations.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use aegis_mirror::{EventCopyReport, MirrorOptions, Orchestrator, TableCopyReport, VerifyReport};
use aegis_store::{Store, StoreConfig};
use aegis_types::{InstanceId, Scope};

/// Arguments shared by every mirror subcommand.
#[derive(Debug, Args)]
pub struct MirrorArgs {
    /// Path to the source database TOML config.
    #[arg(long, value_name = "FILE")]
    pub source: PathBuf,

    /// Path to the destination database TOML config.
    #[arg(long, value_name = "FILE")]
    pub destination: PathBuf,

    /// Mirror the whole system (every instance).
    #[arg(long, conflicts_with = "instances")]
    pub system: bool,

    /// Mirror only this instance (repeatable).
    #[arg(long = "instance", value_name = "ID")]
    pub instances: Vec<InstanceId>,

    /// Clear matching destination rows before importing non-append-only
    /// tables.
    #[arg(long)]
    pub replace: bool,

    /// Ignore previous mirror runs and copy the event log from zero.
    #[arg(long)]
    pub ignore_previous: bool,

    /// Events per bulk window.
    #[arg(long, value_name = "ROWS", default_value_t = 10_000)]
    pub bulk_size: u64,
}

/// Connected stores plus the orchestrator, ready to run phases.
struct Context {
    source: Store,
    destination: Store,
    orchestrator: Orchestrator,
}

impl Context {
    /// Validates the scope, loads both configs, and connects. Scope errors
    /// surface before any connection is opened.
    async fn prepare(args: &MirrorArgs, cancel: CancellationToken) -> Result<Self> {
        let scope = Scope::from_flags(args.system, args.instances.clone())?;

        let source_config = StoreConfig::load(&args.source, "AEGIS_SOURCE")
            .context("loading source config")?;
        let destination_config = StoreConfig::load(&args.destination, "AEGIS_DEST")
            .context("loading destination config")?;

        let source = Store::connect(&source_config)
            .await
            .with_context(|| format!("connecting to source {}", source_config.identity()))?;
        let destination = Store::connect(&destination_config)
            .await
            .with_context(|| {
                format!(
                    "connecting to destination {}",
                    destination_config.identity()
                )
            })?;

        let options = MirrorOptions {
            scope,
            replace: args.replace,
            ignore_previous: args.ignore_previous,
            bulk_size: args.bulk_size,
        };
        let orchestrator =
            Orchestrator::new(source.clone(), destination.clone(), options, cancel);
        Ok(Self {
            source,
            destination,
            orchestrator,
        })
    }

    async fn close(self) {
        self.source.close().await;
        self.destination.close().await;
    }
}

/// `aegis-mirror system`
pub async fn system(args: &MirrorArgs, cancel: CancellationToken) -> Result<()> {
    let ctx = Context::prepare(args, cancel).await?;
    let reports = ctx.orchestrator.copy_system().await?;
    print_tables(&reports);
    ctx.close().await;
    Ok(())
}

/// `aegis-mirror auth`
pub async fn auth(args: &MirrorArgs, cancel: CancellationToken) -> Result<()> {
    let ctx = Context::prepare(args, cancel).await?;
    let report = ctx.orchestrator.copy_auth_requests().await?;
    print_tables(std::slice::from_ref(&report));
    ctx.close().await;
    Ok(())
}

/// `aegis-mirror events`
pub async fn events(args: &MirrorArgs, cancel: CancellationToken) -> Result<()> {
    let ctx = Context::prepare(args, cancel).await?;
    let report = ctx.orchestrator.copy_event_log().await?;
    print_events(&report);
    ctx.close().await;
    Ok(())
}

/// `aegis-mirror unique-constraints`
pub async fn unique_constraints(args: &MirrorArgs, cancel: CancellationToken) -> Result<()> {
    let ctx = Context::prepare(args, cancel).await?;
    let report = ctx.orchestrator.copy_unique_constraints().await?;
    print_tables(std::slice::from_ref(&report));
    ctx.close().await;
    Ok(())
}

/// `aegis-mirror all`
pub async fn all(args: &MirrorArgs, cancel: CancellationToken) -> Result<()> {
    let ctx = Context::prepare(args, cancel).await?;
    let summary = ctx.orchestrator.run_all().await?;
    print_tables(&summary.tables);
    print_events(&summary.events);
    print_verification(&summary.verification);
    ctx.close().await;
    Ok(())
}

/// `aegis-mirror verify`
pub async fn verify(args: &MirrorArgs, cancel: CancellationToken) -> Result<()> {
    let ctx = Context::prepare(args, cancel).await?;
    let report = ctx.orchestrator.verify().await?;
    print_verification(&report);
    ctx.close().await;
    // Mismatches are diagnostics, never an exit code.
    Ok(())
}

fn print_tables(reports: &[TableCopyReport]) {
    for report in reports {
        let cleared = report
            .cleared
            .map(|rows| format!(", cleared {rows}"))
            .unwrap_or_default();
        println!(
            "{} {} ({} rows{cleared}, {:.1?})",
            "✓".green(),
            report.table,
            report.rows,
            report.duration,
        );
    }
}

fn print_events(report: &EventCopyReport) {
    println!(
        "{} eventstore.events2 ({} rows in {} windows, {:.1?})",
        "✓".green(),
        report.rows,
        report.windows,
        report.duration,
    );
    println!(
        "  run {} copied positions {} → {}",
        report.run_id,
        report.from,
        report.to,
    );
}

fn print_verification(report: &VerifyReport) {
    let mut mismatched = 0usize;
    for count in report.mismatches() {
        mismatched += 1;
        let shown = |rows: Option<i64>| {
            rows.map_or_else(|| "?".to_string(), |r| r.to_string())
        };
        println!(
            "{} {}.{}: source {} destination {}",
            "≠".yellow(),
            count.schema,
            count.table,
            shown(count.source_rows),
            shown(count.destination_rows),
        );
    }
    if mismatched == 0 {
        println!(
            "{} verified {} tables, all row counts match",
            "✓".green(),
            report.counts.len()
        );
    } else {
        println!(
            "{} verified {} tables, {mismatched} differ (diagnostic only)",
            "!".yellow(),
            report.counts.len(),
        );
    }
}
