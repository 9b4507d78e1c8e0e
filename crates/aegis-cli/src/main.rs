//! Aegis mirror CLI.
//!
//! Copies an Aegis deployment's event store and auxiliary tables from one
//! database to another, resumably and without locking the source.
//!
//! # Quick Start
//!
//! ```bash
//! # Mirror everything, then verify
//! aegis-mirror all --source source.toml --destination destination.toml --system
//!
//! # Mirror two tenants' event log only, in windows of 5000 events
//! aegis-mirror events --source source.toml --destination destination.toml \
//!     --instance acme --instance initech --bulk-size 5000
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use commands::MirrorArgs;

/// Aegis mirror - consistent cross-database event-store mirroring.
#[derive(Parser)]
#[command(name = "aegis-mirror")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy system tables (assets, encryption keys).
    System(MirrorArgs),

    /// Copy pending auth requests.
    Auth(MirrorArgs),

    /// Copy the event log in bounded, resumable windows.
    Events(MirrorArgs),

    /// Copy unique-constraint reservations.
    UniqueConstraints(MirrorArgs),

    /// Run every phase in order: system, auth, events, unique constraints,
    /// verify.
    All(MirrorArgs),

    /// Compare row counts between source and destination (diagnostic only).
    Verify(MirrorArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, abandoning in-flight windows");
            cancel_on_signal.cancel();
        }
    });

    match cli.command {
        Commands::System(args) => commands::system(&args, cancel).await,
        Commands::Auth(args) => commands::auth(&args, cancel).await,
        Commands::Events(args) => commands::events(&args, cancel).await,
        Commands::UniqueConstraints(args) => commands::unique_constraints(&args, cancel).await,
        Commands::All(args) => commands::all(&args, cancel).await,
        Commands::Verify(args) => commands::verify(&args, cancel).await,
    }
}
