//! Phase sequencing for a full mirror run.
//!
//! Strictly ordered, no retries: system tables, then auth requests, then the
//! event log (the only positional phase, with bookkeeping), then unique
//! constraints, then verification. Projection replay happens outside this
//! tool, against the destination, after the event log lands. Every phase
//! error is fatal -- this is an operator-invoked batch job, not a resilient
//! background service.

use std::fmt;
use std::time::Instant;

use aegis_store::{Store, statements};
use aegis_types::Scope;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event_copy::{EventCopyOptions, EventCopyReport, copy_events};
use crate::table_copy::{TableCopyReport, copy_table};
use crate::verify::{VerifyReport, verify};

/// Options shared by every phase of a run.
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub scope: Scope,
    /// Pre-clear destination rows for non-append-only tables.
    pub replace: bool,
    /// Ignore bookkeeping history and copy the event log from zero.
    pub ignore_previous: bool,
    /// Rows per event-log window.
    pub bulk_size: u64,
}

impl MirrorOptions {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            replace: false,
            ignore_previous: false,
            bulk_size: EventCopyOptions::default().bulk_size,
        }
    }
}

/// Phases of a full run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    System,
    AuthRequests,
    EventLog,
    UniqueConstraints,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::AuthRequests => "auth-requests",
            Self::EventLog => "event-log",
            Self::UniqueConstraints => "unique-constraints",
            Self::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Summary of a full mirror run.
#[derive(Debug)]
pub struct MirrorSummary {
    pub tables: Vec<TableCopyReport>,
    pub events: EventCopyReport,
    pub verification: VerifyReport,
}

/// Sequences mirror phases against one source/destination pair.
pub struct Orchestrator {
    source: Store,
    destination: Store,
    options: MirrorOptions,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        source: Store,
        destination: Store,
        options: MirrorOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            destination,
            options,
            cancel,
        }
    }

    /// Copies the system tables: assets and encryption keys.
    pub async fn copy_system(&self) -> Result<Vec<TableCopyReport>> {
        self.enter(Phase::System);
        let mut reports = Vec::new();
        for spec in [&statements::ASSETS, &statements::ENCRYPTION_KEYS] {
            reports.push(self.copy(spec).await?);
        }
        Ok(reports)
    }

    /// Copies pending auth requests.
    pub async fn copy_auth_requests(&self) -> Result<TableCopyReport> {
        self.enter(Phase::AuthRequests);
        self.copy(&statements::AUTH_REQUESTS).await
    }

    /// Copies the event log in bounded windows, with bookkeeping.
    pub async fn copy_event_log(&self) -> Result<EventCopyReport> {
        self.enter(Phase::EventLog);
        let options = EventCopyOptions {
            bulk_size: self.options.bulk_size,
            ignore_previous: self.options.ignore_previous,
        };
        copy_events(
            &self.source,
            &self.destination,
            &self.options.scope,
            &options,
            &self.cancel,
        )
        .await
    }

    /// Copies the unique-constraint reservations.
    pub async fn copy_unique_constraints(&self) -> Result<TableCopyReport> {
        self.enter(Phase::UniqueConstraints);
        self.copy(&statements::UNIQUE_CONSTRAINTS).await
    }

    /// Compares row counts; reports, never fails the run.
    pub async fn verify(&self) -> Result<VerifyReport> {
        self.enter(Phase::Verify);
        verify(&self.source, &self.destination, &self.options.scope).await
    }

    /// Runs every phase in order, stopping at the first error.
    pub async fn run_all(&self) -> Result<MirrorSummary> {
        let started_at = Instant::now();
        let mut tables = self.copy_system().await?;
        tables.push(self.copy_auth_requests().await?);
        let events = self.copy_event_log().await?;
        tables.push(self.copy_unique_constraints().await?);
        let verification = self.verify().await?;
        tracing::info!(
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            events = events.rows,
            "mirror complete"
        );
        Ok(MirrorSummary {
            tables,
            events,
            verification,
        })
    }

    async fn copy(&self, spec: &'static aegis_store::TableSpec) -> Result<TableCopyReport> {
        copy_table(
            &self.source,
            &self.destination,
            spec,
            &self.options.scope,
            self.options.replace,
            &self.cancel,
        )
        .await
    }

    fn enter(&self, phase: Phase) {
        tracing::info!(
            %phase,
            source = self.source.identity(),
            destination = self.destination.identity(),
            scope = %self.options.scope,
            "phase started"
        );
    }
}
