//! Wholesale copy for non-positional tables.
//!
//! Unique constraints, assets, encryption keys, and auth requests have no
//! position column: each run streams the full instance-scoped row set in a
//! single window. With replace semantics the destination's matching rows are
//! cleared first, on the consumer task, so clearing cannot race the import.
//! Replace is what makes re-running these non-append-only copies safe.

use std::time::{Duration, Instant};

use aegis_store::{Store, StoreError, TableSpec};
use aegis_types::Scope;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{MirrorError, Result, join_errors, prune_secondary_errors};
use crate::pump::{FRAME_QUEUE_CAPACITY, Frame, consume_windows, forward_stream, send_frame};

/// Outcome of one table copy.
#[derive(Debug, Clone)]
pub struct TableCopyReport {
    /// Schema-qualified table name.
    pub table: String,
    /// Rows committed on the destination.
    pub rows: u64,
    /// Rows removed by the replace pre-clear, if it ran.
    pub cleared: Option<u64>,
    pub duration: Duration,
}

/// Streams one table from source to destination.
pub async fn copy_table(
    source: &Store,
    destination: &Store,
    spec: &TableSpec,
    scope: &Scope,
    replace: bool,
    cancel: &CancellationToken,
) -> Result<TableCopyReport> {
    let started_at = Instant::now();
    let table = spec.qualified_name();

    // Resolve the pre-clear up front: failing after the export started would
    // waste a partially streamed copy.
    let clear_statement = if replace {
        match spec.delete_stmt(scope) {
            Some(statement) => Some(statement),
            None => {
                return Err(MirrorError::UnsupportedReplace { table });
            }
        }
    } else {
        None
    };

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);

    let producer = {
        let source = source.clone();
        let statement = spec.copy_out_stmt(scope);
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let stream = source.copy_out(&statement).await?;
            let mut stream =
                stream.map(|chunk| chunk.map_err(|e| MirrorError::from(StoreError::from(e))));
            let rows = forward_stream(&mut stream, &frame_tx, &cancel).await?;
            send_frame(&frame_tx, Frame::WindowEnd, &cancel).await?;
            Ok::<u64, MirrorError>(rows)
        })
    };

    let consumer = {
        let destination = destination.clone();
        let copy_in_statement = spec.copy_in_stmt();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let open = {
                let destination = destination.clone();
                move || {
                    let destination = destination.clone();
                    let statement = copy_in_statement.clone();
                    async move { Ok(destination.copy_in(&statement).await?) }
                }
            };
            let pre_clear = clear_statement.map(|statement| {
                let destination = destination.clone();
                move || async move {
                    let cleared = destination.execute(&statement).await?;
                    tracing::debug!(cleared, "pre-cleared destination rows for replace");
                    Ok(cleared)
                }
            });
            consume_windows(frame_rx, open, pre_clear, cancel).await
        })
    };

    let (producer, consumer) = tokio::join!(producer, consumer);
    let mut errors = Vec::new();
    let exported = match producer {
        Ok(Ok(rows)) => Some(rows),
        Ok(Err(error)) => {
            errors.push(error);
            None
        }
        Err(join_error) => {
            errors.push(MirrorError::Task(join_error.to_string()));
            None
        }
    };
    let report = match consumer {
        Ok(Ok(report)) => Some(report),
        Ok(Err(error)) => {
            errors.push(error);
            None
        }
        Err(join_error) => {
            errors.push(MirrorError::Task(join_error.to_string()));
            None
        }
    };
    prune_secondary_errors(&mut errors);
    if let Some(error) = join_errors(errors) {
        return Err(error);
    }

    let report = report.ok_or(MirrorError::ChannelClosed)?;
    if exported.is_some_and(|rows| rows != report.rows) {
        tracing::warn!(
            table = %table,
            exported = exported,
            imported = report.rows,
            "table export/import row counts differ"
        );
    }

    tracing::info!(
        table = %table,
        rows = report.rows,
        cleared = report.cleared,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "table copied"
    );
    Ok(TableCopyReport {
        table,
        rows: report.rows,
        cleared: report.cleared,
        duration: started_at.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_store::statements;
    use aegis_types::InstanceId;

    #[test]
    fn replace_of_unpartitioned_table_requires_system_scope() {
        let scope = Scope::instances(vec![InstanceId::new("acme").unwrap()]).unwrap();
        assert_eq!(statements::ENCRYPTION_KEYS.delete_stmt(&scope), None);
        assert!(statements::ASSETS.delete_stmt(&scope).is_some());
    }
}
