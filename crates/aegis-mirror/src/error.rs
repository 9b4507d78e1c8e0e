//! Mirror engine error types.

use std::fmt;

use aegis_store::StoreError;
use thiserror::Error;

/// Result type for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors that can occur while mirroring.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Database-boundary error outside the bookkeeping path.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A bookkeeping append raced with a concurrent mirror run. Never
    /// retried: re-deriving the bound after a race could be wrong.
    #[error("concurrent mirror run detected for destination {destination} (bookkeeping conflict)")]
    Concurrency { destination: String },

    /// A bookkeeping append failed for a non-conflict reason. Fatal, because
    /// resumability depends on the log being authoritative.
    #[error("bookkeeping append failed: {0}")]
    Bookkeeping(#[source] StoreError),

    /// Bookkeeping payload could not be encoded or decoded.
    #[error("bookkeeping payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The destination's position oracle failed mid-run; further windows
    /// cannot be stamped.
    #[error("position query against destination failed: {0}")]
    Position(String),

    /// A transfer channel closed before the copy completed, meaning the
    /// partner task exited early.
    #[error("transfer channel closed before completion")]
    ChannelClosed,

    /// Replace semantics requested for a table that cannot be cleared under
    /// an instance-scoped run.
    #[error("cannot replace {table}: table is not instance-partitioned, rerun with system scope")]
    UnsupportedReplace { table: String },

    /// The run was cancelled.
    #[error("mirror run cancelled")]
    Cancelled,

    /// A transfer task panicked or was aborted by the runtime.
    #[error("transfer task failed: {0}")]
    Task(String),

    /// Multiple transfer failures joined into one cause.
    #[error("transfer failed: {0}")]
    Transfer(JoinedErrors),
}

/// A set of transfer errors reported as a single cause, preserving each
/// message (producer, consumer, position supplier).
#[derive(Debug)]
pub struct JoinedErrors(pub Vec<MirrorError>);

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            fmt::Display::fmt(err, f)?;
        }
        Ok(())
    }
}

/// Collapses a list of failures into one error. `None` if the list is empty.
pub(crate) fn join_errors(mut errors: Vec<MirrorError>) -> Option<MirrorError> {
    match errors.len() {
        0 => None,
        1 => errors.pop(),
        _ => Some(MirrorError::Transfer(JoinedErrors(errors))),
    }
}

/// Drops follow-on failures so the recorded cause is the original one: a
/// partner that merely observed a closed channel, or tasks unwound by the
/// same cancellation, add nothing to the diagnosis.
pub(crate) fn prune_secondary_errors(errors: &mut Vec<MirrorError>) {
    let is_secondary =
        |e: &MirrorError| matches!(e, MirrorError::Cancelled | MirrorError::ChannelClosed);
    if errors.iter().any(|e| !is_secondary(e)) {
        errors.retain(|e| !is_secondary(e));
    } else if errors.iter().any(|e| matches!(e, MirrorError::Cancelled)) {
        errors.clear();
        errors.push(MirrorError::Cancelled);
    } else if !errors.is_empty() {
        errors.clear();
        errors.push(MirrorError::ChannelClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joining_no_errors_is_none() {
        assert!(join_errors(vec![]).is_none());
    }

    #[test]
    fn joining_one_error_is_identity() {
        let err = join_errors(vec![MirrorError::Cancelled]).unwrap();
        assert!(matches!(err, MirrorError::Cancelled));
    }

    #[test]
    fn secondary_errors_are_pruned() {
        let mut errors = vec![
            MirrorError::ChannelClosed,
            MirrorError::Position("oracle down".to_string()),
            MirrorError::Cancelled,
        ];
        prune_secondary_errors(&mut errors);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], MirrorError::Position(_)));

        let mut only_cancelled = vec![MirrorError::Cancelled, MirrorError::Cancelled];
        prune_secondary_errors(&mut only_cancelled);
        assert_eq!(only_cancelled.len(), 1);
        assert!(matches!(only_cancelled[0], MirrorError::Cancelled));

        let mut empty = Vec::new();
        prune_secondary_errors(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn joining_many_errors_concatenates_messages() {
        let err = join_errors(vec![
            MirrorError::ChannelClosed,
            MirrorError::Position("connection reset".to_string()),
        ])
        .unwrap();
        assert_eq!(
            err.to_string(),
            "transfer failed: transfer channel closed before completion; \
             position query against destination failed: connection reset"
        );
    }
}
