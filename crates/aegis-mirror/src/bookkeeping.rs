//! Mirror run bookkeeping.
//!
//! Every run's lifecycle (started / succeeded / failed) is appended as domain
//! events to the source database's own event log, under a fixed system-level
//! aggregate. The position at which the started event lands becomes the run's
//! upper bound; the read model in [`crate::last_mirror`] replays these events
//! to derive the resume position for the next run.
//!
//! Appends assert the aggregate's expected sequence through the event log's
//! primary key `(instance_id, aggregate_type, aggregate_id, sequence)`: a
//! concurrent writer loses with a unique violation, surfaced as
//! [`MirrorError::Concurrency`]. Bookkeeping is never best-effort.

use aegis_store::Store;
use aegis_types::{InstanceId, MirrorRunId, Position, Scope};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Aggregate type reserved for system-level bookkeeping.
pub const AGGREGATE_TYPE: &str = "system";
/// Aggregate id reserved for system-level bookkeeping.
pub const AGGREGATE_ID: &str = "SYSTEM";
/// Creator recorded on every bookkeeping event.
pub const CREATOR: &str = "mirror";
/// Resource owner recorded on every bookkeeping event.
pub const OWNER: &str = "SYSTEM";

/// Event type appended when a run begins.
pub const EVENT_STARTED: &str = "system.mirror.started";
/// Event type appended when a run completes.
pub const EVENT_SUCCEEDED: &str = "system.mirror.succeeded";
/// Event type appended when a run fails.
pub const EVENT_FAILED: &str = "system.mirror.failed";

/// Payload of a `system.mirror.started` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartedPayload {
    pub run_id: MirrorRunId,
    pub destination: String,
    /// Explicit instance scope, absent for system-wide runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_ids: Option<Vec<InstanceId>>,
    /// True for system-wide runs.
    #[serde(default)]
    pub system: bool,
}

/// Payload of a `system.mirror.succeeded` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SucceededPayload {
    pub run_id: MirrorRunId,
    pub destination: String,
    /// The upper bound the run copied up to.
    pub position: Position,
}

/// Payload of a `system.mirror.failed` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedPayload {
    pub run_id: MirrorRunId,
    pub destination: String,
    pub error: String,
}

/// Writer for one run's bookkeeping events.
///
/// Carries the aggregate sequence of the started append in-process, so the
/// terminal append targets exactly the next revision: recording a result for
/// a run that never started, or double-recording, conflicts on the key.
pub struct Bookkeeper<'a> {
    source: &'a Store,
    run_id: MirrorRunId,
    destination: String,
    sequence: i64,
}

impl<'a> Bookkeeper<'a> {
    /// Creates a bookkeeper for a fresh run against `destination`.
    pub fn new(source: &'a Store, destination: impl Into<String>) -> Self {
        Self {
            source,
            run_id: MirrorRunId::generate(),
            destination: destination.into(),
            sequence: 0,
        }
    }

    pub fn run_id(&self) -> &MirrorRunId {
        &self.run_id
    }

    /// Appends the started event and returns the position it landed at --
    /// the run's consistent upper bound. Source events at or below this
    /// position are eligible; anything appended later is left for the next
    /// run.
    pub async fn write_started(&mut self, scope: &Scope) -> Result<Position> {
        let payload = StartedPayload {
            run_id: self.run_id.clone(),
            destination: self.destination.clone(),
            instance_ids: scope.instance_ids().map(<[InstanceId]>::to_vec),
            system: scope.is_system(),
        };
        let expected = self.current_sequence().await?;
        let position = self
            .append(EVENT_STARTED, &serde_json::to_string(&payload)?, expected + 1)
            .await?;
        self.sequence = expected + 1;
        tracing::info!(
            run_id = %self.run_id,
            destination = %self.destination,
            scope = %scope,
            position = %position,
            "mirror run started"
        );
        Ok(position)
    }

    /// Appends the succeeded event carrying the upper bound the run reached.
    pub async fn write_succeeded(self, position: Position) -> Result<()> {
        let payload = SucceededPayload {
            run_id: self.run_id.clone(),
            destination: self.destination.clone(),
            position,
        };
        self.append(
            EVENT_SUCCEEDED,
            &serde_json::to_string(&payload)?,
            self.sequence + 1,
        )
        .await?;
        tracing::info!(run_id = %self.run_id, position = %position, "mirror run succeeded");
        Ok(())
    }

    /// Appends the failed event carrying the causal error.
    pub async fn write_failed(self, error: &str) -> Result<()> {
        let payload = FailedPayload {
            run_id: self.run_id.clone(),
            destination: self.destination.clone(),
            error: error.to_string(),
        };
        self.append(
            EVENT_FAILED,
            &serde_json::to_string(&payload)?,
            self.sequence + 1,
        )
        .await?;
        tracing::warn!(run_id = %self.run_id, error, "mirror run failed");
        Ok(())
    }

    async fn current_sequence(&self) -> Result<i64> {
        let sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(\"sequence\"), 0) FROM eventstore.events2 \
             WHERE instance_id = '' AND aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(AGGREGATE_TYPE)
        .bind(AGGREGATE_ID)
        .fetch_one(self.source.pool())
        .await
        .map_err(|e| MirrorError::Bookkeeping(e.into()))?;
        Ok(sequence)
    }

    /// Appends one event at the given sequence, returning the position the
    /// engine assigned to it.
    async fn append(&self, event_type: &str, payload: &str, sequence: i64) -> Result<Position> {
        let statement = format!(
            "INSERT INTO eventstore.events2 (instance_id, \"owner\", aggregate_type, \
             aggregate_id, revision, creator, event_type, payload, \"sequence\", created_at, \
             \"position\", in_tx_order) \
             VALUES ('', $1, $2, $3, 1, $4, $5, $6::JSONB, $7, statement_timestamp(), {pos}, 0) \
             RETURNING \"position\"",
            pos = self.source.position_expr(),
        );
        let position: Decimal = sqlx::query_scalar(&statement)
            .bind(OWNER)
            .bind(AGGREGATE_TYPE)
            .bind(AGGREGATE_ID)
            .bind(CREATOR)
            .bind(event_type)
            .bind(payload)
            .bind(sequence)
            .fetch_one(self.source.pool())
            .await
            .map_err(|e| {
                let err = aegis_store::StoreError::from(e);
                if err.is_conflict() {
                    MirrorError::Concurrency {
                        destination: self.destination.clone(),
                    }
                } else {
                    MirrorError::Bookkeeping(err)
                }
            })?;
        Ok(Position::new(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_payload_serializes_instance_scope() {
        let payload = StartedPayload {
            run_id: MirrorRunId::generate(),
            destination: "dst:5432/aegis".to_string(),
            instance_ids: Some(vec![InstanceId::new("acme").unwrap()]),
            system: false,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["instance_ids"], serde_json::json!(["acme"]));
        assert_eq!(json["system"], serde_json::json!(false));

        let back: StartedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn started_payload_omits_absent_instance_list() {
        let payload = StartedPayload {
            run_id: MirrorRunId::generate(),
            destination: "dst:5432/aegis".to_string(),
            instance_ids: None,
            system: true,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("instance_ids").is_none());
        assert_eq!(json["system"], serde_json::json!(true));
    }
}
