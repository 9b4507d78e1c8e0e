//! Last-successful-mirror read model.
//!
//! Replays the bookkeeping events scoped to the fixed system aggregate and
//! derives, for a destination identity, the position recorded by the most
//! recent succeeded run whose started event named that destination. The
//! result is the resume lower bound for a new run; absence means "copy
//! everything up to the new upper bound".

use aegis_store::Store;
use aegis_types::Position;

use crate::bookkeeping::{
    AGGREGATE_ID, AGGREGATE_TYPE, CREATOR, EVENT_STARTED, EVENT_SUCCEEDED, StartedPayload,
    SucceededPayload,
};
use crate::error::{MirrorError, Result};

/// One bookkeeping event as read back from the log.
#[derive(Debug, Clone)]
pub(crate) struct BookkeepingEvent {
    pub event_type: String,
    pub payload: String,
}

/// Returns the resume lower bound for mirroring to `destination`.
///
/// `ignore_previous` requests a deliberate full re-mirror and short-circuits
/// to the zero position without touching the log.
pub async fn last_successful_position(
    source: &Store,
    destination: &str,
    ignore_previous: bool,
) -> Result<Position> {
    if ignore_previous {
        tracing::info!(destination, "ignoring previous mirror runs, copying from zero");
        return Ok(Position::ZERO);
    }

    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT event_type, payload::TEXT FROM eventstore.events2 \
         WHERE instance_id = '' AND aggregate_type = $1 AND aggregate_id = $2 \
         AND creator = $3 AND event_type IN ($4, $5) \
         ORDER BY \"position\", in_tx_order",
    )
    .bind(AGGREGATE_TYPE)
    .bind(AGGREGATE_ID)
    .bind(CREATOR)
    .bind(EVENT_STARTED)
    .bind(EVENT_SUCCEEDED)
    .fetch_all(source.pool())
    .await
    .map_err(|e| MirrorError::Bookkeeping(e.into()))?;

    let events = rows.into_iter().map(|(event_type, payload)| BookkeepingEvent {
        event_type,
        payload,
    });

    let position = reduce_last_successful(events, destination);
    match position {
        Some(found) => {
            tracing::info!(destination, position = %found, "resuming after last successful mirror");
            Ok(found)
        }
        None => {
            tracing::info!(destination, "no previous successful mirror, copying from zero");
            Ok(Position::ZERO)
        }
    }
}

/// Pure replay over started/succeeded events.
///
/// A started event matches only if its destination equals the queried one;
/// its run id is then remembered, and a later succeeded event is applied only
/// if the run id matches. Later matches supersede earlier ones. Malformed
/// payloads are skipped with a warning rather than poisoning the replay.
pub(crate) fn reduce_last_successful(
    events: impl IntoIterator<Item = BookkeepingEvent>,
    destination: &str,
) -> Option<Position> {
    let mut pending_run = None;
    let mut last = None;

    for event in events {
        match event.event_type.as_str() {
            EVENT_STARTED => match serde_json::from_str::<StartedPayload>(&event.payload) {
                Ok(payload) if payload.destination == destination => {
                    pending_run = Some(payload.run_id);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, "skipping malformed mirror started payload");
                }
            },
            EVENT_SUCCEEDED => match serde_json::from_str::<SucceededPayload>(&event.payload) {
                Ok(payload) if pending_run.as_ref() == Some(&payload.run_id) => {
                    last = Some(payload.position);
                    pending_run = None;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, "skipping malformed mirror succeeded payload");
                }
            },
            _ => {}
        }
    }

    last
}
