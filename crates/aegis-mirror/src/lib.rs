//! # aegis-mirror: consistent cross-database event-store mirroring
//!
//! Copies an append-only event log and its auxiliary tables from one live
//! database to another without locking the source, in resumable bounded
//! windows, recording its own progress as events in the very log it mirrors.
//!
//! The guarantees, in order of importance:
//!
//! - **Consistent upper bound**: the position at which the run's started
//!   event lands caps what the run copies; later source writes wait for the
//!   next run.
//! - **Resumability**: the last successful run's recorded position is the
//!   next run's exclusive lower bound, so nothing is re-copied.
//! - **Backpressure**: arbitrarily large tables stream through bounded
//!   channels.
//! - **Self-describing progress**: started/succeeded/failed are domain
//!   events on a fixed system aggregate, making runs auditable and the whole
//!   operation idempotent by construction.
//!
//! Consistency across the two databases is eventual, not transactional:
//! there is no cross-database transaction, only the resumption and
//! upper-bound properties above.

pub mod bookkeeping;
pub mod error;
pub mod event_copy;
pub mod last_mirror;
pub mod orchestrator;
mod pump;
pub mod table_copy;
pub mod verify;

pub use bookkeeping::Bookkeeper;
pub use error::{JoinedErrors, MirrorError, Result};
pub use event_copy::{EventCopyOptions, EventCopyReport, copy_events};
pub use last_mirror::last_successful_position;
pub use orchestrator::{MirrorOptions, MirrorSummary, Orchestrator, Phase};
pub use table_copy::{TableCopyReport, copy_table};
pub use verify::{TableCount, VERIFY_SCHEMAS, VerifyReport, verify};
