//! # aegis-store: database boundary for the Aegis mirroring engine
//!
//! Everything that talks SQL lives here:
//! - Engine kind selection and connection configuration ([`StoreConfig`])
//! - A pooled database handle with COPY streaming ([`Store`])
//! - The position oracle (per-engine logical clock queries)
//! - Centralized statement construction ([`statements`])
//!
//! Statement construction is deliberately concentrated in one module because
//! the COPY protocol forbids bound parameters: scope clauses and position
//! bounds are interpolated as literals, and every value that can reach them
//! is either a validated [`aegis_types::InstanceId`] or a decimal rendered by
//! this crate.

pub mod config;
pub mod error;
pub mod statements;
mod store;

pub use config::{EngineKind, StoreConfig};
pub use error::{Result, StoreError};
pub use statements::TableSpec;
pub use store::{BulkSink, Store};
