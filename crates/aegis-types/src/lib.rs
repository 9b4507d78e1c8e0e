//! # aegis-types: Core types for the Aegis mirroring engine
//!
//! This crate contains shared types used across the mirror tool:
//! - Tenant partition identifiers ([`InstanceId`])
//! - Copy scope selection ([`Scope`])
//! - Logical clock values ([`Position`])
//! - Mirror run identifiers ([`MirrorRunId`])

use std::fmt::{self, Display};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while constructing domain values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    /// Instance identifier violates the allowed grammar.
    #[error(
        "invalid instance id {0:?}: must be 1-64 characters of [A-Za-z0-9._-], starting alphanumeric"
    )]
    InvalidInstanceId(String),

    /// Both system-wide and explicit instance scope were requested.
    #[error("scope is ambiguous: --system and an instance list are mutually exclusive")]
    AmbiguousScope,

    /// Neither system-wide nor explicit instance scope was requested.
    #[error("scope is missing: either --system or at least one instance id is required")]
    MissingScope,
}

/// Result type for domain value construction.
pub type Result<T> = std::result::Result<T, TypeError>;

// ============================================================================
// InstanceId
// ============================================================================

/// Identifier of a tenant partition within the event log.
///
/// The grammar is deliberately strict because instance ids end up embedded as
/// literals in bulk-export statements, which cannot carry bound parameters:
/// 1-64 characters of `[A-Za-z0-9._-]`, the first alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    const MAX_LEN: usize = 64;

    /// Validates and wraps an instance identifier.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if Self::is_valid(&raw) {
            Ok(Self(raw))
        } else {
            Err(TypeError::InvalidInstanceId(raw))
        }
    }

    fn is_valid(raw: &str) -> bool {
        let mut chars = raw.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        raw.len() <= Self::MAX_LEN
            && first.is_ascii_alphanumeric()
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Scope
// ============================================================================

/// Which tenant partitions a copy or verify run applies to.
///
/// Either the whole system or an explicit, non-empty set of instances.
/// The two-flag ambiguity of the CLI surface is resolved once, here, at
/// construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// All instances, including system-level rows with an empty instance id.
    System,
    /// An explicit, non-empty list of instances.
    Instances(Vec<InstanceId>),
}

impl Scope {
    /// Builds a scope from an explicit instance list; rejects empty lists.
    pub fn instances(ids: Vec<InstanceId>) -> Result<Self> {
        if ids.is_empty() {
            Err(TypeError::MissingScope)
        } else {
            Ok(Self::Instances(ids))
        }
    }

    /// Resolves the mutually exclusive CLI flags into a scope.
    ///
    /// Exactly one of `system` or a non-empty `ids` list must be given.
    pub fn from_flags(system: bool, ids: Vec<InstanceId>) -> Result<Self> {
        match (system, ids.is_empty()) {
            (true, true) => Ok(Self::System),
            (false, false) => Ok(Self::Instances(ids)),
            (true, false) => Err(TypeError::AmbiguousScope),
            (false, true) => Err(TypeError::MissingScope),
        }
    }

    /// Returns true for the system-wide scope.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }

    /// Returns the explicit instance list, if any.
    pub fn instance_ids(&self) -> Option<&[InstanceId]> {
        match self {
            Self::System => None,
            Self::Instances(ids) => Some(ids),
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Instances(ids) => {
                let mut first = true;
                for id in ids {
                    if !first {
                        f.write_str(",")?;
                    }
                    first = false;
                    Display::fmt(id, f)?;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Position
// ============================================================================

/// A logical clock value scoped to the database that produced it.
///
/// Positions from a single database are non-decreasing over time; ties within
/// an instance partition are broken by the in-partition order column.
/// Positions from different databases are never comparable to each other,
/// which the type system cannot express -- callers must keep source and
/// destination positions apart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Position(Decimal);

impl Position {
    /// The zero position: "copy everything up to the upper bound".
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Renders the position for embedding as a literal in a bulk-export
    /// statement. `Decimal` formats as digits with an optional sign and
    /// decimal point only, so the result needs no quoting.
    pub fn as_sql_literal(&self) -> String {
        self.0.to_string()
    }

    pub fn into_inner(self) -> Decimal {
        self.0
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<Decimal> for Position {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl From<Position> for Decimal {
    fn from(value: Position) -> Self {
        value.0
    }
}

// ============================================================================
// MirrorRunId
// ============================================================================

/// Identifier of one execution of the event-log mirror phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MirrorRunId(String);

impl MirrorRunId {
    /// Generates a fresh random run identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MirrorRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
