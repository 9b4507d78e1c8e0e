//! Centralized statement construction.
//!
//! The bulk COPY protocol cannot carry bound parameters, so scope clauses and
//! position bounds are embedded as literals. Every interpolated value is
//! either a validated [`InstanceId`] (strict identifier grammar, no quotes)
//! or a decimal rendered by [`Position::as_sql_literal`]. Nothing else in the
//! workspace builds WHERE clauses for copy, delete, or count statements.

use std::fmt::Write as _;

use aegis_types::{Position, Scope};

/// NUL sanitization for JSON columns: some encodings cannot round-trip an
/// embedded `NUL`, so it is stripped on export.
const STRIP_NULS: &str = r"regexp_replace({col}::TEXT, '\\u0000', '', 'g')::JSON";

/// Source query for a wall-clock-derived position (PostgreSQL).
pub const POSITION_QUERY_POSTGRES: &str = "SELECT EXTRACT(EPOCH FROM clock_timestamp())::NUMERIC";

/// Source query for a cluster logical timestamp (CockroachDB).
pub const POSITION_QUERY_COCKROACH: &str = "SELECT cluster_logical_timestamp()";

/// Import side of the event-log copy. Column order matches
/// [`events_window_copy_out`].
pub const EVENTS_COPY_IN: &str = "COPY eventstore.events2 (instance_id, aggregate_type, \
     aggregate_id, event_type, \"sequence\", revision, created_at, payload, creator, \"owner\", \
     \"position\", in_tx_order) FROM STDIN";

/// A non-positional table copied wholesale per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    /// Schema the table lives in.
    pub schema: &'static str,
    /// Table name.
    pub table: &'static str,
    /// Destination columns, in the order the export emits them.
    pub columns: &'static [&'static str],
    /// Export select list (may sanitize JSON columns).
    pub select_list: &'static str,
    /// Instance scoping column, if the table is tenant-partitioned.
    pub instance_column: Option<&'static str>,
}

/// `eventstore.unique_constraints`: instance-scoped.
pub const UNIQUE_CONSTRAINTS: TableSpec = TableSpec {
    schema: "eventstore",
    table: "unique_constraints",
    columns: &["instance_id", "unique_type", "unique_field"],
    select_list: "instance_id, unique_type, unique_field",
    instance_column: Some("instance_id"),
};

/// `system.assets`: instance-scoped. The content hash is a generated column
/// recomputed by the destination, so it is not exported.
pub const ASSETS: TableSpec = TableSpec {
    schema: "system",
    table: "assets",
    columns: &[
        "instance_id",
        "asset_type",
        "resource_owner",
        "name",
        "content_type",
        "data",
        "updated_at",
    ],
    select_list: "instance_id, asset_type, resource_owner, name, content_type, data, updated_at",
    instance_column: Some("instance_id"),
};

/// `system.encryption_keys`: not tenant-partitioned; always a full copy.
pub const ENCRYPTION_KEYS: TableSpec = TableSpec {
    schema: "system",
    table: "encryption_keys",
    columns: &["id", "key"],
    select_list: "id, \"key\"",
    instance_column: None,
};

/// `auth.auth_requests`: instance-scoped, JSON request NUL-sanitized.
pub const AUTH_REQUESTS: TableSpec = TableSpec {
    schema: "auth",
    table: "auth_requests",
    columns: &[
        "id",
        "request",
        "code",
        "request_type",
        "creation_date",
        "change_date",
        "instance_id",
    ],
    select_list: r"id, regexp_replace(request::TEXT, '\\u0000', '', 'g')::JSON, code, request_type, creation_date, change_date, instance_id",
    instance_column: Some("instance_id"),
};

impl TableSpec {
    /// Schema-qualified table name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Export statement for this table under the given scope.
    pub fn copy_out_stmt(&self, scope: &Scope) -> String {
        let mut stmt = format!(
            "COPY (SELECT {} FROM {}",
            self.select_list,
            self.qualified_name()
        );
        if let Some(clause) = self.instance_column.and_then(|col| scope_predicate(scope, col)) {
            let _ = write!(stmt, " WHERE {clause}");
        }
        stmt.push_str(") TO STDOUT");
        stmt
    }

    /// Import statement for this table.
    pub fn copy_in_stmt(&self) -> String {
        format!(
            "COPY {} ({}) FROM STDIN",
            self.qualified_name(),
            quoted_column_list(self.columns)
        )
    }

    /// Scoped pre-clear for replace semantics. Returns `None` when the table
    /// has no instance column but the scope names explicit instances: there
    /// is no way to clear "only those tenants" from an unpartitioned table.
    pub fn delete_stmt(&self, scope: &Scope) -> Option<String> {
        match (self.instance_column, scope) {
            (_, Scope::System) => Some(format!("DELETE FROM {}", self.qualified_name())),
            (Some(col), scope) => {
                let clause = scope_predicate(scope, col)?;
                Some(format!("DELETE FROM {} WHERE {clause}", self.qualified_name()))
            }
            (None, Scope::Instances(_)) => None,
        }
    }
}

/// Builds the instance scope predicate for a statement, or `None` for the
/// unconditional system-wide scope.
///
/// This is the single reviewed interpolation point for instance identifiers.
/// `InstanceId`'s grammar excludes quotes and whitespace, so the quoting
/// below cannot be escaped from.
pub fn scope_predicate(scope: &Scope, column: &str) -> Option<String> {
    let ids = scope.instance_ids()?;
    let mut list = String::new();
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            list.push_str(", ");
        }
        let _ = write!(list, "'{id}'");
    }
    Some(format!("{column} = ANY (ARRAY[{list}])"))
}

/// Export statement for one event-log window.
///
/// Selects rows strictly above `from` and at or below `to`, ordered by the
/// source's `(instance_id, position, in_tx_order)`, paginated by
/// `LIMIT bulk_size OFFSET bulk_size * window`. Every row is stamped with
/// `stamp` (a position freshly read from the destination for this window)
/// and a tiebreaker numbered per partition in source emission order.
///
/// The select list aliases the stamped constant as `"position"`, and an
/// unqualified `ORDER BY "position"` would resolve to that output column
/// rather than the source column, leaving pagination at the mercy of the
/// scan order. The base table is therefore aliased and every ordering key
/// table-qualified, including inside the `row_number()` window spec.
pub fn events_window_copy_out(
    scope: &Scope,
    from: Position,
    to: Position,
    stamp: Position,
    bulk_size: u64,
    window: u64,
) -> String {
    let mut stmt = format!(
        "COPY (SELECT e.instance_id, e.aggregate_type, e.aggregate_id, e.event_type, \
         e.\"sequence\", e.revision, e.created_at, {payload}, e.creator, e.\"owner\", \
         {stamp} AS \"position\", \
         row_number() OVER (PARTITION BY e.instance_id ORDER BY e.\"position\", e.in_tx_order) \
         AS in_tx_order FROM eventstore.events2 e WHERE ",
        payload = STRIP_NULS.replace("{col}", "e.payload"),
        stamp = stamp.as_sql_literal(),
    );
    if let Some(clause) = scope_predicate(scope, "e.instance_id") {
        let _ = write!(stmt, "{clause} AND ");
    }
    let _ = write!(
        stmt,
        "e.\"position\" > {from} AND e.\"position\" <= {to} \
         ORDER BY e.instance_id, e.\"position\", e.in_tx_order \
         LIMIT {bulk_size} OFFSET {offset}) TO STDOUT",
        from = from.as_sql_literal(),
        to = to.as_sql_literal(),
        offset = bulk_size.saturating_mul(window),
    );
    stmt
}

/// Row count for a verify pass. `instance_column` is interpolated from a
/// fixed allow-list discovered via `information_schema`, never from input.
pub fn count_stmt(
    schema: &str,
    table: &str,
    instance_column: Option<&str>,
    scope: &Scope,
) -> String {
    let mut stmt = format!("SELECT COUNT(*) FROM {schema}.{table}");
    if let Some(clause) = instance_column.and_then(|col| scope_predicate(scope, col)) {
        let _ = write!(stmt, " WHERE {clause}");
    }
    stmt
}

fn quoted_column_list(columns: &[&str]) -> String {
    let mut out = String::new();
    for (i, col) in columns.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        // Reserved words (key, owner, sequence, position) need quoting.
        let _ = write!(out, "\"{col}\"");
    }
    out
}
