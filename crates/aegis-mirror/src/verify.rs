//! Post-mirror row-count verification.
//!
//! Enumerates all tables and views in the destination for a fixed list of
//! schemas and compares instance-scoped row counts against the source.
//! Mismatches are logged with the signed difference and reported, never
//! raised: legitimate skew occurs while a live deployment keeps writing, so
//! this is a diagnostic, not a correctness gate.

use aegis_store::{Store, statements};
use aegis_types::Scope;

use crate::error::{MirrorError, Result};

/// Schemas whose tables are compared after a mirror run.
pub const VERIFY_SCHEMAS: [&str; 5] = ["adminapi", "auth", "eventstore", "projections", "system"];

/// Count comparison for a single table. A `None` count means the query
/// failed on that side (e.g. the table does not exist there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCount {
    pub schema: String,
    pub table: String,
    pub source_rows: Option<i64>,
    pub destination_rows: Option<i64>,
}

impl TableCount {
    /// Signed destination-minus-source difference; `None` if either side
    /// could not be counted.
    pub fn difference(&self) -> Option<i64> {
        Some(self.destination_rows? - self.source_rows?)
    }

    /// True when both sides were counted and agree.
    pub fn matches(&self) -> bool {
        self.difference() == Some(0)
    }
}

/// Full verification report.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub counts: Vec<TableCount>,
}

impl VerifyReport {
    /// Tables whose counts differ or could not be compared.
    pub fn mismatches(&self) -> impl Iterator<Item = &TableCount> {
        self.counts.iter().filter(|count| !count.matches())
    }
}

/// Compares row counts between source and destination for every table and
/// view in the known schemas.
pub async fn verify(source: &Store, destination: &Store, scope: &Scope) -> Result<VerifyReport> {
    let schemas: Vec<String> = VERIFY_SCHEMAS.iter().map(ToString::to_string).collect();
    let tables: Vec<(String, String)> = sqlx::query_as(
        "SELECT table_schema, table_name FROM information_schema.tables \
         WHERE table_schema = ANY($1) AND table_type IN ('BASE TABLE', 'VIEW') \
         ORDER BY table_schema, table_name",
    )
    .bind(&schemas)
    .fetch_all(destination.pool())
    .await
    .map_err(|e| MirrorError::Store(e.into()))?;

    let mut report = VerifyReport::default();
    for (schema, table) in tables {
        let instance_column = if has_instance_column(destination, &schema, &table).await? {
            Some("instance_id")
        } else {
            None
        };
        // Table names come from the destination's own catalog, not from
        // input, so interpolating them is as trusted as the scope clause.
        let statement = statements::count_stmt(&schema, &table, instance_column, scope);
        let count = TableCount {
            source_rows: count_side(source, &statement, "source", &schema, &table).await,
            destination_rows: count_side(destination, &statement, "destination", &schema, &table)
                .await,
            schema,
            table,
        };

        let qualified = format!("{}.{}", count.schema, count.table);
        match count.difference() {
            Some(0) => tracing::info!(
                table = %qualified,
                rows = count.source_rows,
                "verified"
            ),
            Some(diff) => tracing::warn!(
                table = %qualified,
                source = count.source_rows,
                destination = count.destination_rows,
                difference = diff,
                "row counts differ"
            ),
            None => {}
        }
        report.counts.push(count);
    }
    Ok(report)
}

async fn has_instance_column(store: &Store, schema: &str, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 AND column_name = 'instance_id')",
    )
    .bind(schema)
    .bind(table)
    .fetch_one(store.pool())
    .await
    .map_err(|e| MirrorError::Store(e.into()))?;
    Ok(exists)
}

/// Counts one side; failures are recovered into `None` so verification
/// keeps going.
async fn count_side(
    store: &Store,
    statement: &str,
    side: &'static str,
    schema: &str,
    table: &str,
) -> Option<i64> {
    match store.count(statement).await {
        Ok(rows) => Some(rows),
        Err(error) => {
            let qualified = format!("{schema}.{table}");
            tracing::warn!(table = %qualified, side, %error, "count failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(source: Option<i64>, destination: Option<i64>) -> TableCount {
        TableCount {
            schema: "eventstore".to_string(),
            table: "events2".to_string(),
            source_rows: source,
            destination_rows: destination,
        }
    }

    #[test]
    fn difference_is_destination_minus_source() {
        assert_eq!(count(Some(250), Some(250)).difference(), Some(0));
        assert_eq!(count(Some(250), Some(245)).difference(), Some(-5));
        assert_eq!(count(Some(100), Some(130)).difference(), Some(30));
        assert_eq!(count(None, Some(130)).difference(), None);
    }

    #[test]
    fn mismatches_include_uncountable_tables() {
        let report = VerifyReport {
            counts: vec![
                count(Some(10), Some(10)),
                count(Some(10), Some(9)),
                count(Some(10), None),
            ],
        };
        let mismatched: Vec<_> = report.mismatches().collect();
        assert_eq!(mismatched.len(), 2);
    }
}
