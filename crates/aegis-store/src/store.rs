//! Pooled database handle.

use bytes::Bytes;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgCopyIn, PgPool, PgPoolCopyExt, PgPoolOptions};

use aegis_types::Position;

use crate::config::{EngineKind, StoreConfig};
use crate::error::Result;
use crate::statements;

/// A live database handle: connection pool plus the engine kind needed to
/// pick the right logical-clock dialect.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
    kind: EngineKind,
    identity: String,
}

impl Store {
    /// Connects a pool according to `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database)
            .application_name("aegis-mirror");
        if let Some(password) = &config.password {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        tracing::debug!(
            identity = %config.identity(),
            kind = ?config.kind,
            max_connections = config.max_connections,
            "store connected"
        );

        Ok(Self {
            pool,
            kind: config.kind,
            identity: config.identity(),
        })
    }

    /// Engine family of this database.
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Stable identity string (`host:port/database`).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Underlying pool, for parameterized queries outside the COPY path.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// SQL expression producing this engine's current logical position,
    /// usable inline in an INSERT.
    pub fn position_expr(&self) -> &'static str {
        match self.kind {
            EngineKind::Postgres => "EXTRACT(EPOCH FROM clock_timestamp())::NUMERIC",
            EngineKind::Cockroach => "cluster_logical_timestamp()",
        }
    }

    /// Reads the database's current logical position (the position oracle).
    pub async fn position(&self) -> Result<Position> {
        let query = match self.kind {
            EngineKind::Postgres => statements::POSITION_QUERY_POSTGRES,
            EngineKind::Cockroach => statements::POSITION_QUERY_COCKROACH,
        };
        let value: Decimal = sqlx::query_scalar(query).fetch_one(&self.pool).await?;
        Ok(Position::new(value))
    }

    /// Starts a streaming bulk export (`COPY ... TO STDOUT`).
    pub async fn copy_out(&self, statement: &str) -> Result<BoxStream<'static, sqlx::Result<Bytes>>> {
        Ok(self.pool.copy_out_raw(statement).await?)
    }

    /// Starts a streaming bulk import (`COPY ... FROM STDIN`).
    pub async fn copy_in(&self, statement: &str) -> Result<PgCopyIn<PoolConnection<Postgres>>> {
        Ok(self.pool.copy_in_raw(statement).await?)
    }

    /// Executes a statement, returning the number of affected rows.
    pub async fn execute(&self, statement: &str) -> Result<u64> {
        let result = sqlx::query(statement).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Runs a `SELECT COUNT(*)` statement.
    pub async fn count(&self, statement: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(statement).fetch_one(&self.pool).await?)
    }

    /// Closes the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Destination side of one bulk-import unit.
///
/// Abstracts `PgCopyIn` so the copy pipeline can be exercised against an
/// in-memory sink in tests.
pub trait BulkSink: Send + Sized {
    /// Appends raw COPY bytes to the import.
    fn send(&mut self, chunk: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Commits the import, returning the number of rows written.
    fn finish(self) -> impl Future<Output = Result<u64>> + Send;

    /// Abandons the import without committing.
    fn abort(self, reason: &str) -> impl Future<Output = Result<()>> + Send;
}

impl BulkSink for PgCopyIn<PoolConnection<Postgres>> {
    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        PgCopyIn::send(self, &chunk[..]).await?;
        Ok(())
    }

    async fn finish(self) -> Result<u64> {
        Ok(PgCopyIn::finish(self).await?)
    }

    async fn abort(self, reason: &str) -> Result<()> {
        PgCopyIn::abort(self, reason).await?;
        Ok(())
    }
}
