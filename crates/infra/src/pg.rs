//! Shared Postgres plumbing for the durable store adapters.
//!
//! The store traits are synchronous, so each adapter drives `sqlx` on a
//! dedicated current-thread runtime owned by [`PgRuntime`]. Adapters must not
//! be called from inside another async runtime's worker thread.

use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deletion_queue (
    id            UUID PRIMARY KEY,
    match_id      JSONB NOT NULL,
    kind          TEXT NOT NULL,
    data_mappers  JSONB NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL,
    created_by    JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id          UUID PRIMARY KEY,
    status      TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    expires     TIMESTAMPTZ NULL,
    config      JSONB NOT NULL,
    created_by  JSONB NOT NULL
);

-- The active-job slot: at most one row may hold an active status.
CREATE UNIQUE INDEX IF NOT EXISTS jobs_single_active
    ON jobs ((true))
    WHERE status IN ('QUEUED', 'RUNNING', 'FORGET_COMPLETED');

CREATE INDEX IF NOT EXISTS jobs_created_at ON jobs (created_at DESC, id DESC);
"#;

/// Connection pool plus the runtime that drives it.
#[derive(Debug)]
pub struct PgRuntime {
    runtime: tokio::runtime::Runtime,
    pool: PgPool,
}

impl PgRuntime {
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Arc<Self>, sqlx::Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(sqlx::Error::Io)?;

        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url),
        )?;

        info!(max_connections, "connected to postgres");
        Ok(Arc::new(Self { runtime, pool }))
    }

    /// Create tables and indexes if they do not exist yet.
    pub fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        self.block_on(async {
            sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
            Ok(())
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

#[cfg(test)]
impl PgRuntime {
    /// A runtime whose tables live in a fresh schema, or `None` when
    /// `LAKEPURGE_TEST_DATABASE_URL` is unset.
    pub(crate) fn test_or_skip() -> Option<Arc<Self>> {
        let Ok(url) = std::env::var("LAKEPURGE_TEST_DATABASE_URL") else {
            eprintln!("Skipping Postgres test (LAKEPURGE_TEST_DATABASE_URL not set)");
            return None;
        };
        let schema = format!("lakepurge_test_{}", uuid::Uuid::new_v4().simple());

        let admin = Self::connect(&url, 1).expect("connect to test database");
        let ddl = format!("CREATE SCHEMA {schema}");
        admin
            .block_on(sqlx::query(&ddl).execute(admin.pool()))
            .expect("create test schema");

        let separator = if url.contains('?') { '&' } else { '?' };
        let scoped = format!("{url}{separator}options=-c%20search_path%3D{schema}");
        let pg = Self::connect(&scoped, 2).expect("connect to test schema");
        pg.ensure_schema().expect("create tables");
        Some(pg)
    }
}
