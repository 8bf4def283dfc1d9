use crate::history::backend::HistoryBackend;
use crate::history::migrations::{run_migrations, HistoryMigrations};
use crate::history::{format_date, HistoryRecord, HistoryStore, RunningTotal, SiteSnapshot};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use std::fmt::{self, Debug, Formatter};
use std::str::FromStr;

pub struct PostgresHistoryStore {
    backend: HistoryBackend<Postgres>,
}

impl Debug for PostgresHistoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresHistoryStore")
            .field("pool_size", &self.backend.pool().size())
            .finish()
    }
}

impl PostgresHistoryStore {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let options = PgConnectOptions::from_str(connection_string)?;
        Self::connect_with(options, max_connections).await
    }

    pub async fn connect_with(options: PgConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Ok(Self {
            backend: HistoryBackend::new(pool),
        })
    }

    fn initialize_schema(pool: &PgPool) -> BoxFuture<'_, Result<()>> {
        async move {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS history (
                    site_id BIGINT NOT NULL,
                    date TEXT NOT NULL,
                    all_hits BIGINT NOT NULL,
                    all_visits BIGINT NOT NULL,
                    day_hits BIGINT NOT NULL DEFAULT 0,
                    day_visits BIGINT NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    UNIQUE (site_id, date)
                )",
            )
            .execute(pool)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS running_totals (
                    site_id BIGINT PRIMARY KEY,
                    all_hits BIGINT NOT NULL,
                    all_visits BIGINT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            )
            .execute(pool)
            .await?;

            Ok(())
        }
        .boxed()
    }
}

struct PostgresMigrationBackend;

impl HistoryMigrations for PostgresMigrationBackend {
    type Pool = PgPool;

    fn ensure_migrations_table(pool: &Self::Pool) -> BoxFuture<'_, Result<()>> {
        async move {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version BIGINT PRIMARY KEY,
                    applied_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
                )",
            )
            .execute(pool)
            .await?;
            Ok(())
        }
        .boxed()
    }

    fn current_version(pool: &Self::Pool) -> BoxFuture<'_, Result<i64>> {
        async move {
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(pool)
                .await
                .map_err(Into::into)
        }
        .boxed()
    }

    fn record_version(pool: &Self::Pool, version: i64) -> BoxFuture<'_, Result<()>> {
        async move {
            sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn migrate_v1(pool: &Self::Pool) -> BoxFuture<'_, Result<()>> {
        PostgresHistoryStore::initialize_schema(pool)
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn close(&self) -> Result<()> {
        self.backend.pool().close().await;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        run_migrations::<PostgresMigrationBackend>(self.backend.pool()).await
    }

    async fn reconcile_site(&self, snapshot: &SiteSnapshot) -> Result<bool> {
        self.backend.reconcile_site(snapshot).await
    }

    async fn query_history(
        &self,
        site_id: i64,
        begin: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HistoryRecord>> {
        self.backend
            .query_history(site_id, &format_date(begin), &format_date(end))
            .await
    }

    async fn get_running_total(&self, site_id: i64) -> Result<Option<RunningTotal>> {
        self.backend.get_running_total(site_id).await
    }
}
