use crate::history::backend::HistoryBackend;
use crate::history::migrations::{run_migrations, HistoryMigrations};
use crate::history::{format_date, HistoryRecord, HistoryStore, RunningTotal, SiteSnapshot};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool};
use std::fmt::{self, Debug, Formatter};

pub struct SqliteHistoryStore {
    backend: HistoryBackend<Sqlite>,
    db_path: String,
}

impl Debug for SqliteHistoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteHistoryStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

struct SqliteMigrationBackend;

impl SqliteHistoryStore {
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::with_max_connections(db_path, 5).await
    }

    pub async fn with_max_connections(db_path: &str, max_connections: u32) -> Result<Self> {
        let uri = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&uri)
            .await?;

        Ok(Self {
            backend: HistoryBackend::new(pool),
            db_path: db_path.to_string(),
        })
    }

    fn initialize_schema(pool: &SqlitePool) -> BoxFuture<'_, Result<()>> {
        async move {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS history (
                    site_id INTEGER NOT NULL,
                    date TEXT NOT NULL,
                    all_hits INTEGER NOT NULL,
                    all_visits INTEGER NOT NULL,
                    day_hits INTEGER NOT NULL DEFAULT 0,
                    day_visits INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    UNIQUE (site_id, date)
                )
                "#,
            )
            .execute(pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS running_totals (
                    site_id INTEGER PRIMARY KEY,
                    all_hits INTEGER NOT NULL,
                    all_visits INTEGER NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
            )
            .execute(pool)
            .await?;

            Ok(())
        }
        .boxed()
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn close(&self) -> Result<()> {
        self.backend.pool().close().await;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        run_migrations::<SqliteMigrationBackend>(self.backend.pool()).await
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

impl HistoryMigrations for SqliteMigrationBackend {
    type Pool = SqlitePool;

    fn ensure_migrations_table(pool: &Self::Pool) -> BoxFuture<'_, Result<()>> {
        async move {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )
                "#,
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
            sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
                .bind(version)
                .execute(pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn migrate_v1(pool: &Self::Pool) -> BoxFuture<'_, Result<()>> {
        SqliteHistoryStore::initialize_schema(pool)
    }
}
