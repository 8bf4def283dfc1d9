//! Database backend abstraction for reconciled history.
//!
//! [`HistoryBackend`] works with any sqlx database implementing
//! [`HistoryDatabase`] (currently Postgres and SQLite). Both engines accept
//! `INSERT ... ON CONFLICT`, so the idempotent write contract is expressed
//! once here; only parameter syntax and result inspection differ.

use super::{format_date, HistoryRecord, HistoryRow, RunningTotal, RunningTotalRow, SiteSnapshot};
use anyhow::Result;
use sqlx::postgres::PgQueryResult;
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{
    query, query_as, ColumnIndex, Database, Encode, Executor, FromRow, IntoArguments, Pool,
    Postgres, Sqlite, Type,
};
use std::borrow::Cow;

/// Extension trait for sqlx databases with the per-engine bits the backend needs.
pub trait HistoryDatabase: Database {
    /// Returns the parameter placeholder for the given 1-based index.
    ///
    /// - Postgres uses `$1`, `$2`, etc.
    /// - SQLite uses `?` for all parameters (index is ignored).
    fn bind_param(index: usize) -> Cow<'static, str>;

    fn rows_affected(result: &Self::QueryResult) -> u64;
}

impl HistoryDatabase for Postgres {
    fn bind_param(index: usize) -> Cow<'static, str> {
        Cow::Owned(format!("${}", index))
    }

    fn rows_affected(result: &PgQueryResult) -> u64 {
        result.rows_affected()
    }
}

impl HistoryDatabase for Sqlite {
    fn bind_param(_: usize) -> Cow<'static, str> {
        Cow::Borrowed("?")
    }

    fn rows_affected(result: &SqliteQueryResult) -> u64 {
        result.rows_affected()
    }
}

/// Generic database backend for history operations.
pub struct HistoryBackend<DB: HistoryDatabase> {
    pool: Pool<DB>,
}

impl<DB: HistoryDatabase> HistoryBackend<DB> {
    pub fn new(pool: Pool<DB>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }
}

impl<DB> HistoryBackend<DB>
where
    DB: HistoryDatabase,
    HistoryRow: for<'r> FromRow<'r, DB::Row>,
    RunningTotalRow: for<'r> FromRow<'r, DB::Row>,
    for<'q> &'q str: Encode<'q, DB> + Type<DB>,
    for<'q> i64: Encode<'q, DB> + Type<DB>,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB> + Send,
    for<'c> &'c Pool<DB>: Executor<'c, Database = DB>,
    for<'c> &'c mut <DB as Database>::Connection: Executor<'c, Database = DB>,
    usize: ColumnIndex<DB::Row>,
{
    #[tracing::instrument(
        name = "history_reconcile_site",
        skip(self, snapshot),
        fields(
            webcounter.site_id = snapshot.site_id,
            webcounter.date = %snapshot.date,
        )
    )]
    pub async fn reconcile_site(&self, snapshot: &SiteSnapshot) -> Result<bool> {
        let date = format_date(snapshot.date);
        let taken_at = snapshot.taken_at.to_rfc3339();

        let insert_history_sql = format!(
            "INSERT INTO history (site_id, date, all_hits, all_visits, day_hits, day_visits, created_at) \
             VALUES ({}, {}, {}, {}, {}, {}, {}) \
             ON CONFLICT (site_id, date) DO NOTHING",
            DB::bind_param(1),
            DB::bind_param(2),
            DB::bind_param(3),
            DB::bind_param(4),
            DB::bind_param(5),
            DB::bind_param(6),
            DB::bind_param(7),
        );

        let upsert_total_sql = format!(
            "INSERT INTO running_totals (site_id, all_hits, all_visits, updated_at) \
             VALUES ({}, {}, {}, {}) \
             ON CONFLICT (site_id) DO UPDATE SET \
             all_hits = excluded.all_hits, \
             all_visits = excluded.all_visits, \
             updated_at = excluded.updated_at",
            DB::bind_param(1),
            DB::bind_param(2),
            DB::bind_param(3),
            DB::bind_param(4),
        );

        let mut tx = self.pool.begin().await?;

        let result = query(&insert_history_sql)
            .bind(snapshot.site_id)
            .bind(date.as_str())
            .bind(snapshot.all_hits)
            .bind(snapshot.all_visits)
            .bind(snapshot.day_hits)
            .bind(snapshot.day_visits)
            .bind(taken_at.as_str())
            .execute(&mut *tx)
            .await?;
        let inserted = DB::rows_affected(&result) > 0;

        query(&upsert_total_sql)
            .bind(snapshot.site_id)
            .bind(snapshot.all_hits)
            .bind(snapshot.all_visits)
            .bind(taken_at.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(inserted)
    }

    pub async fn query_history(
        &self,
        site_id: i64,
        begin: &str,
        end: &str,
    ) -> Result<Vec<HistoryRecord>> {
        let sql = format!(
            "SELECT site_id, date, all_hits, all_visits, day_hits, day_visits, created_at \
             FROM history WHERE site_id = {} AND date >= {} AND date <= {} \
             ORDER BY date ASC",
            DB::bind_param(1),
            DB::bind_param(2),
            DB::bind_param(3),
        );

        query_as::<DB, HistoryRow>(&sql)
            .bind(site_id)
            .bind(begin)
            .bind(end)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(HistoryRecord::try_from)
            .collect()
    }

    pub async fn get_running_total(&self, site_id: i64) -> Result<Option<RunningTotal>> {
        let sql = format!(
            "SELECT site_id, all_hits, all_visits, updated_at FROM running_totals WHERE site_id = {}",
            DB::bind_param(1)
        );

        query_as::<DB, RunningTotalRow>(&sql)
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await?
            .map(RunningTotal::try_from)
            .transpose()
    }
}
