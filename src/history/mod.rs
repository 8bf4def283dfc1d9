mod backend;
mod migrations;
mod postgres_store;
mod reader;
mod sqlite_store;

pub use backend::{HistoryBackend, HistoryDatabase};
pub use postgres_store::PostgresHistoryStore;
pub use reader::HistoryReader;
pub use sqlite_store::SqliteHistoryStore;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt::Debug;

/// Durable per-(site, day) snapshot written by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub site_id: i64,
    pub date: NaiveDate,
    /// All-time hits as of the drain that reconciled `date`.
    pub all_hits: i64,
    pub all_visits: i64,
    /// Hits counted during `date` itself.
    pub day_hits: i64,
    pub day_visits: i64,
    pub created_at: DateTime<Utc>,
}

/// Latest durable all-time totals for a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTotal {
    pub site_id: i64,
    pub all_hits: i64,
    pub all_visits: i64,
    pub updated_at: DateTime<Utc>,
}

/// Everything reconciliation read from the volatile store for one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSnapshot {
    pub site_id: i64,
    pub date: NaiveDate,
    pub all_hits: i64,
    pub all_visits: i64,
    pub day_hits: i64,
    pub day_visits: i64,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct HistoryRow {
    pub site_id: i64,
    pub date: String,
    pub all_hits: i64,
    pub all_visits: i64,
    pub day_hits: i64,
    pub day_visits: i64,
    pub created_at: String,
}

impl TryFrom<HistoryRow> for HistoryRecord {
    type Error = anyhow::Error;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(Self {
            site_id: row.site_id,
            date: parse_date(&row.date)?,
            all_hits: row.all_hits,
            all_visits: row.all_visits,
            day_hits: row.day_hits,
            day_visits: row.day_visits,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RunningTotalRow {
    pub site_id: i64,
    pub all_hits: i64,
    pub all_visits: i64,
    pub updated_at: String,
}

impl TryFrom<RunningTotalRow> for RunningTotal {
    type Error = anyhow::Error;

    fn try_from(row: RunningTotalRow) -> Result<Self> {
        Ok(Self {
            site_id: row.site_id,
            all_hits: row.all_hits,
            all_visits: row.all_visits,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid stored date '{}'", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp '{}'", s))
}

/// Durable storage for reconciled counters.
#[async_trait]
pub trait HistoryStore: Debug + Send + Sync {
    /// Close the pool. Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Apply any pending schema migrations. Should be idempotent.
    async fn run_migrations(&self) -> Result<()>;

    /// Insert the history row for (site, date) unless one exists, and upsert the
    /// site's running total, in one transaction.
    ///
    /// Returns true when a new history row was written.
    async fn reconcile_site(&self, snapshot: &SiteSnapshot) -> Result<bool>;

    /// History rows for `site_id` with `begin <= date <= end`, oldest first.
    async fn query_history(
        &self,
        site_id: i64,
        begin: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HistoryRecord>>;

    async fn get_running_total(&self, site_id: i64) -> Result<Option<RunningTotal>>;
}
