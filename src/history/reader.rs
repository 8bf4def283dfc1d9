use crate::error::CounterError;
use crate::history::{HistoryRecord, HistoryStore, RunningTotal};
use chrono::NaiveDate;
use std::sync::Arc;

/// Read-only access to reconciled history.
#[derive(Debug, Clone)]
pub struct HistoryReader {
    store: Arc<dyn HistoryStore>,
}

impl HistoryReader {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Rows for `site_id` dated within `[begin, end]`, oldest first.
    #[tracing::instrument(
        name = "query_history",
        skip(self),
        fields(webcounter.site_id = site_id, webcounter.rows = tracing::field::Empty)
    )]
    pub async fn query_range(
        &self,
        site_id: i64,
        begin: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HistoryRecord>, CounterError> {
        validate_site(site_id)?;
        if begin > end {
            return Err(CounterError::Validation(format!(
                "begin {} is after end {}",
                begin, end
            )));
        }

        let rows = self.store.query_history(site_id, begin, end).await?;
        tracing::Span::current().record("webcounter.rows", rows.len());
        Ok(rows)
    }

    pub async fn running_total(&self, site_id: i64) -> Result<Option<RunningTotal>, CounterError> {
        validate_site(site_id)?;
        Ok(self.store.get_running_total(site_id).await?)
    }
}

fn validate_site(site_id: i64) -> Result<(), CounterError> {
    if site_id <= 0 {
        return Err(CounterError::Validation(format!(
            "site id must be positive, got {}",
            site_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{SiteSnapshot, SqliteHistoryStore};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn reader_with_rows(dir: &TempDir, dates: &[NaiveDate]) -> HistoryReader {
        let path = dir.path().join("history.db");
        let store = SqliteHistoryStore::new(path.to_str().unwrap())
            .await
            .unwrap();
        store.run_migrations().await.unwrap();
        for (i, d) in dates.iter().enumerate() {
            store
                .reconcile_site(&SiteSnapshot {
                    site_id: 42,
                    date: *d,
                    all_hits: 10 * (i as i64 + 1),
                    all_visits: i as i64 + 1,
                    day_hits: 10,
                    day_visits: 1,
                    taken_at: Utc.with_ymd_and_hms(2024, 2, 1, 0, 5, 0).unwrap(),
                })
                .await
                .unwrap();
        }
        HistoryReader::new(Arc::new(store))
    }

    #[tokio::test]
    async fn returns_in_range_rows_ascending() {
        let dir = TempDir::new().unwrap();
        let reader = reader_with_rows(
            &dir,
            &[
                date(2024, 1, 20),
                date(2023, 12, 31),
                date(2024, 1, 1),
                date(2024, 2, 1),
                date(2024, 1, 31),
            ],
        )
        .await;

        let rows = reader
            .query_range(42, date(2024, 1, 1), date(2024, 1, 31))
            .await
            .unwrap();
        let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
        assert_eq!(
            dates,
            vec![date(2024, 1, 1), date(2024, 1, 20), date(2024, 1, 31)]
        );
    }

    #[tokio::test]
    async fn rejects_inverted_range() {
        let dir = TempDir::new().unwrap();
        let reader = reader_with_rows(&dir, &[]).await;
        let result = reader
            .query_range(42, date(2024, 2, 1), date(2024, 1, 1))
            .await;
        assert!(matches!(result, Err(CounterError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_total_is_none() {
        let dir = TempDir::new().unwrap();
        let reader = reader_with_rows(&dir, &[]).await;
        assert!(reader.running_total(7).await.unwrap().is_none());
    }
}
