//! Moves counters from the volatile store into durable history.
//!
//! A cycle drains the dirty-site set in one atomic batch, then reconciles each
//! drained site independently. A site-day that fails is put back in the dirty
//! set together with its date, so a later cycle retries that same day rather
//! than whichever day has just completed.

mod scheduler;

pub use scheduler::FlushScheduler;

use crate::counter::{expect_replies, CounterOp, CounterStore, CounterStoreError};
use crate::error::CounterError;
use crate::history::{HistoryStore, SiteSnapshot};
use crate::keys::{DirtyMember, KeyScheme, Metric, Scope};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    /// A new history row was written for the date.
    Recorded,
    /// The history row already existed; only the running total was refreshed.
    AlreadyRecorded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteOutcome {
    pub site_id: i64,
    pub date: NaiveDate,
    pub status: SiteStatus,
    pub all_hits: i64,
    pub all_visits: i64,
    pub day_hits: i64,
    pub day_visits: i64,
    /// Put back in the dirty set for the next cycle.
    pub requeued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SiteOutcome {
    fn failed(site_id: i64, date: NaiveDate, error: String, requeued: bool) -> Self {
        Self {
            site_id,
            date,
            status: SiteStatus::Failed,
            all_hits: 0,
            all_visits: 0,
            day_hits: 0,
            day_visits: 0,
            requeued,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// The day that completed before the flush. Pending retries may cover earlier days.
    pub date: NaiveDate,
    /// One per reconciled site-day.
    pub sites_processed: usize,
    pub sites_succeeded: usize,
    pub sites_failed: usize,
    /// Dirty-set members that were not valid site ids.
    pub members_skipped: usize,
    pub duration_ms: u64,
    pub outcomes: Vec<SiteOutcome>,
}

/// Runs reconciliation cycles against a counter store and a history store.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn CounterStore>,
    history: Arc<dyn HistoryStore>,
    keys: KeyScheme,
    parallelism: usize,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        history: Arc<dyn HistoryStore>,
        keys: KeyScheme,
        parallelism: usize,
    ) -> Self {
        Self {
            store,
            history,
            keys,
            parallelism: parallelism.max(1),
        }
    }

    pub fn keys(&self) -> &KeyScheme {
        &self.keys
    }

    /// Run one cycle, reconciling the local day that completed before `now`
    /// plus any earlier days left pending by failed cycles.
    ///
    /// Fails only when the drain itself fails, in which case nothing was drained.
    /// Per-site failures are reported in the returned report.
    #[tracing::instrument(
        name = "reconcile_flush",
        skip(self),
        fields(
            webcounter.date = tracing::field::Empty,
            webcounter.sites = tracing::field::Empty,
            webcounter.failed = tracing::field::Empty,
        )
    )]
    pub async fn flush(&self, now: DateTime<Utc>) -> Result<ReconciliationReport, CounterError> {
        let start = std::time::Instant::now();
        let date = self.keys.completed_day(now);
        let today = self.keys.day_of(now);
        tracing::Span::current().record("webcounter.date", tracing::field::display(date));

        let members = self.drain().await?;

        let mut sites: BTreeMap<i64, BTreeSet<NaiveDate>> = BTreeMap::new();
        let mut members_skipped = 0;
        for member in members {
            match DirtyMember::parse(&member) {
                Some(DirtyMember::Site(id)) => {
                    sites.entry(id).or_default().insert(date);
                }
                Some(DirtyMember::Pending(id, pending)) => {
                    sites.entry(id).or_default().insert(pending);
                }
                None => {
                    warn!(member = %member, "Dropping malformed dirty-set member");
                    members_skipped += 1;
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::with_capacity(sites.len());

        for (site_id, dates) in sites {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CounterError::Durable(format!("flush semaphore closed: {}", e)))?;
            let worker = SiteWorker {
                store: self.store.clone(),
                history: self.history.clone(),
                keys: self.keys.clone(),
            };

            let task_dates: Vec<NaiveDate> = dates.iter().copied().collect();
            let handle = tokio::spawn(async move {
                let mut outcomes = Vec::with_capacity(task_dates.len());
                for day in task_dates {
                    outcomes.push(worker.reconcile(site_id, day, today, now).await);
                }
                drop(permit);
                outcomes
            });
            handles.push((site_id, dates, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (site_id, dates, handle) in handles {
            match handle.await {
                Ok(site_outcomes) => outcomes.extend(site_outcomes),
                Err(e) => {
                    warn!(site_id, error = %e, "Site reconciliation task failed");
                    for day in dates {
                        let requeued =
                            requeue(self.store.as_ref(), &self.keys, site_id, day, true).await;
                        outcomes.push(SiteOutcome::failed(
                            site_id,
                            day,
                            format!("task failed: {}", e),
                            requeued,
                        ));
                    }
                }
            }
        }

        let sites_failed = outcomes
            .iter()
            .filter(|o| o.status == SiteStatus::Failed)
            .count();
        let report = ReconciliationReport {
            date,
            sites_processed: outcomes.len(),
            sites_succeeded: outcomes.len() - sites_failed,
            sites_failed,
            members_skipped,
            duration_ms: start.elapsed().as_millis() as u64,
            outcomes,
        };

        tracing::Span::current()
            .record("webcounter.sites", report.sites_processed)
            .record("webcounter.failed", report.sites_failed);
        info!(
            date = %report.date,
            processed = report.sites_processed,
            failed = report.sites_failed,
            skipped = report.members_skipped,
            "Reconciliation cycle finished"
        );

        Ok(report)
    }

    /// Read and clear the dirty set in one batch.
    async fn drain(&self) -> Result<Vec<String>, CounterError> {
        let dirty = self.keys.dirty_set_key();
        let replies = expect_replies(
            self.store
                .batch(vec![CounterOp::read_set(&dirty), CounterOp::delete(&dirty)])
                .await?,
            2,
        )?;
        let members = replies
            .into_iter()
            .next()
            .ok_or_else(|| CounterStoreError::UnexpectedReply("empty drain reply".to_string()))?
            .into_members()?;
        Ok(members)
    }
}

struct SiteWorker {
    store: Arc<dyn CounterStore>,
    history: Arc<dyn HistoryStore>,
    keys: KeyScheme,
}

impl SiteWorker {
    #[tracing::instrument(
        name = "reconcile_site",
        skip(self, today, now),
        fields(webcounter.site_id = site_id, webcounter.date = %date)
    )]
    async fn reconcile(
        &self,
        site_id: i64,
        date: NaiveDate,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> SiteOutcome {
        let day_hits_key = self.keys.key_for(site_id, Metric::Hits, Scope::Day(date));
        let day_visits_key = self.keys.key_for(site_id, Metric::Visits, Scope::Day(date));

        let counts = match self.read_counts(site_id, &day_hits_key, &day_visits_key, today).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(site_id, error = %e, "Failed to read counters for site");
                // Unknown whether today has hits, so keep today's mark too.
                let requeued = requeue(self.store.as_ref(), &self.keys, site_id, date, true).await;
                return SiteOutcome::failed(site_id, date, e.to_string(), requeued);
            }
        };

        // Hits after local midnight belong to a day that is not reconciled yet.
        let carry_over = counts.today_hits > 0;

        let snapshot = SiteSnapshot {
            site_id,
            date,
            all_hits: counts.all_hits,
            all_visits: counts.all_visits,
            day_hits: counts.day_hits,
            day_visits: counts.day_visits,
            taken_at: now,
        };

        let inserted = match self.history.reconcile_site(&snapshot).await {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(site_id, error = %format!("{:#}", e), "Durable write failed for site");
                let requeued =
                    requeue(self.store.as_ref(), &self.keys, site_id, date, carry_over).await;
                return SiteOutcome::failed(site_id, date, format!("{:#}", e), requeued);
            }
        };

        let mut cleanup = vec![
            CounterOp::delete(&day_hits_key),
            CounterOp::delete(&day_visits_key),
        ];
        if carry_over {
            cleanup.push(CounterOp::add_to_set(
                self.keys.dirty_set_key(),
                DirtyMember::Site(site_id).to_string(),
            ));
        }

        let mut requeued = carry_over;
        if let Err(e) = self.store.batch(cleanup).await {
            // The day keys still expire on their own.
            warn!(site_id, error = %e, "Failed to clean up day keys for site");
            if carry_over {
                requeued = add_members(
                    self.store.as_ref(),
                    &self.keys,
                    site_id,
                    vec![DirtyMember::Site(site_id)],
                )
                .await;
            }
        }

        SiteOutcome {
            site_id,
            date,
            status: if inserted {
                SiteStatus::Recorded
            } else {
                SiteStatus::AlreadyRecorded
            },
            all_hits: counts.all_hits,
            all_visits: counts.all_visits,
            day_hits: counts.day_hits,
            day_visits: counts.day_visits,
            requeued,
            error: None,
        }
    }

    async fn read_counts(
        &self,
        site_id: i64,
        day_hits_key: &str,
        day_visits_key: &str,
        today: NaiveDate,
    ) -> Result<SiteCounts, CounterStoreError> {
        let ops = vec![
            CounterOp::get(self.keys.key_for(site_id, Metric::Hits, Scope::AllTime)),
            CounterOp::get(self.keys.key_for(site_id, Metric::Visits, Scope::AllTime)),
            CounterOp::get(day_hits_key),
            CounterOp::get(day_visits_key),
            CounterOp::get(self.keys.key_for(site_id, Metric::Hits, Scope::Day(today))),
        ];
        let replies = expect_replies(self.store.batch(ops).await?, 5)?;

        Ok(SiteCounts {
            all_hits: replies[0].as_int()?,
            all_visits: replies[1].as_int()?,
            day_hits: replies[2].as_int()?,
            day_visits: replies[3].as_int()?,
            today_hits: replies[4].as_int()?,
        })
    }
}

struct SiteCounts {
    all_hits: i64,
    all_visits: i64,
    day_hits: i64,
    day_visits: i64,
    today_hits: i64,
}

/// Mark `date` as pending for the site, and optionally the site itself for the
/// next completed day.
async fn requeue(
    store: &dyn CounterStore,
    keys: &KeyScheme,
    site_id: i64,
    date: NaiveDate,
    with_today: bool,
) -> bool {
    let mut members = vec![DirtyMember::Pending(site_id, date)];
    if with_today {
        members.push(DirtyMember::Site(site_id));
    }
    add_members(store, keys, site_id, members).await
}

async fn add_members(
    store: &dyn CounterStore,
    keys: &KeyScheme,
    site_id: i64,
    members: Vec<DirtyMember>,
) -> bool {
    let dirty = keys.dirty_set_key();
    let ops = members
        .iter()
        .map(|m| CounterOp::add_to_set(&dirty, m.to_string()))
        .collect();
    match store.batch(ops).await {
        Ok(_) => true,
        Err(e) => {
            tracing::error!(site_id, error = %e, "Failed to requeue site; it will be retried on its next hit");
            false
        }
    }
}
