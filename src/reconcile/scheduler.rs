use super::{ReconciliationEngine, ReconciliationReport};
use crate::counter::CounterStore;
use crate::error::CounterError;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fires one reconciliation cycle per day at a fixed local time.
///
/// Several server instances may run a scheduler against the same store; a
/// short-lived lease makes sure only one of them flushes per tick.
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    engine: Arc<ReconciliationEngine>,
    store: Arc<dyn CounterStore>,
    at: NaiveTime,
    lock_ttl_secs: u64,
    owner: String,
}

impl FlushScheduler {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        store: Arc<dyn CounterStore>,
        at: NaiveTime,
        lock_ttl_secs: u64,
    ) -> Self {
        Self {
            engine,
            store,
            at,
            lock_ttl_secs: lock_ttl_secs.max(1),
            owner: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// First instant strictly after `now` whose local wall time equals `at`.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.engine.keys().offset();
        let local = now.with_timezone(&offset);

        let mut date = local.date_naive();
        loop {
            let candidate = offset
                .from_local_datetime(&date.and_time(self.at))
                .single()
                .map(|dt| dt.with_timezone(&Utc));
            match candidate {
                Some(fire) if fire > now => return fire,
                _ => match date.succ_opt() {
                    Some(next) => date = next,
                    None => return now + Duration::days(1),
                },
            }
        }
    }

    /// Run a cycle if this instance wins the flush lease.
    ///
    /// Returns `Ok(None)` when another instance holds the lease.
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationReport>, CounterError> {
        let lock_key = self.engine.keys().flush_lock_key();
        if !self
            .store
            .try_acquire_lease(&lock_key, &self.owner, self.lock_ttl_secs)
            .await?
        {
            info!(lock = %lock_key, "Flush lease held elsewhere; skipping this tick");
            return Ok(None);
        }

        let result = self.engine.flush(now).await;

        if let Err(e) = self.store.release_lease(&lock_key, &self.owner).await {
            warn!(lock = %lock_key, error = %e, "Failed to release flush lease; it will expire");
        }

        result.map(Some)
    }

    /// Spawn the daily loop. It exits when `shutdown` is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let fire = self.next_fire(now);
                let wait = (fire - now).to_std().unwrap_or_default();
                info!(next_flush = %fire, "Flush scheduled");

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Flush scheduler received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        match self.run_once(Utc::now()).await {
                            Ok(Some(report)) if report.sites_failed > 0 => {
                                warn!(
                                    date = %report.date,
                                    failed = report.sites_failed,
                                    "Scheduled flush finished with failures"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Scheduled flush failed"),
                        }
                    }
                }
            }
        })
    }
}
