use crate::counter::{expect_replies, CounterOp, CounterStore};
use crate::error::CounterError;
use crate::keys::{KeyScheme, Metric, Scope};
use crate::session::{IssuedToken, RequestTokens, SessionGate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Counter values as seen by the batch that recorded a hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub all_hits: i64,
    pub today_hits: i64,
    /// Sessions started in the current and the previous online window.
    pub online: i64,
    pub all_visits: i64,
    pub today_visits: i64,
}

/// Result of recording one hit: the counts plus any tokens to hand back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitOutcome {
    pub snapshot: CounterSnapshot,
    pub online_token: Option<IssuedToken>,
    pub visit_token: Option<IssuedToken>,
}

impl HitOutcome {
    pub fn issued_tokens(&self) -> impl Iterator<Item = &IssuedToken> {
        self.online_token.iter().chain(self.visit_token.iter())
    }
}

// Reply positions inside the hit batch.
const ALL_HITS: usize = 0;
const DAY_HITS: usize = 1;
const ONLINE_CURRENT: usize = 2;
const ONLINE_PREVIOUS: usize = 3;
const ALL_VISITS: usize = 4;
const DAY_VISITS: usize = 5;

/// Records hit events as single atomic counter batches.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    store: Arc<dyn CounterStore>,
    keys: KeyScheme,
    gate: SessionGate,
    day_key_margin_secs: i64,
}

impl EventRecorder {
    pub fn new(
        store: Arc<dyn CounterStore>,
        keys: KeyScheme,
        gate: SessionGate,
        day_key_margin_secs: u64,
    ) -> Self {
        Self {
            store,
            keys,
            gate,
            day_key_margin_secs: day_key_margin_secs as i64,
        }
    }

    #[tracing::instrument(
        name = "record_hit",
        skip(self, tokens),
        fields(
            webcounter.site_id = site_id,
            webcounter.new_session = tracing::field::Empty,
            webcounter.new_visit = tracing::field::Empty,
        )
    )]
    pub async fn record_hit(
        &self,
        site_id: i64,
        tokens: &RequestTokens,
        now: DateTime<Utc>,
    ) -> Result<HitOutcome, CounterError> {
        if site_id <= 0 {
            return Err(CounterError::Validation(format!(
                "site id must be positive, got {}",
                site_id
            )));
        }

        let ts = now.timestamp();
        let today = self.keys.day_of(now);
        let window = self.keys.window_of(ts);

        let all_hits = self.keys.key_for(site_id, Metric::Hits, Scope::AllTime);
        let day_hits = self.keys.key_for(site_id, Metric::Hits, Scope::Day(today));
        let online = self
            .keys
            .key_for(site_id, Metric::Online, Scope::OnlineWindow(window));
        let online_previous =
            self.keys
                .key_for(site_id, Metric::Online, Scope::OnlineWindow(window - 1));
        let all_visits = self.keys.key_for(site_id, Metric::Visits, Scope::AllTime);
        let day_visits = self.keys.key_for(site_id, Metric::Visits, Scope::Day(today));

        let decision = self.gate.classify(tokens, ts);
        tracing::Span::current()
            .record("webcounter.new_session", decision.is_new_online_session)
            .record("webcounter.new_visit", decision.is_new_visit);

        let count_or_read = |fresh: bool, key: &str| {
            if fresh {
                CounterOp::incr(key)
            } else {
                CounterOp::get(key)
            }
        };

        let day_expiry = self.keys.end_of_day(today) + self.day_key_margin_secs;
        let online_expiry = self.keys.window_end(window) + self.keys.online_window_secs();

        let ops = vec![
            CounterOp::incr(&all_hits),
            CounterOp::incr(&day_hits),
            count_or_read(decision.is_new_online_session, &online),
            CounterOp::get(&online_previous),
            count_or_read(decision.is_new_visit, &all_visits),
            count_or_read(decision.is_new_visit, &day_visits),
            CounterOp::expire_at(&day_hits, day_expiry),
            CounterOp::expire_at(&day_visits, day_expiry),
            CounterOp::expire_at(&online, online_expiry),
            CounterOp::add_to_set(self.keys.dirty_set_key(), site_id.to_string()),
        ];
        let expected = ops.len();

        let replies = expect_replies(self.store.batch(ops).await?, expected)?;
        let int = |i: usize| replies[i].as_int();

        let snapshot = CounterSnapshot {
            all_hits: int(ALL_HITS)?,
            today_hits: int(DAY_HITS)?,
            online: int(ONLINE_CURRENT)? + int(ONLINE_PREVIOUS)?,
            all_visits: int(ALL_VISITS)?,
            today_visits: int(DAY_VISITS)?,
        };

        Ok(HitOutcome {
            snapshot,
            online_token: decision.online_token,
            visit_token: decision.visit_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;
    use chrono::{FixedOffset, NaiveDate, TimeZone};

    fn recorder(store: Arc<MemoryCounterStore>) -> EventRecorder {
        let keys = KeyScheme::new("wc:", FixedOffset::east_opt(0).unwrap(), 60);
        let gate = SessionGate::new(keys.clone(), None);
        EventRecorder::new(store, keys, gate, 3600)
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[tokio::test]
    async fn first_hit_counts_everything_and_issues_tokens() {
        let store = Arc::new(MemoryCounterStore::new());
        let outcome = recorder(store.clone())
            .record_hit(42, &RequestTokens::none(), at(100))
            .await
            .unwrap();

        assert_eq!(
            outcome.snapshot,
            CounterSnapshot {
                all_hits: 1,
                today_hits: 1,
                online: 1,
                all_visits: 1,
                today_visits: 1,
            }
        );
        assert_eq!(outcome.issued_tokens().count(), 2);
        assert_eq!(store.members("wc:v1:dirty"), vec!["42".to_string()]);
        assert_eq!(store.batch_count(), 1, "one atomic batch per hit");
    }

    #[tokio::test]
    async fn sets_expiries() {
        let store = Arc::new(MemoryCounterStore::new());
        recorder(store.clone())
            .record_hit(42, &RequestTokens::none(), at(100))
            .await
            .unwrap();

        // 1970-01-01 ends at 86400, plus the 3600s margin.
        let day = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        let keys = KeyScheme::new("wc:", FixedOffset::east_opt(0).unwrap(), 60);
        assert_eq!(
            store.expiry(&keys.key_for(42, Metric::Hits, Scope::Day(day))),
            Some(90_000)
        );
        assert_eq!(
            store.expiry(&keys.key_for(42, Metric::Visits, Scope::Day(day))),
            Some(90_000)
        );
        assert_eq!(
            store.expiry(&keys.key_for(42, Metric::Online, Scope::OnlineWindow(1))),
            Some(180)
        );
        assert_eq!(
            store.expiry(&keys.key_for(42, Metric::Hits, Scope::AllTime)),
            None
        );
    }

    #[tokio::test]
    async fn rejects_non_positive_site() {
        let store = Arc::new(MemoryCounterStore::new());
        let result = recorder(store.clone())
            .record_hit(0, &RequestTokens::none(), at(100))
            .await;
        assert!(matches!(result, Err(CounterError::Validation(_))));
        assert_eq!(store.batch_count(), 0);
    }

    #[tokio::test]
    async fn store_failure_propagates_without_retry() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_unavailable(true);
        let result = recorder(store.clone())
            .record_hit(42, &RequestTokens::none(), at(100))
            .await;
        assert!(matches!(result, Err(CounterError::StoreUnavailable(_))));

        store.set_unavailable(false);
        assert_eq!(store.batch_count(), 0);
        assert!(store.members("wc:v1:dirty").is_empty());
    }
}
