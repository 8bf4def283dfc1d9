use crate::config::AppConfig;
use crate::counter::{CounterStore, RedisCounterStore};
use crate::error::CounterError;
use crate::history::{
    HistoryReader, HistoryRecord, HistoryStore, PostgresHistoryStore, RunningTotal,
    SqliteHistoryStore,
};
use crate::keys::KeyScheme;
use crate::reconcile::{FlushScheduler, ReconciliationEngine, ReconciliationReport};
use crate::recorder::{EventRecorder, HitOutcome};
use crate::session::{RequestTokens, SessionGate};
use crate::signature::{HmacVerifier, SignatureVerifier};
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEFAULT_ONLINE_WINDOW_SECS: u64 = 60;
const DEFAULT_DAY_KEY_MARGIN_SECS: u64 = 2 * 24 * 3600;
const DEFAULT_FLUSH_PARALLELISM: usize = 4;
const DEFAULT_LOCK_TTL_SECS: u64 = 600;

/// Ties the volatile counters, durable history and request authentication together.
pub struct CounterEngine {
    store: Arc<dyn CounterStore>,
    history: Arc<dyn HistoryStore>,
    keys: KeyScheme,
    recorder: EventRecorder,
    reconciler: Arc<ReconciliationEngine>,
    reader: HistoryReader,
    verifier: Arc<dyn SignatureVerifier>,
    scheduler: FlushScheduler,
    shutdown_token: CancellationToken,
    scheduler_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for CounterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterEngine")
            .field("store", &self.store)
            .field("history", &self.history)
            .field("keys", &self.keys)
            .finish()
    }
}

impl CounterEngine {
    pub fn builder() -> CounterEngineBuilder {
        CounterEngineBuilder::new()
    }

    /// Connect the configured stores and build an engine.
    ///
    /// The daily flush is started when `flush.enabled` is set.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let secret = config
            .auth
            .hmac_secret
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("auth.hmac_secret is required"))?;

        let store = RedisCounterStore::new(&config.redis.url())
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.redis.url()))?;
        info!(host = %config.redis.host, port = config.redis.port, "Connected to Redis");

        let history = Self::create_history_from_config(config).await?;

        let engine = Self::builder()
            .counter_store(Arc::new(store))
            .history_store(history)
            .verifier(Arc::new(HmacVerifier::new(secret)?))
            .key_prefix(&config.redis.key_prefix)
            .utc_offset(config.counter.offset()?)
            .online_window_secs(config.counter.online_window_secs)
            .day_key_margin_secs(config.counter.day_key_margin_secs)
            .visit_token_max_age_secs(config.counter.visit_token_max_age_secs)
            .flush_at(config.flush.time_of_day()?)
            .flush_parallelism(config.flush.parallelism)
            .lock_ttl_secs(config.flush.lock_ttl_secs)
            .build()
            .await?;

        if config.flush.enabled {
            engine.start_scheduler().await;
        }

        Ok(engine)
    }

    async fn create_history_from_config(config: &AppConfig) -> Result<Arc<dyn HistoryStore>> {
        match config.database.database_type.as_str() {
            "postgres" => {
                let options = config.database.postgres_options().ok_or_else(|| {
                    anyhow::anyhow!("Postgres database requires host, database, user and password")
                })?;
                let store = PostgresHistoryStore::connect_with(
                    options,
                    config.database.max_connections,
                )
                .await?;
                info!("Using Postgres history store");
                Ok(Arc::new(store))
            }
            "sqlite" => {
                let store = SqliteHistoryStore::with_max_connections(
                    &config.database.path,
                    config.database.max_connections,
                )
                .await
                .with_context(|| format!("Failed to open {}", config.database.path))?;
                info!(path = %config.database.path, "Using SQLite history store");
                Ok(Arc::new(store))
            }
            other => anyhow::bail!("Unsupported database type: {}", other),
        }
    }

    pub fn keys(&self) -> &KeyScheme {
        &self.keys
    }

    pub fn counter_store(&self) -> Arc<dyn CounterStore> {
        self.store.clone()
    }

    pub fn verifier(&self) -> &dyn SignatureVerifier {
        self.verifier.as_ref()
    }

    pub async fn record_hit(
        &self,
        site_id: i64,
        tokens: &RequestTokens,
        now: DateTime<Utc>,
    ) -> Result<HitOutcome, CounterError> {
        self.recorder.record_hit(site_id, tokens, now).await
    }

    /// Run one reconciliation cycle immediately.
    pub async fn flush(&self, now: DateTime<Utc>) -> Result<ReconciliationReport, CounterError> {
        self.reconciler.flush(now).await
    }

    pub async fn query_history(
        &self,
        site_id: i64,
        begin: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HistoryRecord>, CounterError> {
        self.reader.query_range(site_id, begin, end).await
    }

    pub async fn running_total(&self, site_id: i64) -> Result<Option<RunningTotal>, CounterError> {
        self.reader.running_total(site_id).await
    }

    /// Start the daily flush loop. Calling it again while running is a no-op.
    pub async fn start_scheduler(&self) {
        let mut handle = self.scheduler_handle.lock().await;
        if handle.is_none() {
            *handle = Some(self.scheduler.clone().start(self.shutdown_token.clone()));
        }
    }

    /// Stop background work and close the durable store.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();

        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        self.history.close().await
    }
}

impl Drop for CounterEngine {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

/// Builder for [`CounterEngine`].
///
/// Stores and the verifier must be supplied; everything else has defaults
/// matching the configuration defaults.
pub struct CounterEngineBuilder {
    store: Option<Arc<dyn CounterStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    key_prefix: String,
    utc_offset: FixedOffset,
    online_window_secs: u64,
    day_key_margin_secs: u64,
    visit_token_max_age_secs: Option<u64>,
    flush_at: NaiveTime,
    flush_parallelism: usize,
    lock_ttl_secs: u64,
    run_migrations: bool,
}

impl Default for CounterEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterEngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            history: None,
            verifier: None,
            key_prefix: crate::config::default_key_prefix(),
            utc_offset: Utc.fix(),
            online_window_secs: DEFAULT_ONLINE_WINDOW_SECS,
            day_key_margin_secs: DEFAULT_DAY_KEY_MARGIN_SECS,
            visit_token_max_age_secs: None,
            flush_at: NaiveTime::from_hms_opt(0, 5, 0).unwrap_or_default(),
            flush_parallelism: DEFAULT_FLUSH_PARALLELISM,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            run_migrations: true,
        }
    }

    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn history_store(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Convenience for an HMAC verifier over `secret`.
    pub fn hmac_secret(self, secret: &str) -> Result<Self> {
        Ok(self.verifier(Arc::new(HmacVerifier::new(secret)?)))
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    pub fn online_window_secs(mut self, secs: u64) -> Self {
        self.online_window_secs = secs;
        self
    }

    pub fn day_key_margin_secs(mut self, secs: u64) -> Self {
        self.day_key_margin_secs = secs;
        self
    }

    pub fn visit_token_max_age_secs(mut self, secs: Option<u64>) -> Self {
        self.visit_token_max_age_secs = secs;
        self
    }

    pub fn flush_at(mut self, at: NaiveTime) -> Self {
        self.flush_at = at;
        self
    }

    pub fn flush_parallelism(mut self, parallelism: usize) -> Self {
        self.flush_parallelism = parallelism;
        self
    }

    pub fn lock_ttl_secs(mut self, secs: u64) -> Self {
        self.lock_ttl_secs = secs;
        self
    }

    /// Skip schema migrations on build (the caller already ran them).
    pub fn skip_migrations(mut self) -> Self {
        self.run_migrations = false;
        self
    }

    pub async fn build(self) -> Result<CounterEngine> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("counter store not configured"))?;
        let history = self
            .history
            .ok_or_else(|| anyhow::anyhow!("history store not configured"))?;
        let verifier = self
            .verifier
            .ok_or_else(|| anyhow::anyhow!("signature verifier not configured"))?;

        if self.online_window_secs == 0 {
            anyhow::bail!("online window must be positive");
        }

        if self.run_migrations {
            history
                .run_migrations()
                .await
                .context("Failed to migrate history store")?;
        }

        let keys = KeyScheme::new(self.key_prefix, self.utc_offset, self.online_window_secs);
        let gate = SessionGate::new(keys.clone(), self.visit_token_max_age_secs);
        let recorder = EventRecorder::new(
            store.clone(),
            keys.clone(),
            gate,
            self.day_key_margin_secs,
        );
        let reconciler = Arc::new(ReconciliationEngine::new(
            store.clone(),
            history.clone(),
            keys.clone(),
            self.flush_parallelism,
        ));
        let reader = HistoryReader::new(history.clone());
        let scheduler = FlushScheduler::new(
            reconciler.clone(),
            store.clone(),
            self.flush_at,
            self.lock_ttl_secs,
        );

        Ok(CounterEngine {
            store,
            history,
            keys,
            recorder,
            reconciler,
            reader,
            verifier,
            scheduler,
            shutdown_token: CancellationToken::new(),
            scheduler_handle: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn build_requires_stores() {
        let result = CounterEngine::builder().build().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn scheduler_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let history = SqliteHistoryStore::new(dir.path().join("h.db").to_str().unwrap())
            .await
            .unwrap();
        let engine = CounterEngine::builder()
            .counter_store(Arc::new(MemoryCounterStore::new()))
            .history_store(Arc::new(history))
            .hmac_secret("secret")
            .unwrap()
            .build()
            .await
            .unwrap();

        engine.start_scheduler().await;
        assert!(engine.scheduler_handle.lock().await.is_some());

        engine.shutdown().await.unwrap();
        assert!(engine.shutdown_token.is_cancelled());
        assert!(engine.scheduler_handle.lock().await.is_none());
    }
}
