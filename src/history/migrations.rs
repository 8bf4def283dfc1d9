//! Versioned schema migrations for the history stores.
//!
//! `schema_migrations` records the highest applied version, so deployed
//! databases created at v1 can be altered in place by appending a step here.
//! Both stores share the runner; each supplies its own SQL dialect.

use anyhow::Result;
use futures::future::BoxFuture;

/// Per-backend schema steps. Each `migrate_vN` must be safe to run exactly once.
pub trait HistoryMigrations {
    type Pool;

    fn ensure_migrations_table(pool: &Self::Pool) -> BoxFuture<'_, Result<()>>;
    fn current_version(pool: &Self::Pool) -> BoxFuture<'_, Result<i64>>;
    fn record_version(pool: &Self::Pool, version: i64) -> BoxFuture<'_, Result<()>>;

    fn migrate_v1(pool: &Self::Pool) -> BoxFuture<'_, Result<()>>;
}

pub async fn run_migrations<M: HistoryMigrations>(pool: &M::Pool) -> Result<()> {
    M::ensure_migrations_table(pool).await?;

    let mut current_version = M::current_version(pool).await?;
    let steps: &[(i64, for<'a> fn(&'a M::Pool) -> BoxFuture<'a, Result<()>>)] =
        &[(1, M::migrate_v1)];

    for (version, apply) in steps {
        if current_version < *version {
            apply(pool).await?;
            M::record_version(pool, *version).await?;
            current_version = *version;
        }
    }

    Ok(())
}
