//! Materialized-view refresh.

use crate::error::MetadataResult;
use crate::postgres::PostgresStore;
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

/// Refresh order follows dependencies: the prefiltered deal set feeds the
/// per-bucket counts, which feed the overreplication sets.
pub(crate) const MATVIEWS: &[&str] = &[
    "mv_deals_prefiltered_for_repcount",
    "mv_orglocal_presence",
    "mv_replicas_continent",
    "mv_replicas_org",
    "mv_replicas_city",
    "mv_replicas_country",
    "mv_overreplicated_city",
    "mv_overreplicated_country",
    "mv_overreplicated_total",
    "mv_overreplicated_continent",
    "mv_overreplicated_org",
    "mv_pieces_availability",
];

/// Refresh every view inside the caller's transaction. The refresh is
/// transactional: readers keep the previous contents until commit and never
/// observe a partially refreshed set.
pub(crate) async fn refresh_all(tx: &mut Transaction<'_, Postgres>) -> MetadataResult<()> {
    tracing::info!("refreshing materialized views");
    for mv in MATVIEWS {
        let t0 = std::time::Instant::now();
        sqlx::query(&format!("REFRESH MATERIALIZED VIEW {mv}"))
            .execute(&mut **tx)
            .await?;
        sqlx::query(&format!("ANALYZE {mv}"))
            .execute(&mut **tx)
            .await?;
        tracing::info!(view = mv, took_seconds = t0.elapsed().as_secs_f64(), "refreshed");
    }
    Ok(())
}

/// Standalone matview refresh, for jobs whose writes are already committed.
#[async_trait]
pub trait MatviewRepo: Send + Sync {
    async fn refresh_matviews(&self) -> MetadataResult<()>;
}

#[async_trait]
impl MatviewRepo for PostgresStore {
    async fn refresh_matviews(&self) -> MetadataResult<()> {
        let mut tx = self.pool().begin().await?;
        refresh_all(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
