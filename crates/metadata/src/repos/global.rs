//! Global-state snapshot repository.

use crate::error::MetadataResult;
use crate::models::MarketStateSnapshot;
use crate::postgres::PostgresStore;
use async_trait::async_trait;

#[async_trait]
pub trait GlobalRepo: Send + Sync {
    /// The chain view recorded by the last successful reconcile, if any.
    async fn market_snapshot(&self) -> MetadataResult<Option<MarketStateSnapshot>>;
}

#[async_trait]
impl GlobalRepo for PostgresStore {
    async fn market_snapshot(&self) -> MetadataResult<Option<MarketStateSnapshot>> {
        let raw: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT metadata -> 'market_state' FROM global")
                .fetch_one(self.pool())
                .await?;
        match raw {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
        }
    }
}
