//! Shared job context: store plus chain oracle.

use crate::CommonArgs;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use stevedore_chain::{ChainOracle, LotusClient, LotusOracle};
use stevedore_metadata::{MetadataStore, PostgresStore};

/// Per-call timeout against the primary Lotus endpoint.
const LOTUS_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call timeout for bulk state reads; market walks pull a lot of blocks.
const LOTUS_BLOCKSTORE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct AppCtx {
    pub store: Arc<dyn MetadataStore>,
    pub oracle: Arc<dyn ChainOracle>,
}

impl AppCtx {
    pub async fn init(common: &CommonArgs, blockstore_api: Option<&str>) -> Result<Self> {
        let store = PostgresStore::connect(&common.pg_connstring, 8)
            .await
            .context("connecting to the metadata store")?;

        let api = LotusClient::new(&common.lotus_api, LOTUS_API_TIMEOUT)
            .context("building the lotus api client")?;
        let bs_api = LotusClient::new(
            blockstore_api.unwrap_or(&common.lotus_api),
            LOTUS_BLOCKSTORE_TIMEOUT,
        )
        .context("building the lotus blockstore client")?;

        Ok(Self {
            store: Arc::new(store),
            oracle: Arc::new(LotusOracle::new(api, bs_api, common.lotus_lookback_epochs)),
        })
    }
}
