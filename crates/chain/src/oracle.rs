//! The chain-oracle seam consumed by the cron jobs.

use crate::blockstore::RpcBlockstore;
use crate::error::{ChainError, ChainResult};
use crate::market::{self, MarketDealEntry};
use crate::rpc::{CidJson, LotusClient};
use async_trait::async_trait;
use base64::Engine;
use cid::Cid;
use serde::Deserialize;
use stevedore_core::address::{ActorId, Address};

/// The storage market actor's well-known address.
pub const MARKET_ACTOR_ADDR: &str = "f05";

/// A pinned chain view: tipset key plus its height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipSet {
    pub key: Vec<Cid>,
    pub height: i64,
}

impl TipSet {
    fn key_json(&self) -> Vec<CidJson> {
        self.key.iter().map(|c| CidJson(*c)).collect()
    }

    /// Compact display form of the key, for logs and the global snapshot.
    pub fn key_strings(&self) -> Vec<String> {
        self.key.iter().map(|c| c.to_string()).collect()
    }
}

/// Provider info attested on chain.
#[derive(Debug, Clone, Default)]
pub struct MinerInfo {
    pub peer_id: Option<String>,
    /// Raw multiaddr bytes as attested; parsing happens at the dial site.
    pub multiaddrs: Vec<Vec<u8>>,
    pub sector_log2_size: u8,
}

/// Provider power summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinerPower {
    pub has_min_power: bool,
}

/// Everything the broker asks of the chain.
#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// The tipset `lookback` epochs behind head, the view every run pins.
    async fn lookback_tipset(&self) -> ChainResult<TipSet>;

    /// All deals in the market actor at the given tipset.
    async fn market_deals(&self, ts: &TipSet) -> ChainResult<Vec<MarketDealEntry>>;

    /// Remaining verified-client datacap, or None for non-verified clients.
    async fn verified_client_datacap(
        &self,
        client: &Address,
        ts: &TipSet,
    ) -> ChainResult<Option<i64>>;

    /// Dereference an ID address to its robust key address.
    async fn account_key(&self, id: &Address) -> ChainResult<Address>;

    /// A provider's attested dialing/sector info.
    async fn miner_info(&self, provider: ActorId, ts: &TipSet) -> ChainResult<MinerInfo>;

    /// A provider's power standing.
    async fn miner_power(&self, provider: ActorId, ts: &TipSet) -> ChainResult<MinerPower>;
}

#[derive(Deserialize)]
struct TipSetJson {
    #[serde(rename = "Cids")]
    cids: Vec<CidJson>,
    #[serde(rename = "Height")]
    height: i64,
}

impl From<TipSetJson> for TipSet {
    fn from(ts: TipSetJson) -> Self {
        TipSet {
            key: ts.cids.into_iter().map(|c| c.0).collect(),
            height: ts.height,
        }
    }
}

#[derive(Deserialize)]
struct ActorStateJson {
    #[serde(rename = "Head")]
    head: CidJson,
}

#[derive(Deserialize)]
struct MinerInfoJson {
    #[serde(rename = "PeerId")]
    peer_id: Option<String>,
    #[serde(rename = "Multiaddrs")]
    multiaddrs: Option<Vec<String>>,
    #[serde(rename = "SectorSize")]
    sector_size: u64,
}

#[derive(Deserialize)]
struct MinerPowerJson {
    #[serde(rename = "HasMinPower")]
    has_min_power: bool,
}

/// Production oracle over a Lotus daemon. State walking goes through a
/// second endpoint (`lotus-api-blockstore`) so bulk `ChainReadObj` traffic
/// can be pointed at a beefier node.
pub struct LotusOracle {
    api: LotusClient,
    blockstore: RpcBlockstore,
    lookback_epochs: u64,
}

impl LotusOracle {
    pub fn new(api: LotusClient, blockstore_api: LotusClient, lookback_epochs: u64) -> Self {
        Self {
            api,
            blockstore: RpcBlockstore::new(blockstore_api),
            lookback_epochs,
        }
    }
}

#[async_trait]
impl ChainOracle for LotusOracle {
    async fn lookback_tipset(&self) -> ChainResult<TipSet> {
        let head: TipSetJson = self
            .api
            .call("Filecoin.ChainHead", Vec::<i64>::new())
            .await?;
        let target = head.height.saturating_sub(self.lookback_epochs as i64).max(0);
        let pinned: TipSetJson = self
            .api
            .call(
                "Filecoin.ChainGetTipSetByHeight",
                (target, head.cids.clone()),
            )
            .await?;
        Ok(pinned.into())
    }

    async fn market_deals(&self, ts: &TipSet) -> ChainResult<Vec<MarketDealEntry>> {
        let actor: ActorStateJson = self
            .api
            .call("Filecoin.StateGetActor", (MARKET_ACTOR_ADDR, ts.key_json()))
            .await?;
        market::load_market_deals(&self.blockstore, &actor.head.0).await
    }

    async fn verified_client_datacap(
        &self,
        client: &Address,
        ts: &TipSet,
    ) -> ChainResult<Option<i64>> {
        let datacap: Option<String> = self
            .api
            .call(
                "Filecoin.StateVerifiedClientStatus",
                (client.to_string(), ts.key_json()),
            )
            .await?;
        datacap
            .map(|s| {
                s.parse::<i128>()
                    .map(|v| v.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
                    .map_err(|e| ChainError::Decode(format!("datacap '{s}': {e}")))
            })
            .transpose()
    }

    async fn account_key(&self, id: &Address) -> ChainResult<Address> {
        let robust: String = self
            .api
            .call(
                "Filecoin.StateAccountKey",
                (id.to_string(), Vec::<CidJson>::new()),
            )
            .await?;
        robust
            .parse()
            .map_err(|e| ChainError::Decode(format!("account key '{robust}': {e}")))
    }

    async fn miner_info(&self, provider: ActorId, ts: &TipSet) -> ChainResult<MinerInfo> {
        let info: MinerInfoJson = self
            .api
            .call(
                "Filecoin.StateMinerInfo",
                (provider.to_string(), ts.key_json()),
            )
            .await?;
        if !info.sector_size.is_power_of_two() {
            return Err(ChainError::Decode(format!(
                "{provider} attests non-power-of-two sector size {}",
                info.sector_size
            )));
        }
        let mut multiaddrs = Vec::new();
        for encoded in info.multiaddrs.unwrap_or_default() {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&encoded)
                .map_err(|e| ChainError::Decode(format!("{provider} multiaddr: {e}")))?;
            multiaddrs.push(bytes);
        }
        Ok(MinerInfo {
            peer_id: info.peer_id,
            multiaddrs,
            sector_log2_size: info.sector_size.trailing_zeros() as u8,
        })
    }

    async fn miner_power(&self, provider: ActorId, ts: &TipSet) -> ChainResult<MinerPower> {
        let power: MinerPowerJson = self
            .api
            .call(
                "Filecoin.StateMinerPower",
                (provider.to_string(), ts.key_json()),
            )
            .await?;
        Ok(MinerPower {
            has_min_power: power.has_min_power,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn client(server: &MockServer) -> LotusClient {
        LotusClient::new(server.url(""), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn lookback_tipset_pins_behind_head() {
        let server = MockServer::start();
        let head_cid = "bafy2bzaceaxm23epjsmh75yvzcecsrbavlmkcxnva66bkdebdcnyw3bjrc74u";

        server.mock(|when, then| {
            when.method(POST)
                .body_contains("Filecoin.ChainHead");
            then.status(200).json_body(serde_json::json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {"Cids": [{"/": head_cid}], "Blocks": [], "Height": 4000}
            }));
        });
        server.mock(|when, then| {
            when.method(POST)
                .body_contains("Filecoin.ChainGetTipSetByHeight")
                .body_contains("3990");
            then.status(200).json_body(serde_json::json!({
                "jsonrpc": "2.0", "id": 2,
                "result": {"Cids": [{"/": head_cid}], "Blocks": [], "Height": 3990}
            }));
        });

        let oracle = LotusOracle::new(client(&server), client(&server), 10);
        let ts = oracle.lookback_tipset().await.unwrap();
        assert_eq!(ts.height, 3990);
        assert_eq!(ts.key.len(), 1);
    }

    #[tokio::test]
    async fn datacap_parses_and_passes_null_through() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).body_contains("f0100");
            then.status(200).json_body(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": "1099511627776"
            }));
        });
        server.mock(|when, then| {
            when.method(POST).body_contains("f0200");
            then.status(200).json_body(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": null
            }));
        });

        let oracle = LotusOracle::new(client(&server), client(&server), 10);
        let ts = TipSet {
            key: vec![],
            height: 1,
        };
        assert_eq!(
            oracle
                .verified_client_datacap(&Address::Id(100), &ts)
                .await
                .unwrap(),
            Some(1 << 40)
        );
        assert_eq!(
            oracle
                .verified_client_datacap(&Address::Id(200), &ts)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn rpc_errors_surface_with_code() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(200).json_body(serde_json::json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": 1, "message": "actor not found"}
            }));
        });

        let oracle = LotusOracle::new(client(&server), client(&server), 10);
        let err = oracle.account_key(&Address::Id(7)).await.unwrap_err();
        match err {
            ChainError::Rpc { code, message } => {
                assert_eq!(code, 1);
                assert!(message.contains("actor not found"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
