//! Read-only IPLD block access.

use crate::error::{ChainError, ChainResult};
use crate::rpc::{CidJson, LotusClient};
use async_trait::async_trait;
use base64::Engine;
use cid::Cid;
use std::collections::HashMap;
use std::sync::Mutex;

/// Read-only block source feeding the state walkers.
#[async_trait]
pub trait Blockstore: Send + Sync {
    async fn get(&self, cid: &Cid) -> ChainResult<Vec<u8>>;
}

/// Blocks fetched one `ChainReadObj` call at a time, with a per-run cache:
/// state walks revisit interior nodes and the chain node is far away.
pub struct RpcBlockstore {
    client: LotusClient,
    cache: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl RpcBlockstore {
    pub fn new(client: LotusClient) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Blockstore for RpcBlockstore {
    async fn get(&self, cid: &Cid) -> ChainResult<Vec<u8>> {
        if let Some(hit) = self.cache.lock().expect("cache lock").get(cid) {
            return Ok(hit.clone());
        }
        let b64: String = self
            .client
            .call("Filecoin.ChainReadObj", (CidJson(*cid),))
            .await?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| ChainError::Decode(format!("ChainReadObj payload for {cid}: {e}")))?;
        self.cache
            .lock()
            .expect("cache lock")
            .insert(*cid, bytes.clone());
        Ok(bytes)
    }
}

/// In-memory blockstore for tests and fixtures.
#[derive(Default)]
pub struct MemoryBlockstore {
    blocks: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, cid: Cid, data: Vec<u8>) {
        self.blocks.lock().expect("blocks lock").insert(cid, data);
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    async fn get(&self, cid: &Cid) -> ChainResult<Vec<u8>> {
        self.blocks
            .lock()
            .expect("blocks lock")
            .get(cid)
            .cloned()
            .ok_or(ChainError::MissingBlock(*cid))
    }
}
