//! Chain oracle: everything the broker reads from the chain node.
//!
//! The reconciler and the provider poller consume the [`ChainOracle`] trait;
//! the production implementation speaks Lotus JSON-RPC and walks the market
//! actor's proposal/state arrays through a thin read-only blockstore over
//! `ChainReadObj`.

pub mod amt;
pub mod blockstore;
pub mod error;
pub mod market;
pub mod oracle;
pub mod rpc;

pub use blockstore::{Blockstore, MemoryBlockstore, RpcBlockstore};
pub use error::{ChainError, ChainResult};
pub use market::{ChainDealState, MarketDealEntry};
pub use oracle::{ChainOracle, LotusOracle, MinerInfo, MinerPower, TipSet};
pub use rpc::LotusClient;
