//! Market-actor state walking.

use crate::amt;
use crate::blockstore::Blockstore;
use crate::error::{ChainError, ChainResult};
use cid::Cid;
use ipld_core::ipld::Ipld;
use std::collections::BTreeMap;
use stevedore_core::deal::DealProposal;

/// Per-deal activation state. `EMPTY` (all -1) means the deal is published
/// but no sector carries it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainDealState {
    pub sector_start_epoch: i64,
    pub last_updated_epoch: i64,
    pub slash_epoch: i64,
}

impl ChainDealState {
    pub const EMPTY: ChainDealState = ChainDealState {
        sector_start_epoch: -1,
        last_updated_epoch: -1,
        slash_epoch: -1,
    };
}

impl Default for ChainDealState {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// One deal as observed in the market actor: proposal joined with state.
#[derive(Debug, Clone)]
pub struct MarketDealEntry {
    pub deal_id: i64,
    pub proposal: DealProposal,
    pub state: ChainDealState,
}

/// Walk the market actor's proposal and state arrays and join them by deal
/// id, ascending. `state_root` is the actor head from `StateGetActor`.
pub async fn load_market_deals(
    bs: &dyn Blockstore,
    state_root: &Cid,
) -> ChainResult<Vec<MarketDealEntry>> {
    let root_bytes = bs.get(state_root).await?;
    let root: Ipld = serde_ipld_dagcbor::from_slice(&root_bytes)
        .map_err(|e| ChainError::Decode(format!("market state root: {e}")))?;
    let fields = match &root {
        Ipld::List(l) if l.len() >= 2 => l,
        other => {
            return Err(ChainError::Decode(format!(
                "market state root is {other:?}, expected a tuple"
            )))
        }
    };
    let proposals_root = field_link(&fields[0], "market proposals root")?;
    let states_root = field_link(&fields[1], "market states root")?;

    let mut proposals: BTreeMap<u64, DealProposal> = BTreeMap::new();
    amt::for_each(bs, &proposals_root, |id, value| {
        let bytes = serde_ipld_dagcbor::to_vec(value)
            .map_err(|e| ChainError::Decode(format!("deal {id} proposal reencode: {e}")))?;
        let proposal = DealProposal::from_cbor(&bytes)
            .map_err(|e| ChainError::Decode(format!("deal {id} proposal: {e}")))?;
        proposals.insert(id, proposal);
        Ok(())
    })
    .await?;

    let mut states: BTreeMap<u64, ChainDealState> = BTreeMap::new();
    amt::for_each(bs, &states_root, |id, value| {
        states.insert(id, decode_deal_state(id, value)?);
        Ok(())
    })
    .await?;

    Ok(proposals
        .into_iter()
        .map(|(id, proposal)| MarketDealEntry {
            deal_id: id as i64,
            proposal,
            state: states.get(&id).copied().unwrap_or(ChainDealState::EMPTY),
        })
        .collect())
}

fn field_link(ipld: &Ipld, what: &str) -> ChainResult<Cid> {
    match ipld {
        Ipld::Link(c) => Ok(*c),
        other => Err(ChainError::Decode(format!(
            "{what} is {other:?}, expected a cid"
        ))),
    }
}

fn decode_deal_state(id: u64, value: &Ipld) -> ChainResult<ChainDealState> {
    // Newer actor versions append fields; the first three are stable.
    let items = match value {
        Ipld::List(l) if l.len() >= 3 => l,
        other => {
            return Err(ChainError::Decode(format!(
                "deal {id} state is {other:?}, expected a tuple"
            )))
        }
    };
    let int = |ipld: &Ipld, name: &str| -> ChainResult<i64> {
        match ipld {
            Ipld::Integer(i) => Ok(*i as i64),
            other => Err(ChainError::Decode(format!(
                "deal {id} state {name} is {other:?}, expected an integer"
            ))),
        }
    };
    Ok(ChainDealState {
        sector_start_epoch: int(&items[0], "sector_start_epoch")?,
        last_updated_epoch: int(&items[1], "last_updated_epoch")?,
        slash_epoch: int(&items[2], "slash_epoch")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amt::testing::{build_amt, put_block};
    use crate::blockstore::MemoryBlockstore;
    use stevedore_core::address::Address;
    use stevedore_core::deal::{Label, TokenAmount};
    use stevedore_core::piece::CommP;

    fn proposal(provider: u64, start: i64) -> DealProposal {
        let commp = CommP::new([provider as u8; 32], 30).unwrap();
        DealProposal {
            piece_cid: commp.pcid_v1(),
            piece_size: commp.padded_size(),
            verified_deal: true,
            client: Address::Id(100),
            provider: Address::Id(provider),
            label: Label::Bytes(commp.pcid_v2().to_bytes()),
            start_epoch: start,
            end_epoch: start + 1_000_000,
            storage_price_per_epoch: TokenAmount::zero(),
            provider_collateral: TokenAmount::zero(),
            client_collateral: TokenAmount::zero(),
        }
    }

    fn to_ipld(p: &DealProposal) -> Ipld {
        serde_ipld_dagcbor::from_slice(&p.to_cbor().unwrap()).unwrap()
    }

    fn state_ipld(sector_start: i64, slash: i64) -> Ipld {
        Ipld::List(vec![
            Ipld::Integer(sector_start as i128),
            Ipld::Integer(-1),
            Ipld::Integer(slash as i128),
        ])
    }

    #[tokio::test]
    async fn joins_proposals_with_states() {
        let bs = MemoryBlockstore::new();

        let p11 = proposal(11, 5000);
        let p12 = proposal(12, 6000);
        let proposals_root = build_amt(
            &bs,
            5,
            &[(40u64, to_ipld(&p11)), (41, to_ipld(&p12))],
        );
        // only deal 40 has a state entry; 41 is freshly published
        let states_root = build_amt(&bs, 6, &[(40u64, state_ipld(7777, -1))]);

        let state_root = put_block(
            &bs,
            &Ipld::List(vec![Ipld::Link(proposals_root), Ipld::Link(states_root)]),
        );

        let deals = load_market_deals(&bs, &state_root).await.unwrap();
        assert_eq!(deals.len(), 2);

        assert_eq!(deals[0].deal_id, 40);
        assert_eq!(deals[0].proposal, p11);
        assert_eq!(deals[0].state.sector_start_epoch, 7777);
        assert_eq!(deals[0].state.slash_epoch, -1);

        assert_eq!(deals[1].deal_id, 41);
        assert_eq!(deals[1].proposal, p12);
        assert_eq!(deals[1].state, ChainDealState::EMPTY);
    }

    #[tokio::test]
    async fn longer_state_tuples_are_tolerated() {
        let value = Ipld::List(vec![
            Ipld::Integer(10),
            Ipld::Integer(20),
            Ipld::Integer(-1),
            Ipld::Integer(999), // future field
        ]);
        let st = decode_deal_state(1, &value).unwrap();
        assert_eq!(st.sector_start_epoch, 10);
        assert_eq!(st.slash_epoch, -1);
    }
}
