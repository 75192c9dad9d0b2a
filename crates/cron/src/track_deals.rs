//! `track-deals`: reconcile local deal records against the market actor.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use stevedore_chain::{ChainDealState, MarketDealEntry};
use stevedore_core::address::Address;
use stevedore_core::epoch::EPOCHS_IN_DAY;
use stevedore_metadata::models::MarketStateSnapshot;
use stevedore_metadata::repos::{DealUpsert, ReconcileUpdate};

use crate::ctx::AppCtx;

/// Chain-side status classification of one deal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Classified {
    pub status: &'static str,
    pub termination_reason: Option<&'static str>,
    pub sector_start_epoch: Option<i64>,
}

/// Every deal begins as "published" and is adjusted from there.
pub(crate) fn classify_deal(state: &ChainDealState, start_epoch: i64, current_epoch: i64) -> Classified {
    if state.slash_epoch != -1 {
        Classified {
            status: "terminated",
            termination_reason: Some("entered on-chain final-slashed state"),
            sector_start_epoch: None,
        }
    } else if state.sector_start_epoch > 0 {
        Classified {
            status: "active",
            termination_reason: None,
            sector_start_epoch: Some(state.sector_start_epoch),
        }
    } else if start_epoch + EPOCHS_IN_DAY < current_epoch {
        // if things are that late: they are never going to make it
        Classified {
            status: "terminated",
            termination_reason: Some("containing sector missed expected sealing epoch"),
            sector_start_epoch: None,
        }
    } else {
        Classified {
            status: "published",
            termination_reason: None,
            sector_start_epoch: None,
        }
    }
}

pub async fn run(ctx: &AppCtx, zero_datacap_clients: &[String]) -> Result<()> {
    let tipset = ctx.oracle.lookback_tipset().await?;
    tracing::info!(
        epoch = tipset.height,
        tipset = ?tipset.key_strings(),
        "iterating over market state"
    );

    // Chain-reported datacap reflects already-activated allocations; the
    // projection below adds back everything published but not yet active.
    let tracked = ctx.store.tracked_clients().await?;
    let mut datacap: HashMap<i64, Option<i64>> = HashMap::with_capacity(tracked.len());
    for client in &tracked {
        let addr = Address::Id(client.client_id as u64);
        let dcap = ctx.oracle.verified_client_datacap(&addr, &tipset).await?;
        datacap.insert(client.client_id, dcap);
    }
    tracing::info!(clients = datacap.len(), "queried datacap");

    let mut known: HashMap<i64, String> = ctx
        .store
        .all_deals_brief()
        .await?
        .into_iter()
        .map(|d| (d.deal_id, d.status))
        .collect();
    tracing::info!(existing = known.len(), "retrieved existing deal records");

    let entries = ctx.oracle.market_deals(&tipset).await?;

    let mut counts: HashMap<String, u64> = HashMap::new();
    let mut seen_pieces: HashSet<cid::Cid> = HashSet::new();
    let mut upserts: Vec<DealUpsert> = Vec::new();

    for entry in &entries {
        let MarketDealEntry {
            deal_id,
            proposal,
            state,
        } = entry;
        seen_pieces.insert(proposal.piece_cid);

        let class = classify_deal(state, proposal.start_epoch, tipset.height);
        let prev_status = known.remove(deal_id);

        if let Some(cap) = client_actor_id(&proposal.client)
            .and_then(|id| datacap.get_mut(&id))
        {
            if proposal.verified_deal && class.status == "published" {
                let Some(cap) = cap.as_mut() else {
                    bail!(
                        "client {} does not seem to have datacap yet published fil+ deal {deal_id}",
                        proposal.client
                    );
                };
                *cap += proposal.piece_size as i64;
            }
        }

        *counts.entry(class.status.to_string()).or_default() += 1;
        let changed = match &prev_status {
            None => true,
            Some(prev) => prev != class.status,
        };
        if !changed {
            continue;
        }
        *counts.entry(format!("{}New", class.status)).or_default() += 1;

        if !proposal.piece_size.is_power_of_two() {
            bail!("deal {deal_id} size {} is not a power of 2", proposal.piece_size);
        }
        let provider_id = client_actor_id(&proposal.provider)
            .with_context(|| format!("deal {deal_id} provider is not an ID address"))?;
        let client_id = client_actor_id(&proposal.client)
            .with_context(|| format!("deal {deal_id} client is not an ID address"))?;

        let label_bytes = proposal.label.as_bytes().to_vec();
        let decoded_label = proposal.label.decoded_cid().map(|c| c.to_string());

        upserts.push(DealUpsert {
            deal_id: *deal_id,
            client_id,
            provider_id,
            piece_cid: proposal.piece_cid.to_string(),
            claimed_log2_size: proposal.piece_size.trailing_zeros() as i16,
            label: label_bytes,
            decoded_label,
            is_filplus: proposal.verified_deal,
            status: class.status.to_string(),
            termination_reason: class.termination_reason.map(str::to_owned),
            start_epoch: proposal.start_epoch,
            end_epoch: proposal.end_epoch,
            sector_start_epoch: class.sector_start_epoch,
            newly_active: class.status == "active" && prev_status.as_deref() != Some("active"),
        });
    }

    // whatever remains was not in the market state at all
    let absent_deal_ids: Vec<i64> = known
        .into_iter()
        .filter(|(_, status)| status != "terminated")
        .map(|(id, _)| id)
        .collect();

    let zeroed: HashSet<&str> = zero_datacap_clients.iter().map(String::as_str).collect();
    let client_datacaps: Vec<(i64, i64)> = datacap
        .into_iter()
        .map(|(client_id, cap)| {
            let addr = Address::Id(client_id as u64).to_string();
            let projected = if zeroed.contains(addr.as_str()) {
                0
            } else {
                cap.unwrap_or(0)
            };
            (client_id, projected)
        })
        .collect();

    tracing::info!(
        upserts = upserts.len(),
        terminating = absent_deal_ids.len(),
        unique_pieces = seen_pieces.len(),
        "about to apply reconciliation"
    );

    let outcome = ctx
        .store
        .apply_reconciliation(&ReconcileUpdate {
            upserts,
            absent_deal_ids,
            client_datacaps,
            observed: MarketStateSnapshot {
                epoch: tipset.height,
                tipset: tipset.key_strings(),
            },
        })
        .await?;

    tracing::info!(
        deal_counts = ?counts,
        deals_upserted = outcome.deals_upserted,
        deals_terminated_missing = outcome.deals_terminated_missing,
        proposals_activated = outcome.proposals_activated,
        proposals_failed_start_missed = outcome.proposals_failed_start_missed,
        proposals_failed_terminated = outcome.proposals_failed_terminated,
        proposals_failed_invalidated = outcome.proposals_failed_invalidated,
        pieces_size_proven = outcome.pieces_size_proven,
        "summary"
    );
    Ok(())
}

fn client_actor_id(addr: &Address) -> Option<i64> {
    match addr {
        Address::Id(id) => Some(*id as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: ChainDealState = ChainDealState::EMPTY;

    #[test]
    fn slashed_deals_are_terminated() {
        let st = ChainDealState {
            slash_epoch: 500,
            ..EMPTY
        };
        let c = classify_deal(&st, 1000, 2000);
        assert_eq!(c.status, "terminated");
        assert_eq!(
            c.termination_reason,
            Some("entered on-chain final-slashed state")
        );
    }

    #[test]
    fn sector_start_means_active() {
        let st = ChainDealState {
            sector_start_epoch: 1234,
            ..EMPTY
        };
        let c = classify_deal(&st, 1000, 100_000);
        assert_eq!(c.status, "active");
        assert_eq!(c.sector_start_epoch, Some(1234));
    }

    #[test]
    fn late_unsealed_deals_are_terminated() {
        let cur = 100_000;
        let c = classify_deal(&EMPTY, cur - EPOCHS_IN_DAY - 1, cur);
        assert_eq!(c.status, "terminated");
        assert_eq!(
            c.termination_reason,
            Some("containing sector missed expected sealing epoch")
        );
    }

    #[test]
    fn sealing_window_boundary() {
        let cur = 100_000;
        // exactly at the boundary: still has a chance
        assert_eq!(classify_deal(&EMPTY, cur - EPOCHS_IN_DAY, cur).status, "published");
        assert_eq!(
            classify_deal(&EMPTY, cur - EPOCHS_IN_DAY + 1, cur).status,
            "published"
        );
    }

    #[test]
    fn slashed_wins_over_active() {
        let st = ChainDealState {
            sector_start_epoch: 10,
            slash_epoch: 20,
            ..EMPTY
        };
        assert_eq!(classify_deal(&st, 0, 0).status, "terminated");
    }
}
