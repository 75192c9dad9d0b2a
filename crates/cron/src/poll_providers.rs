//! `poll-providers`: refresh chain-attested provider info.

use anyhow::Result;
use stevedore_chain::ChainError;
use stevedore_core::address::ActorId;
use stevedore_lp2p::Multiaddr;

use crate::ctx::AppCtx;

pub async fn run(ctx: &AppCtx) -> Result<()> {
    let tipset = ctx.oracle.lookback_tipset().await?;
    let provider_ids = ctx.store.known_provider_ids().await?;

    let (mut refreshed, mut skipped) = (0u32, 0u32);
    for provider_id in provider_ids {
        let actor = ActorId(provider_id as u64);

        let info = match ctx.oracle.miner_info(actor, &tipset).await {
            Ok(info) => info,
            Err(e @ ChainError::Transport(_)) => return Err(e.into()),
            Err(e) => {
                // a single confused miner record must not starve the rest
                tracing::warn!(provider = %actor, error = %e, "skipping provider info refresh");
                skipped += 1;
                continue;
            }
        };
        let power = match ctx.oracle.miner_power(actor, &tipset).await {
            Ok(power) => power,
            Err(e @ ChainError::Transport(_)) => return Err(e.into()),
            Err(e) => {
                tracing::warn!(provider = %actor, error = %e, "skipping provider power refresh");
                skipped += 1;
                continue;
            }
        };

        let multiaddrs: Vec<String> = info
            .multiaddrs
            .iter()
            .filter_map(|raw| Multiaddr::try_from(raw.clone()).ok())
            .map(|ma| ma.to_string())
            .collect();

        ctx.store
            .update_provider_chain_info(
                provider_id,
                info.peer_id.as_deref(),
                &multiaddrs,
                info.sector_log2_size as i16,
                power.has_min_power,
            )
            .await?;
        refreshed += 1;
    }

    tracing::info!(refreshed, skipped, "summary");
    Ok(())
}
