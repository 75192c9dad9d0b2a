//! `propose-pending`: deliver signed proposals to provider market nodes.
//!
//! One worker per provider, serial within a provider. Once an RPC attempt
//! has been made its outcome is always written back, shutdown or not;
//! the cancellation token is only consulted between proposals.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stevedore_core::meta::TimingSample;
use stevedore_lp2p::{AddrInfo, DealClient, StorageProposalV120Params};
use stevedore_metadata::models::DeliveryRow;
use stevedore_metadata::MetadataStore;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::ctx::AppCtx;

#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    pub sleep_between_proposals: Duration,
    pub proposal_timeout: Duration,
    pub per_sp_timeout: Duration,
}

#[derive(Default)]
struct RunTotals {
    delivered: AtomicU32,
    failed: AtomicU32,
    timedout: AtomicU32,
}

pub async fn run(ctx: &AppCtx, config: DeliveryConfig) -> Result<()> {
    let pending = ctx.store.proposals_pending_delivery().await?;

    // Partition by provider, failing the undialable ones up front.
    let mut per_sp: BTreeMap<i64, Vec<DeliveryRow>> = BTreeMap::new();
    let mut proposal_count = 0usize;
    for row in pending {
        if row.peer_id.is_none() || row.multiaddrs.is_empty() {
            ctx.store
                .fail_proposal(
                    row.proposal_uuid,
                    "provider not dialable: insufficient information published on chain",
                )
                .await?;
            continue;
        }
        proposal_count += 1;
        per_sp.entry(row.provider_id).or_default().push(row);
    }

    if per_sp.is_empty() {
        return Ok(());
    }

    let client = Arc::new(DealClient::new(config.proposal_timeout)?);
    let totals = Arc::new(RunTotals::default());
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::warn!("shutdown requested; finishing in-flight writes only");
            cancel.cancel();
        });
    }

    let unique_providers = per_sp.len();
    let mut workers = JoinSet::new();
    for (provider_id, rows) in per_sp {
        let store = ctx.store.clone();
        let client = client.clone();
        let totals = totals.clone();
        let cancel = cancel.clone();
        workers.spawn(async move {
            propose_to_sp(store, client, provider_id, rows, config, totals, cancel).await
        });
    }

    let mut first_err: Option<anyhow::Error> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => first_err = first_err.or(Some(e)),
            Err(e) => first_err = first_err.or(Some(e.into())),
        }
    }

    tracing::info!(
        unique_providers,
        proposals = proposal_count,
        successful_v120 = totals.delivered.load(Ordering::Relaxed),
        failed = totals.failed.load(Ordering::Relaxed),
        timedout = totals.timedout.load(Ordering::Relaxed),
        "summary"
    );

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn propose_to_sp(
    store: Arc<dyn MetadataStore>,
    client: Arc<DealClient>,
    provider_id: i64,
    rows: Vec<DeliveryRow>,
    config: DeliveryConfig,
    totals: Arc<RunTotals>,
    cancel: CancellationToken,
) -> Result<()> {
    let deal_count = rows.len();
    tracing::info!(provider_id, deal_count, "START proposing storage contracts");
    let t0 = std::time::Instant::now();
    let (mut delivered, mut failed, mut timedout) = (0u32, 0u32, 0u32);

    let target = match AddrInfo::from_attested(
        rows[0].peer_id.as_deref().unwrap_or_default(),
        &rows[0].multiaddrs,
    ) {
        Ok(t) => t,
        Err(e) => {
            // attested but unparseable: fail the whole batch for this SP
            for row in &rows {
                store
                    .fail_proposal(row.proposal_uuid, &e.to_string())
                    .await?;
            }
            return Ok(());
        }
    };

    for (i, row) in rows.iter().enumerate() {
        // Some SPs take forever to respond. Cap processing so the rest of
        // the fleet is not held up; leftovers restart on the next round.
        if t0.elapsed() >= config.per_sp_timeout + config.sleep_between_proposals {
            break;
        }

        if i != 0 {
            client.close_peer(target.peer_id).await;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(config.sleep_between_proposals) => {}
            }
        }

        let meta = &row.proposal_meta.0;
        let (Some(payload), Some(signature)) =
            (meta.filmarket_proposal.clone(), meta.signature.clone())
        else {
            store
                .fail_proposal(row.proposal_uuid, "signed row is missing payload or signature")
                .await?;
            failed += 1;
            totals.failed.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        let params = StorageProposalV120Params {
            deal_uuid: row.proposal_uuid,
            is_offline: true, // not negotiable: out-of-band transfers forever
            deal_data_root: payload.piece_cid,
            client_deal_proposal: stevedore_core::deal::ClientDealProposal {
                proposal: payload,
                client_signature: signature,
            },
            remove_unsealed_copy: false,
            skip_ipni_announce: false,
        };

        let (outcome, took) = client.propose(&target, params).await;

        // Everything below this point is a post-side-effect write: the SP
        // may have seen the proposal, so the outcome must be recorded even
        // while shutting down.
        store
            .record_delivery_attempt(
                row.proposal_uuid,
                &TimingSample {
                    attempted_at: OffsetDateTime::now_utc(),
                    took_msecs: took.as_millis() as i64,
                    local_peer_id: Some(client.local_peer_id().to_string()),
                },
            )
            .await?;

        match outcome {
            Ok(resp) if resp.accepted => {
                store.mark_delivered(row.proposal_uuid).await?;
                delivered += 1;
                totals.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(resp) => {
                tracing::error!(provider_id, proposal = %row.proposal_uuid, message = %resp.message, "proposal rejected");
                store.fail_proposal(row.proposal_uuid, &resp.message).await?;
                failed += 1;
                totals.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_deadline_exceeded() => {
                // The row stays live for the next run; one bad connection
                // likely means the rest of this queue would also time out.
                tracing::warn!(provider_id, proposal = %row.proposal_uuid, "delivery timed out; abandoning this provider's queue");
                timedout += 1;
                totals.timedout.fetch_add(1, Ordering::Relaxed);
                break;
            }
            Err(e) => {
                tracing::error!(provider_id, proposal = %row.proposal_uuid, error = %e, "delivery failed");
                store.fail_proposal(row.proposal_uuid, &e.to_string()).await?;
                failed += 1;
                totals.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    tracing::info!(
        provider_id,
        deal_count,
        delivered,
        failed,
        timedout,
        took = ?t0.elapsed(),
        "END proposing storage contracts"
    );
    Ok(())
}
