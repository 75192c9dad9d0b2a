//! `sign-pending`: obtain client signatures for reserved proposals.

use anyhow::{Context, Result};
use std::collections::HashMap;
use stevedore_core::address::Address;
use stevedore_core::deal::ClientDealProposal;
use stevedore_signer::{Keystore, SignerError, WalletSigner};

use crate::ctx::AppCtx;

pub async fn run(ctx: &AppCtx, keystore_dir: Option<&str>) -> Result<()> {
    let pending = ctx.store.proposals_pending_signature().await?;
    if pending.is_empty() {
        return Ok(());
    }

    let keystore = match keystore_dir {
        Some(dir) => Keystore::new(dir),
        None => Keystore::default_location().context("locating the keystore")?,
    };
    let signer = WalletSigner::new(keystore);

    // one robust-form resolution per client per run
    let mut robust_cache: HashMap<Address, Address> = HashMap::new();
    let (mut signed, mut failed) = (0u32, 0u32);

    for proposal in &pending {
        let Some(payload) = proposal.proposal_meta.0.filmarket_proposal.clone() else {
            // a reservation row without a payload cannot ever be signed
            ctx.store
                .fail_proposal(proposal.proposal_uuid, "proposal row carries no market payload")
                .await?;
            failed += 1;
            continue;
        };

        let robust = match robust_cache.get(&payload.client) {
            Some(r) => *r,
            None => {
                let r = if payload.client.is_id() {
                    // an address-resolution failure aborts the whole run so
                    // the scheduler retries it intact
                    ctx.oracle
                        .account_key(&payload.client)
                        .await
                        .with_context(|| format!("resolving {}", payload.client))?
                } else {
                    payload.client
                };
                robust_cache.insert(payload.client, r);
                r
            }
        };

        let raw = payload.to_cbor().context("canonical payload encoding")?;
        match signer.sign(&robust, &raw) {
            Ok(signature) => {
                let signed_cid = ClientDealProposal {
                    proposal: payload,
                    client_signature: signature.clone(),
                }
                .cid()
                .context("computing the signed-proposal cid")?;

                ctx.store
                    .store_signature(proposal.proposal_uuid, &signature, &signed_cid.to_string())
                    .await?;
                signed += 1;
            }
            Err(e @ SignerError::MissingKey(_)) => {
                tracing::error!(proposal = %proposal.proposal_uuid, error = %e, "no key material");
                ctx.store
                    .fail_proposal(proposal.proposal_uuid, &e.to_string())
                    .await?;
                failed += 1;
            }
            Err(e) => {
                tracing::error!(proposal = %proposal.proposal_uuid, error = %e, "signing failed");
                ctx.store
                    .fail_proposal(proposal.proposal_uuid, &format!("signing failed: {e}"))
                    .await?;
                failed += 1;
            }
        }
    }

    tracing::info!(
        unique_wallets = robust_cache.len(),
        successful = signed,
        failed,
        "summary"
    );
    Ok(())
}
