//! `bulk-piece-poll`: ingest tenant-supplied aggregate manifests.
//!
//! Each manifest is verified by recomputing the aggregate commitment from
//! its segment list before any row is written. Any inconsistency aborts the
//! whole run: a tenant feed that lies about one aggregate cannot be trusted
//! about the rest, and the matviews are not refreshed.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use stevedore_core::frc58;
use stevedore_core::meta::BulkPieceSource;
use stevedore_core::piece::{CommP, PieceInfo};
use stevedore_metadata::repos::{AggregateIngest, SegmentIngest};
use time::format_description::well_known::Iso8601;
use time::OffsetDateTime;

use crate::ctx::AppCtx;

/// Tenant-supplied aggregate descriptor.
#[derive(Debug, Deserialize)]
pub(crate) struct AggregateManifest {
    /// Aggregate piece, v2 CID form.
    pub aggregate: String,
    /// Ordered segment list, v2 CID forms.
    pub pieces: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)] // carried by tenants for their own bookkeeping
    pub collection: String,
}

/// Parse and cryptographically verify one manifest, producing the rows to
/// insert.
pub(crate) fn verify_manifest(manifest: &AggregateManifest) -> Result<AggregateIngest> {
    let agg_cid: cid::Cid = manifest
        .aggregate
        .parse()
        .with_context(|| format!("aggregate cid '{}'", manifest.aggregate))?;
    let agg = CommP::from_pcid_v2(&agg_cid).context("aggregate is not a v2 piece cid")?;

    let mut segments: Vec<SegmentIngest> = Vec::with_capacity(manifest.pieces.len());
    let mut infos: Vec<PieceInfo> = Vec::with_capacity(manifest.pieces.len());
    for raw in &manifest.pieces {
        let cid: cid::Cid = raw.parse().with_context(|| format!("segment cid '{raw}'"))?;
        let commp = CommP::from_pcid_v2(&cid)
            .with_context(|| format!("segment '{raw}' is not a v2 piece cid"))?;
        infos.push(commp.piece_info());
        segments.push(SegmentIngest {
            pcid_v2: raw.clone(),
            log2_size: commp.log2_size() as i16,
        });
    }

    frc58::verify_aggregate(&agg, &infos).with_context(|| {
        format!(
            "supplied list of {} pieces does not aggregate to {}",
            infos.len(),
            agg.pcid_v1()
        )
    })?;

    Ok(AggregateIngest {
        // v1 form for the aggregate itself, matching deal payloads
        aggregate_cid: agg.pcid_v1().to_string(),
        aggregate_log2_size: agg.log2_size() as i16,
        segments,
    })
}

pub async fn run(ctx: &AppCtx, skip_entries_aged_days: u64) -> Result<()> {
    let tenants = ctx.store.list_tenants().await?;

    for tenant in tenants {
        let Some(source) = tenant.tenant_meta.0.bulk_piece_source.clone() else {
            continue;
        };
        ingest_tenant(ctx, tenant.tenant_id, &source, skip_entries_aged_days).await?;
    }

    // everything went well: make the new pieces visible to eligibility
    ctx.store.refresh_matviews().await?;
    Ok(())
}

async fn ingest_tenant(
    ctx: &AppCtx,
    tenant_id: i16,
    source: &BulkPieceSource,
    skip_entries_aged_days: u64,
) -> Result<()> {
    if source.source_type != "s3" {
        bail!(
            "unsupported bulk source type '{}' for tenant {tenant_id}",
            source.source_type
        );
    }
    if !source.is_frc58 {
        bail!("do not know how to handle non-frc58 bulk sources yet (tenant {tenant_id})");
    }
    let [region, bucket] = source.path_parts.as_slice() else {
        bail!(
            "tenant {tenant_id} bulk source path_parts must be [region, bucket], got {:?}",
            source.path_parts
        );
    };

    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .profile_name(source.config.as_str())
        .region(aws_config::Region::new(region.clone()))
        .load()
        .await;
    let s3 = aws_sdk_s3::Client::new(&config);

    for days_back in (0..=skip_entries_aged_days).rev() {
        let day = OffsetDateTime::now_utc() - time::Duration::days(days_back as i64);
        let prefix = day
            .date()
            .format(&Iso8601::DATE)
            .context("formatting the date prefix")?;

        let mut day_count = 0u64;
        let mut continuation: Option<String> = None;
        loop {
            let listing = s3
                .list_objects_v2()
                .bucket(bucket.as_str())
                .prefix(prefix.as_str())
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| format!("listing s3://{bucket}/{prefix}"))?;

            for object in listing.contents() {
                let Some(key) = object.key() else { continue };
                let body = s3
                    .get_object()
                    .bucket(bucket.as_str())
                    .key(key)
                    .send()
                    .await
                    .with_context(|| format!("fetching s3://{bucket}/{key}"))?
                    .body
                    .collect()
                    .await
                    .with_context(|| format!("reading s3://{bucket}/{key}"))?
                    .into_bytes();

                let manifest: AggregateManifest = serde_json::from_slice(&body)
                    .with_context(|| format!("decoding s3://{bucket}/{key}"))?;
                let ingest = verify_manifest(&manifest)
                    .with_context(|| format!("verifying s3://{bucket}/{key}"))?;

                ctx.store.ingest_aggregate(tenant_id, &ingest).await?;
                day_count += 1;
            }

            continuation = listing.next_continuation_token().map(str::to_owned);
            if continuation.is_none() {
                break;
            }
        }
        tracing::info!(tenant_id, prefix = %prefix, aggregates = day_count, "processed day");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::frc58::Aggregate;

    fn seg_commp(byte: u8, log2: u8) -> CommP {
        CommP::new([byte; 32], log2).unwrap()
    }

    /// Build a manifest whose aggregate commitment genuinely covers its
    /// segment list.
    fn consistent_manifest() -> AggregateManifest {
        let segs = vec![seg_commp(1, 8), seg_commp(2, 8), seg_commp(3, 7)];
        let infos: Vec<PieceInfo> = segs.iter().map(|c| c.piece_info()).collect();
        let agg = Aggregate::new(1 << 12, &infos).unwrap().commp().unwrap();
        AggregateManifest {
            aggregate: agg.pcid_v2().to_string(),
            pieces: segs.iter().map(|c| c.pcid_v2().to_string()).collect(),
            collection: "fixtures".into(),
        }
    }

    #[test]
    fn consistent_manifest_verifies() {
        let manifest = consistent_manifest();
        let ingest = verify_manifest(&manifest).unwrap();
        assert_eq!(ingest.segments.len(), 3);
        assert_eq!(ingest.aggregate_log2_size, 12);
        // the aggregate is stored in v1 form
        assert!(ingest.aggregate_cid.starts_with("baga"));
    }

    #[test]
    fn tampered_manifest_is_rejected() {
        let mut manifest = consistent_manifest();
        manifest.pieces.pop();
        let err = verify_manifest(&manifest).unwrap_err();
        assert!(format!("{err:#}").contains("does not aggregate"));
    }

    #[test]
    fn v1_aggregate_cid_is_rejected() {
        let mut manifest = consistent_manifest();
        // v1 CIDs carry no size and cannot anchor verification
        let segs = seg_commp(9, 8);
        manifest.aggregate = segs.pcid_v1().to_string();
        assert!(verify_manifest(&manifest).is_err());
    }

    #[test]
    fn manifest_json_shape() {
        let manifest = consistent_manifest();
        let json = format!(
            r#"{{"aggregate": "{}", "pieces": ["{}", "{}", "{}"], "collection": "c"}}"#,
            manifest.aggregate, manifest.pieces[0], manifest.pieces[1], manifest.pieces[2]
        );
        let parsed: AggregateManifest = serde_json::from_str(&json).unwrap();
        assert!(verify_manifest(&parsed).is_ok());
    }
}
