//! PostgreSQL integration tests using testcontainers.
//!
//! They require Docker to be running. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use common::fixtures::{
    piece_commp, seed_claimed_piece, seed_client, seed_provider, seed_snapshot, seed_world,
    CLIENT, PROVIDER, SNAPSHOT_EPOCH, TENANT,
};
use common::postgres_or_skip;
use stevedore_core::epoch::EPOCHS_IN_DAY;
use stevedore_core::meta::TimingSample;
use stevedore_metadata::models::MarketStateSnapshot;
use stevedore_metadata::repos::{
    DealRepo, DealUpsert, EligibilityRepo, MatviewRepo, ProposalRepo, ReconcileUpdate,
    ReservationRepo, TenantRepo,
};
use stevedore_metadata::{ReservationDenied, ReservationError};
use time::OffsetDateTime;

async fn reserve(
    store: &stevedore_metadata::PostgresStore,
    provider: i64,
    piece_cid: &str,
) -> Result<stevedore_metadata::ReservationOutcome, ReservationError> {
    let tenant = store.tenant(TENANT).await.unwrap().expect("tenant seeded");
    store.reserve_piece(provider, piece_cid, &tenant).await
}

fn denial(err: ReservationError) -> ReservationDenied {
    match err {
        ReservationError::Denied(d) => d,
        ReservationError::Store(e) => panic!("expected a denial, got store error: {e}"),
    }
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    harness.store().migrate().await.unwrap();
    harness.store().migrate().await.unwrap();
    harness.store().health_check().await.unwrap();
}

#[tokio::test]
async fn eligibility_head_and_full_agree() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;

    let (_p1, _) = seed_claimed_piece(store, TENANT, 0x11, 30).await;
    let (_p2, _) = seed_claimed_piece(store, TENANT, 0x12, 31).await;
    let (_p3, _) = seed_claimed_piece(store, TENANT, 0x13, 29).await;
    store.refresh_matviews().await.unwrap();

    let head = store
        .eligible_pieces(PROVIDER, 10, 0, false, false)
        .await
        .unwrap();
    let full = store
        .eligible_pieces(PROVIDER, 10, 0, false, true)
        .await
        .unwrap();

    assert_eq!(head.len(), 3);
    let head_ids: Vec<i64> = head.iter().map(|r| r.piece_id).collect();
    let full_ids: Vec<i64> = full.iter().map(|r| r.piece_id).collect();
    assert_eq!(head_ids, full_ids);
    // age-ascending with id tiebreak means insertion order here
    assert!(head_ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(head[0].tenant_ids, vec![TENANT]);

    // limit applies after ordering
    let top1 = store
        .eligible_pieces(PROVIDER, 1, 0, false, false)
        .await
        .unwrap();
    assert_eq!(top1.len(), 1);
    assert_eq!(top1[0].piece_id, head_ids[0]);
}

#[tokio::test]
async fn eligibility_gates_on_provider_health() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    seed_claimed_piece(store, TENANT, 0x21, 30).await;
    store.refresh_matviews().await.unwrap();

    assert_eq!(
        store
            .eligible_pieces(PROVIDER, 10, 0, false, false)
            .await
            .unwrap()
            .len(),
        1
    );

    // unknown provider lists nothing
    assert!(store
        .eligible_pieces(999_999, 10, 0, false, false)
        .await
        .unwrap()
        .is_empty());

    // stale info drops the provider out entirely
    sqlx::query("UPDATE providers SET info_refreshed_at = NOW() - INTERVAL '16 minutes'")
        .execute(store.pool())
        .await
        .unwrap();
    assert!(store
        .eligible_pieces(PROVIDER, 10, 0, false, false)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn reservation_happy_path_synthesizes_payload() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    let (piece_id, piece_cid) = seed_claimed_piece(store, TENANT, 0x31, 30).await;
    store.refresh_matviews().await.unwrap();

    let outcome = reserve(store, PROVIDER, &piece_cid).await.unwrap();
    assert_eq!(outcome.piece_id, piece_id);
    assert_eq!(outcome.tenant_id, TENANT);
    assert_eq!(
        outcome.start_epoch,
        SNAPSHOT_EPOCH + stevedore_core::DEAL_START_DELAY_EPOCHS
    );
    assert_eq!(outcome.end_epoch, outcome.start_epoch + 530 * EPOCHS_IN_DAY);

    let pending = store.proposals_pending_signature().await.unwrap();
    assert_eq!(pending.len(), 1);
    let row = &pending[0];
    assert!(row.is_live());
    let payload = row
        .proposal_meta
        .0
        .filmarket_proposal
        .as_ref()
        .expect("payload synthesized at reservation time");
    assert!(payload.verified_deal);
    assert_eq!(payload.piece_size, 1u64 << 30);
    assert_eq!(payload.start_epoch, outcome.start_epoch);
    // label is the v2 form of the piece commitment
    assert_eq!(
        payload.label.decoded_cid(),
        Some(piece_commp(0x31, 30).pcid_v2())
    );
}

#[tokio::test]
async fn double_reservation_is_denied() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    let (_, piece_cid) = seed_claimed_piece(store, TENANT, 0x41, 30).await;
    store.refresh_matviews().await.unwrap();

    reserve(store, PROVIDER, &piece_cid).await.unwrap();
    let err = denial(reserve(store, PROVIDER, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::ProviderHasReplica));
}

#[tokio::test]
async fn provider_with_active_deal_is_denied_a_second_replica() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    let (piece_id, piece_cid) = seed_claimed_piece(store, TENANT, 0x51, 30).await;

    sqlx::query(
        "INSERT INTO published_deals (deal_id, client_id, provider_id, piece_id, \
         claimed_log2_size, is_filplus, status, start_epoch, end_epoch, sector_start_epoch) \
         VALUES (7001, $1, $2, $3, 30, true, 'active', 100, 200, 150)",
    )
    .bind(CLIENT)
    .bind(PROVIDER)
    .bind(piece_id)
    .execute(store.pool())
    .await
    .unwrap();
    store.refresh_matviews().await.unwrap();

    let err = denial(reserve(store, PROVIDER, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::ProviderHasReplica));
}

#[tokio::test]
async fn datacap_shortfall_is_denied() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    common::fixtures::seed_tenant(store, TENANT, 2).await;
    seed_client(store, CLIENT, TENANT, 1 << 30).await; // 1 GiB of datacap
    seed_provider(store, PROVIDER).await;
    seed_snapshot(store, SNAPSHOT_EPOCH).await;
    let (_, piece_cid) = seed_claimed_piece(store, TENANT, 0x61, 32).await; // 4 GiB piece
    store.refresh_matviews().await.unwrap();

    let err = denial(reserve(store, PROVIDER, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::TenantsOutOfDatacap));
}

#[tokio::test]
async fn replica_cap_exhaustion_is_denied() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    common::fixtures::seed_tenant(store, TENANT, 1).await; // max_total = 1
    seed_client(store, CLIENT, TENANT, 1 << 40).await;
    seed_provider(store, PROVIDER).await;
    seed_provider(store, PROVIDER + 1).await;
    seed_snapshot(store, SNAPSHOT_EPOCH).await;
    let (_, piece_cid) = seed_claimed_piece(store, TENANT, 0x71, 30).await;
    store.refresh_matviews().await.unwrap();

    // the only replica slot goes to the first provider
    reserve(store, PROVIDER, &piece_cid).await.unwrap();

    // geo caps also read 1, but the total cap trips first in the engine
    let err = denial(reserve(store, PROVIDER + 1, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::TooManyReplicas));
}

#[tokio::test]
async fn provider_gates_map_to_specific_denials() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    let (_, piece_cid) = seed_claimed_piece(store, TENANT, 0x81, 30).await;
    store.refresh_matviews().await.unwrap();

    let err = denial(reserve(store, 424242, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::StorageProviderUnsupported));

    sqlx::query("UPDATE providers SET is_suspended = true WHERE provider_id = $1")
        .bind(PROVIDER)
        .execute(store.pool())
        .await
        .unwrap();
    let err = denial(reserve(store, PROVIDER, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::StorageProviderSuspended));

    sqlx::query(
        "UPDATE providers SET is_suspended = false, \
         info_refreshed_at = NOW() - INTERVAL '1 hour' WHERE provider_id = $1",
    )
    .bind(PROVIDER)
    .execute(store.pool())
    .await
    .unwrap();
    let err = denial(reserve(store, PROVIDER, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::StorageProviderInfoTooOld));

    sqlx::query(
        "UPDATE providers SET info_refreshed_at = NOW(), multiaddrs = '{}' \
         WHERE provider_id = $1",
    )
    .bind(PROVIDER)
    .execute(store.pool())
    .await
    .unwrap();
    let err = denial(reserve(store, PROVIDER, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::StorageProviderUndialable));
}

#[tokio::test]
async fn oversized_piece_is_denied() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    // provider sector is 2^35; a 2^36 piece cannot fit
    let (_, piece_cid) = seed_claimed_piece(store, TENANT, 0x91, 36).await;
    store.refresh_matviews().await.unwrap();

    let err = denial(reserve(store, PROVIDER, &piece_cid).await.unwrap_err());
    assert!(matches!(err, ReservationDenied::OversizedPiece { .. }));
}

#[tokio::test]
async fn signing_and_delivery_stages_are_idempotent() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    let (_, piece_cid) = seed_claimed_piece(store, TENANT, 0xa1, 30).await;
    store.refresh_matviews().await.unwrap();

    let outcome = reserve(store, PROVIDER, &piece_cid).await.unwrap();
    let uuid = outcome.proposal_uuid;

    assert_eq!(store.proposals_pending_signature().await.unwrap().len(), 1);
    let sig = stevedore_core::deal::Signature::new_secp256k1(vec![7u8; 65]);
    store
        .store_signature(uuid, &sig, "bafyreifixturesignedcid")
        .await
        .unwrap();
    // re-running the selection sees no work
    assert!(store.proposals_pending_signature().await.unwrap().is_empty());

    let deliveries = store.proposals_pending_delivery().await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].proposal_uuid, uuid);
    assert_eq!(deliveries[0].peer_id.as_deref(), Some("12D3KooWFixturePeer"));
    assert_eq!(
        deliveries[0].proposal_meta.0.signature.as_ref().map(|s| s.bytes.len()),
        Some(65)
    );

    store
        .record_delivery_attempt(
            uuid,
            &TimingSample {
                attempted_at: OffsetDateTime::now_utc(),
                took_msecs: 1234,
                local_peer_id: Some("12D3KooWLocal".into()),
            },
        )
        .await
        .unwrap();
    store.mark_delivered(uuid).await.unwrap();
    assert!(store.proposals_pending_delivery().await.unwrap().is_empty());

    let pending = store.pending_for_provider(PROVIDER).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].proposal_meta.0.delivery_timings.len(),
        1,
        "timing sample persisted"
    );
}

#[tokio::test]
async fn reconcile_activates_then_compensates() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    let (_, piece_cid) = seed_claimed_piece(store, TENANT, 0xb1, 30).await;
    store.refresh_matviews().await.unwrap();

    let outcome = reserve(store, PROVIDER, &piece_cid).await.unwrap();
    let uuid = outcome.proposal_uuid;
    let sig = stevedore_core::deal::Signature::new_secp256k1(vec![7u8; 65]);
    store.store_signature(uuid, &sig, "bafysigned").await.unwrap();
    store.mark_delivered(uuid).await.unwrap();

    let deal = DealUpsert {
        deal_id: 9001,
        client_id: CLIENT,
        provider_id: PROVIDER,
        piece_cid: piece_cid.clone(),
        claimed_log2_size: 30,
        label: vec![1, 2, 3],
        decoded_label: None,
        is_filplus: true,
        status: "active".into(),
        termination_reason: None,
        start_epoch: outcome.start_epoch,
        end_epoch: outcome.end_epoch,
        sector_start_epoch: Some(outcome.start_epoch - 10),
        newly_active: true,
    };
    let applied = store
        .apply_reconciliation(&ReconcileUpdate {
            upserts: vec![deal.clone()],
            absent_deal_ids: vec![],
            client_datacaps: vec![(CLIENT, (1 << 40) - (1 << 30))],
            observed: MarketStateSnapshot {
                epoch: SNAPSHOT_EPOCH + 10,
                tipset: vec!["bafynext".into()],
            },
        })
        .await
        .unwrap();
    assert_eq!(applied.proposals_activated, 1);

    // proposal now carries the activation, datacap was reprojected
    let activated: Option<i64> =
        sqlx::query_scalar("SELECT activated_deal_id FROM proposals WHERE proposal_uuid = $1")
            .bind(uuid)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(activated, Some(9001));
    let clients = store.tracked_clients().await.unwrap();
    assert_eq!(clients[0].client_meta.0.activatable_datacap, (1 << 40) - (1 << 30));

    // a second identical run is a no-op for the proposal
    let again = store
        .apply_reconciliation(&ReconcileUpdate {
            upserts: vec![DealUpsert {
                newly_active: false,
                ..deal.clone()
            }],
            absent_deal_ids: vec![],
            client_datacaps: vec![],
            observed: MarketStateSnapshot {
                epoch: SNAPSHOT_EPOCH + 11,
                tipset: vec!["bafynext2".into()],
            },
        })
        .await
        .unwrap();
    assert_eq!(again.proposals_activated, 0);

    // chain truth mutates: the deal terminates, the proposal must fail
    let terminated = store
        .apply_reconciliation(&ReconcileUpdate {
            upserts: vec![DealUpsert {
                status: "terminated".into(),
                termination_reason: Some("entered on-chain final-slashed state".into()),
                newly_active: false,
                ..deal
            }],
            absent_deal_ids: vec![],
            client_datacaps: vec![],
            observed: MarketStateSnapshot {
                epoch: SNAPSHOT_EPOCH + 12,
                tipset: vec!["bafynext3".into()],
            },
        })
        .await
        .unwrap();
    assert_eq!(terminated.proposals_failed_terminated, 1);

    let (failstamp, failure): (i64, serde_json::Value) = sqlx::query_as(
        "SELECT proposal_failstamp, proposal_meta -> 'failure' FROM proposals \
         WHERE proposal_uuid = $1",
    )
    .bind(uuid)
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert!(failstamp > 0);
    assert_eq!(failure, "sector containing deal was terminated");
}

#[tokio::test]
async fn reconcile_fails_start_missed_proposals_at_the_boundary() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    let (_, piece_cid) = seed_claimed_piece(store, TENANT, 0xc1, 30).await;
    store.refresh_matviews().await.unwrap();

    let outcome = reserve(store, PROVIDER, &piece_cid).await.unwrap();
    let uuid = outcome.proposal_uuid;
    let start = outcome.start_epoch;

    let reconcile_at = |epoch: i64| ReconcileUpdate {
        upserts: vec![],
        absent_deal_ids: vec![],
        client_datacaps: vec![],
        observed: MarketStateSnapshot {
            epoch,
            tipset: vec!["bafyboundary".into()],
        },
    };

    // exactly one sealing window past start: still within tolerance
    let ok = store
        .apply_reconciliation(&reconcile_at(start + EPOCHS_IN_DAY))
        .await
        .unwrap();
    assert_eq!(ok.proposals_failed_start_missed, 0);

    // one epoch further: never going to make it
    let failed = store
        .apply_reconciliation(&reconcile_at(start + EPOCHS_IN_DAY + 1))
        .await
        .unwrap();
    assert_eq!(failed.proposals_failed_start_missed, 1);

    let failure: serde_json::Value =
        sqlx::query_scalar("SELECT proposal_meta -> 'failure' FROM proposals WHERE proposal_uuid = $1")
            .bind(uuid)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(failure, "proposal DealStartEpoch missed without activation");
}

#[tokio::test]
async fn live_proposal_uniqueness_is_enforced_by_schema() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;
    let (piece_id, _) = seed_claimed_piece(store, TENANT, 0xd1, 30).await;

    let insert = |uuid: uuid::Uuid| {
        sqlx::query(
            "INSERT INTO proposals (proposal_uuid, piece_id, provider_id, client_id, \
             start_epoch, end_epoch) VALUES ($1, $2, $3, $4, 10, 20)",
        )
        .bind(uuid)
        .bind(piece_id)
        .bind(PROVIDER)
        .bind(CLIENT)
        .execute(store.pool())
    };

    insert(uuid::Uuid::new_v4()).await.unwrap();
    let err = insert(uuid::Uuid::new_v4()).await.unwrap_err();
    match err {
        sqlx::Error::Database(db) => assert_eq!(db.code().as_deref(), Some("23505")),
        other => panic!("expected a unique violation, got {other}"),
    }

    // failing the first row frees the slot for a retry
    sqlx::query("UPDATE proposals SET proposal_failstamp = big_now()")
        .execute(store.pool())
        .await
        .unwrap();
    insert(uuid::Uuid::new_v4()).await.unwrap();
}

#[tokio::test]
async fn ingest_aggregate_is_reingest_safe_and_feeds_manifests() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let store = harness.store();
    seed_world(store).await;

    let agg = piece_commp(0xe1, 12);
    let seg_a = piece_commp(0xe2, 11);
    let seg_b = piece_commp(0xe3, 10);
    let ingest = stevedore_metadata::repos::AggregateIngest {
        aggregate_cid: agg.pcid_v1().to_string(),
        aggregate_log2_size: 12,
        segments: vec![
            stevedore_metadata::repos::SegmentIngest {
                pcid_v2: seg_a.pcid_v2().to_string(),
                log2_size: 11,
            },
            stevedore_metadata::repos::SegmentIngest {
                pcid_v2: seg_b.pcid_v2().to_string(),
                log2_size: 10,
            },
        ],
    };

    use stevedore_metadata::repos::PieceRepo;
    store.ingest_aggregate(TENANT, &ingest).await.unwrap();
    store.ingest_aggregate(TENANT, &ingest).await.unwrap();

    let pieces: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pieces")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(pieces, 3, "reingest inserts nothing new");

    let segments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM piece_segments")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(segments, 2);

    let aggregate_meta: serde_json::Value = sqlx::query_scalar(
        "SELECT piece_meta FROM pieces WHERE piece_cid = $1",
    )
    .bind(agg.pcid_v1().to_string())
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(aggregate_meta["is_frc58_segmented"], true);
}
