//! End-to-end exchange tests against an in-process responder swarm.

use futures::prelude::*;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::SwarmEvent;
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol};
use std::time::Duration;
use stevedore_core::address::Address;
use stevedore_core::deal::{ClientDealProposal, DealProposal, Label, Signature, TokenAmount};
use stevedore_core::piece::CommP;
use stevedore_lp2p::client::ProposalCodec;
use stevedore_lp2p::{
    AddrInfo, DealClient, Lp2pError, StorageProposalV120Params, StorageProposalV120Response,
    STORAGE_PROPOSAL_V120,
};
use uuid::Uuid;

fn sample_params() -> StorageProposalV120Params {
    let commp = CommP::new([0x61; 32], 27).unwrap();
    let proposal = DealProposal {
        piece_cid: commp.pcid_v1(),
        piece_size: commp.padded_size(),
        verified_deal: true,
        client: Address::Secp256k1([9; 20]),
        provider: Address::Id(1234),
        label: Label::Bytes(commp.pcid_v2().to_bytes()),
        start_epoch: 1000,
        end_epoch: 2000,
        storage_price_per_epoch: TokenAmount::zero(),
        provider_collateral: TokenAmount::zero(),
        client_collateral: TokenAmount::zero(),
    };
    StorageProposalV120Params {
        deal_uuid: Uuid::new_v4(),
        is_offline: true,
        client_deal_proposal: ClientDealProposal {
            proposal,
            client_signature: Signature::new_secp256k1(vec![2; 65]),
        },
        deal_data_root: commp.pcid_v1(),
        remove_unsealed_copy: false,
        skip_ipni_announce: false,
    }
}

/// Start a provider-side swarm that answers every proposal with the given
/// verdict. Returns its peer id and a dialable address.
async fn spawn_responder(accepted: bool, message: &str) -> (PeerId, Multiaddr) {
    let message = message.to_string();
    let mut swarm = libp2p::SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .unwrap()
        .with_behaviour(|_| {
            request_response::Behaviour::with_codec(
                ProposalCodec,
                [(
                    StreamProtocol::new(STORAGE_PROPOSAL_V120),
                    ProtocolSupport::Full,
                )],
                request_response::Config::default(),
            )
        })
        .unwrap()
        .build();

    let peer_id = *swarm.local_peer_id();
    swarm
        .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .unwrap();

    let addr = loop {
        if let SwarmEvent::NewListenAddr { address, .. } = swarm.select_next_some().await {
            break address;
        }
    };

    tokio::spawn(async move {
        loop {
            if let SwarmEvent::Behaviour(request_response::Event::Message {
                message:
                    request_response::Message::Request {
                        channel, ..
                    },
                ..
            }) = swarm.select_next_some().await
            {
                let _ = swarm.behaviour_mut().send_response(
                    channel,
                    StorageProposalV120Response {
                        accepted,
                        message: message.clone(),
                    },
                );
            }
        }
    });

    (peer_id, addr)
}

#[tokio::test]
async fn accepted_proposal_roundtrip() {
    let (peer_id, addr) = spawn_responder(true, "").await;
    let client = DealClient::new(Duration::from_secs(10)).unwrap();

    let target = AddrInfo {
        peer_id,
        multiaddrs: vec![addr],
    };
    let (outcome, took) = client.propose(&target, sample_params()).await;
    let resp = outcome.unwrap();
    assert!(resp.accepted);
    assert!(took < Duration::from_secs(10));

    client.close_peer(peer_id).await;
}

#[tokio::test]
async fn rejected_proposal_carries_message() {
    let (peer_id, addr) = spawn_responder(false, "not accepting deals from this client").await;
    let client = DealClient::new(Duration::from_secs(10)).unwrap();

    let target = AddrInfo {
        peer_id,
        multiaddrs: vec![addr],
    };
    let (outcome, _) = client.propose(&target, sample_params()).await;
    let resp = outcome.unwrap();
    assert!(!resp.accepted);
    assert_eq!(resp.message, "not accepting deals from this client");
}

#[tokio::test]
async fn dead_address_is_undialable_not_hung() {
    let client = DealClient::new(Duration::from_secs(5)).unwrap();
    let target = AddrInfo {
        peer_id: PeerId::random(),
        multiaddrs: vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
    };
    let (outcome, took) = client.propose(&target, sample_params()).await;
    match outcome {
        Err(Lp2pError::Undialable(_)) | Err(Lp2pError::DeadlineExceeded) => {}
        other => panic!("expected a dial failure, got {other:?}"),
    }
    assert!(took < Duration::from_secs(15));
}

#[test]
fn bad_attestations_are_rejected_up_front() {
    assert!(matches!(
        AddrInfo::from_attested("not-a-peer-id", &["/ip4/1.2.3.4/tcp/1".into()]),
        Err(Lp2pError::Undialable(_))
    ));

    let peer = PeerId::random().to_string();
    assert!(matches!(
        AddrInfo::from_attested(&peer, &[]),
        Err(Lp2pError::Undialable(_))
    ));
    assert!(AddrInfo::from_attested(&peer, &["/ip4/10.0.0.1/tcp/24001".into()]).is_ok());
}
