//! Wire schema of the storage-proposal RPC.

use cid::Cid;
use serde::{Deserialize, Serialize};
use stevedore_core::deal::ClientDealProposal;
use uuid::Uuid;

/// Protocol id of the v1.2.0 storage proposal exchange.
pub const STORAGE_PROPOSAL_V120: &str = "/fil/storage/mk/1.2.0";

/// Request body of a storage proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProposalV120Params {
    #[serde(rename = "DealUUID", with = "uuid_bytes")]
    pub deal_uuid: Uuid,
    /// Always true here: piece bytes move out of band, never over the deal
    /// transfer channel.
    #[serde(rename = "IsOffline")]
    pub is_offline: bool,
    #[serde(rename = "ClientDealProposal")]
    pub client_deal_proposal: ClientDealProposal,
    /// There is no separate data root for offline deals; set to the piece
    /// CID itself.
    #[serde(rename = "DealDataRoot")]
    pub deal_data_root: Cid,
    #[serde(rename = "RemoveUnsealedCopy")]
    pub remove_unsealed_copy: bool,
    #[serde(rename = "SkipIPNIAnnounce")]
    pub skip_ipni_announce: bool,
}

/// Response body of a storage proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProposalV120Response {
    #[serde(rename = "Accepted")]
    pub accepted: bool,
    #[serde(rename = "Message", default)]
    pub message: String,
}

mod uuid_bytes {
    use serde::de::{Error as DeError, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(u: &Uuid, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(u.as_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Uuid, D::Error> {
        struct UuidVisitor;
        impl<'de> Visitor<'de> for UuidVisitor {
            type Value = Uuid;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "16 uuid bytes")
            }

            fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<Uuid, E> {
                Uuid::from_slice(v).map_err(E::custom)
            }

            fn visit_byte_buf<E: DeError>(self, v: Vec<u8>) -> Result<Uuid, E> {
                self.visit_bytes(&v)
            }
        }
        d.deserialize_byte_buf(UuidVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::address::Address;
    use stevedore_core::deal::{DealProposal, Label, Signature, TokenAmount};
    use stevedore_core::piece::CommP;

    fn sample_params() -> StorageProposalV120Params {
        let commp = CommP::new([0x17; 32], 28).unwrap();
        let proposal = DealProposal {
            piece_cid: commp.pcid_v1(),
            piece_size: commp.padded_size(),
            verified_deal: true,
            client: Address::Secp256k1([4; 20]),
            provider: Address::Id(999),
            label: Label::Bytes(commp.pcid_v2().to_bytes()),
            start_epoch: 100,
            end_epoch: 200,
            storage_price_per_epoch: TokenAmount::zero(),
            provider_collateral: TokenAmount::zero(),
            client_collateral: TokenAmount::zero(),
        };
        StorageProposalV120Params {
            deal_uuid: Uuid::new_v4(),
            is_offline: true,
            client_deal_proposal: ClientDealProposal {
                proposal,
                client_signature: Signature::new_secp256k1(vec![1; 65]),
            },
            deal_data_root: commp.pcid_v1(),
            remove_unsealed_copy: false,
            skip_ipni_announce: false,
        }
    }

    #[test]
    fn params_cbor_roundtrip() {
        let params = sample_params();
        let bytes = serde_ipld_dagcbor::to_vec(&params).unwrap();
        let back: StorageProposalV120Params = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        assert_eq!(back.deal_uuid, params.deal_uuid);
        assert_eq!(back.client_deal_proposal, params.client_deal_proposal);
        assert!(back.is_offline);
    }

    #[test]
    fn response_cbor_roundtrip() {
        let resp = StorageProposalV120Response {
            accepted: false,
            message: "piece size above sector capacity".into(),
        };
        let bytes = serde_ipld_dagcbor::to_vec(&resp).unwrap();
        let back: StorageProposalV120Response = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        assert!(!back.accepted);
        assert_eq!(back.message, resp.message);
    }
}
