//! Deal-proposal wire payloads.
//!
//! The market actor consumes proposals as tuple-encoded dag-cbor: an
//! 11-element array in a fixed field order, with addresses and token amounts
//! as raw byte strings and the label as a bytes/text union. The encoding here
//! must be canonical because the client signature and the signed-proposal CID
//! are both computed over these exact bytes.

use crate::address::Address;
use crate::error::{Error, Result};
use cid::Cid;
use multihash::Multihash;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Multicodec for dag-cbor, the codec of signed-proposal CIDs.
pub const DAG_CBOR_CODEC: u64 = 0x71;

/// Multihash code for blake2b-256.
pub const BLAKE2B_256: u64 = 0xb220;

/// An attobase token amount. Deals brokered here are always zero-priced and
/// zero-collateral, but the wire form carries arbitrary magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenAmount(pub u128);

impl TokenAmount {
    pub fn zero() -> Self {
        TokenAmount(0)
    }

    /// Chain big-int bytes: empty for zero, else a sign byte (0x00 =
    /// non-negative) followed by the big-endian magnitude.
    fn to_chain_bytes(self) -> Vec<u8> {
        if self.0 == 0 {
            return Vec::new();
        }
        let be = self.0.to_be_bytes();
        let first = be.iter().position(|&b| b != 0).unwrap_or(be.len() - 1);
        let mut out = Vec::with_capacity(1 + be.len() - first);
        out.push(0x00);
        out.extend_from_slice(&be[first..]);
        out
    }

    fn from_chain_bytes(b: &[u8]) -> Result<Self> {
        if b.is_empty() {
            return Ok(TokenAmount(0));
        }
        if b[0] != 0x00 {
            return Err(Error::Serialization(
                "negative token amounts are not representable here".into(),
            ));
        }
        let mag = &b[1..];
        if mag.len() > 16 {
            return Err(Error::Serialization("token amount exceeds u128".into()));
        }
        let mut be = [0u8; 16];
        be[16 - mag.len()..].copy_from_slice(mag);
        Ok(TokenAmount(u128::from_be_bytes(be)))
    }
}

/// A deal label: either raw bytes (this broker always stores the piece v2
/// CID bytes) or a UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Bytes(Vec<u8>),
    String(String),
}

impl Label {
    /// The raw byte view, regardless of kind.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Label::Bytes(b) => b,
            Label::String(s) => s.as_bytes(),
        }
    }

    /// Best-effort CID decode of the label contents.
    pub fn decoded_cid(&self) -> Option<Cid> {
        match self {
            Label::Bytes(b) => Cid::try_from(b.as_slice()).ok(),
            Label::String(s) => s.parse().ok(),
        }
    }
}

/// Signature algorithms the chain accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Secp256k1,
    Bls,
}

impl SignatureType {
    fn code(self) -> u8 {
        match self {
            SignatureType::Secp256k1 => 1,
            SignatureType::Bls => 2,
        }
    }
}

/// A chain signature: algorithm discriminant plus raw signature bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub sig_type: SignatureType,
    pub bytes: Vec<u8>,
}

impl Signature {
    pub fn new_secp256k1(bytes: Vec<u8>) -> Self {
        Self {
            sig_type: SignatureType::Secp256k1,
            bytes,
        }
    }
}

/// The unsigned deal proposal, in market-actor field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,
    pub label: Label,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub storage_price_per_epoch: TokenAmount,
    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl DealProposal {
    /// Canonical CBOR bytes, the domain over which the client signs.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_cbor(b: &[u8]) -> Result<Self> {
        serde_ipld_dagcbor::from_slice(b).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// A proposal bundled with its client signature, as delivered to providers
/// and published on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

impl ClientDealProposal {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// The signed-proposal CID: blake2b-256 over the dag-cbor encoding.
    pub fn cid(&self) -> Result<Cid> {
        let bytes = self.to_cbor()?;
        let digest = crate::address::signing_digest(&bytes);
        let mh = Multihash::wrap(BLAKE2B_256, &digest)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Cid::new_v1(DAG_CBOR_CODEC, mh))
    }
}

// ---------------------------------------------------------------------------
// serde plumbing. All of these encode to CBOR primitives, never maps: the
// chain's tuple encoding leaves no room for field names.
// ---------------------------------------------------------------------------

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_bytes(&self.to_chain_bytes())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let bytes = d.deserialize_byte_buf(ByteBufVisitor)?;
        TokenAmount::from_chain_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Label::Bytes(b) => s.serialize_bytes(b),
            Label::String(st) => s.serialize_str(st),
        }
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct LabelVisitor;
        impl<'de> Visitor<'de> for LabelVisitor {
            type Value = Label;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a byte string or text string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Label, E> {
                Ok(Label::Bytes(v.to_vec()))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> std::result::Result<Label, E> {
                Ok(Label::Bytes(v))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Label, E> {
                Ok(Label::String(v.to_string()))
            }

            fn visit_string<E: serde::de::Error>(self, v: String) -> std::result::Result<Label, E> {
                Ok(Label::String(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Label, A::Error> {
                // Non-CBOR formats (JSON meta blobs) surface bytes as a
                // number sequence.
                let mut out = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(Label::Bytes(out))
            }
        }
        d.deserialize_any(LabelVisitor)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let mut out = Vec::with_capacity(1 + self.bytes.len());
        out.push(self.sig_type.code());
        out.extend_from_slice(&self.bytes);
        s.serialize_bytes(&out)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = d.deserialize_byte_buf(ByteBufVisitor)?;
        let (&code, bytes) = raw
            .split_first()
            .ok_or_else(|| serde::de::Error::custom("empty signature"))?;
        let sig_type = match code {
            1 => SignatureType::Secp256k1,
            2 => SignatureType::Bls,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unknown signature type {other}"
                )))
            }
        };
        Ok(Signature {
            sig_type,
            bytes: bytes.to_vec(),
        })
    }
}

/// Cid wrapper used inside the tuple encoding: native IPLD links in binary
/// formats, string form in human-readable ones (the meta-blob JSON path).
struct CidField(Cid);

impl Serialize for CidField {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.collect_str(&self.0)
        } else {
            self.0.serialize(s)
        }
    }
}

impl<'de> Deserialize<'de> for CidField {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        if d.is_human_readable() {
            let raw = String::deserialize(d)?;
            raw.parse().map(CidField).map_err(serde::de::Error::custom)
        } else {
            Cid::deserialize(d).map(CidField)
        }
    }
}

/// Address wrapper used only inside the tuple encoding.
struct AddrBytes<'a>(&'a Address);

impl Serialize for AddrBytes<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_bytes(&self.0.to_bytes())
    }
}

fn addr_from_seq<'de, A: SeqAccess<'de>>(seq: &mut A, field: &str) -> std::result::Result<Address, A::Error> {
    let raw: ByteBuf = seq
        .next_element()?
        .ok_or_else(|| serde::de::Error::custom(format!("missing {field}")))?;
    Address::from_bytes(&raw.0).map_err(serde::de::Error::custom)
}

struct ByteBuf(Vec<u8>);

impl<'de> Deserialize<'de> for ByteBuf {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        d.deserialize_byte_buf(ByteBufVisitor).map(ByteBuf)
    }
}

struct ByteBufVisitor;

impl<'de> Visitor<'de> for ByteBufVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a byte string")
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Vec<u8>, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> std::result::Result<Vec<u8>, E> {
        Ok(v)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<u8>, A::Error> {
        let mut out = Vec::new();
        while let Some(b) = seq.next_element::<u8>()? {
            out.push(b);
        }
        Ok(out)
    }
}

impl Serialize for DealProposal {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let mut t = s.serialize_tuple(11)?;
        t.serialize_element(&CidField(self.piece_cid))?;
        t.serialize_element(&self.piece_size)?;
        t.serialize_element(&self.verified_deal)?;
        t.serialize_element(&AddrBytes(&self.client))?;
        t.serialize_element(&AddrBytes(&self.provider))?;
        t.serialize_element(&self.label)?;
        t.serialize_element(&self.start_epoch)?;
        t.serialize_element(&self.end_epoch)?;
        t.serialize_element(&self.storage_price_per_epoch)?;
        t.serialize_element(&self.provider_collateral)?;
        t.serialize_element(&self.client_collateral)?;
        t.end()
    }
}

impl<'de> Deserialize<'de> for DealProposal {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct ProposalVisitor;
        impl<'de> Visitor<'de> for ProposalVisitor {
            type Value = DealProposal;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "an 11-element deal proposal tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<DealProposal, A::Error> {
                let missing = |f: &str| serde::de::Error::custom(format!("missing {f}"));
                Ok(DealProposal {
                    piece_cid: seq
                        .next_element::<CidField>()?
                        .ok_or_else(|| missing("piece_cid"))?
                        .0,
                    piece_size: seq.next_element()?.ok_or_else(|| missing("piece_size"))?,
                    verified_deal: seq.next_element()?.ok_or_else(|| missing("verified_deal"))?,
                    client: addr_from_seq(&mut seq, "client")?,
                    provider: addr_from_seq(&mut seq, "provider")?,
                    label: seq.next_element()?.ok_or_else(|| missing("label"))?,
                    start_epoch: seq.next_element()?.ok_or_else(|| missing("start_epoch"))?,
                    end_epoch: seq.next_element()?.ok_or_else(|| missing("end_epoch"))?,
                    storage_price_per_epoch: seq
                        .next_element()?
                        .ok_or_else(|| missing("storage_price_per_epoch"))?,
                    provider_collateral: seq
                        .next_element()?
                        .ok_or_else(|| missing("provider_collateral"))?,
                    client_collateral: seq
                        .next_element()?
                        .ok_or_else(|| missing("client_collateral"))?,
                })
            }
        }
        d.deserialize_tuple(11, ProposalVisitor)
    }
}

impl Serialize for ClientDealProposal {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let mut t = s.serialize_tuple(2)?;
        t.serialize_element(&self.proposal)?;
        t.serialize_element(&self.client_signature)?;
        t.end()
    }
}

impl<'de> Deserialize<'de> for ClientDealProposal {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct CdpVisitor;
        impl<'de> Visitor<'de> for CdpVisitor {
            type Value = ClientDealProposal;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a (proposal, signature) tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<ClientDealProposal, A::Error> {
                let proposal = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::custom("missing proposal"))?;
                let client_signature = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::custom("missing signature"))?;
                Ok(ClientDealProposal {
                    proposal,
                    client_signature,
                })
            }
        }
        d.deserialize_tuple(2, CdpVisitor)
    }
}
