//! Chain actor addresses.
//!
//! Addresses come in an ID form (`f0...`, a bare actor number) and robust
//! key-derived forms (`f1...` secp256k1, `f2...` actor, `f3...` BLS). The
//! broker stores providers and clients by actor id but must round-trip the
//! robust forms for signing and for the deal payload wire encoding.

use crate::error::{Error, Result};
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const NETWORK_PREFIX: char = 'f';
const CHECKSUM_LEN: usize = 4;
const SECP_PAYLOAD_LEN: usize = 20;
const ACTOR_PAYLOAD_LEN: usize = 20;
const BLS_PAYLOAD_LEN: usize = 48;

/// A bare on-chain actor id (the numeric part of an `f0...` address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub u64);

impl ActorId {
    /// The ID-form address for this actor.
    pub fn as_address(&self) -> Address {
        Address::Id(self.0)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{NETWORK_PREFIX}0{}", self.0)
    }
}

impl FromStr for ActorId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match Address::from_str(s)? {
            Address::Id(id) => Ok(ActorId(id)),
            other => Err(Error::InvalidAddress(format!(
                "expected an ID-form address, got {other}"
            ))),
        }
    }
}

/// A chain address in any of its protocol forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Id(u64),
    Secp256k1([u8; SECP_PAYLOAD_LEN]),
    Actor([u8; ACTOR_PAYLOAD_LEN]),
    Bls([u8; BLS_PAYLOAD_LEN]),
}

impl Address {
    /// Protocol discriminant byte.
    pub fn protocol(&self) -> u8 {
        match self {
            Address::Id(_) => 0,
            Address::Secp256k1(_) => 1,
            Address::Actor(_) => 2,
            Address::Bls(_) => 3,
        }
    }

    /// True for the ID form, which carries no key material and must be
    /// dereferenced to its robust form before signing.
    pub fn is_id(&self) -> bool {
        matches!(self, Address::Id(_))
    }

    /// Derive the secp256k1 robust address for an uncompressed public key.
    pub fn from_secp_pubkey(uncompressed: &[u8]) -> Address {
        let mut payload = [0u8; SECP_PAYLOAD_LEN];
        payload.copy_from_slice(&blake2b(SECP_PAYLOAD_LEN, &[uncompressed]));
        Address::Secp256k1(payload)
    }

    /// Wire form: protocol byte followed by the payload. This is the byte
    /// string used in CBOR deal payloads and as checksum input.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.protocol()];
        match self {
            Address::Id(id) => put_uvarint(&mut out, *id),
            Address::Secp256k1(p) | Address::Actor(p) => out.extend_from_slice(p),
            Address::Bls(p) => out.extend_from_slice(p),
        }
        out
    }

    /// Parse the wire form produced by [`Address::to_bytes`].
    pub fn from_bytes(b: &[u8]) -> Result<Address> {
        let (&proto, payload) = b
            .split_first()
            .ok_or_else(|| Error::InvalidAddress("empty address bytes".into()))?;
        match proto {
            0 => {
                let (id, used) = take_uvarint(payload)
                    .ok_or_else(|| Error::InvalidAddress("bad ID varint".into()))?;
                if used != payload.len() {
                    return Err(Error::InvalidAddress("trailing bytes after ID".into()));
                }
                Ok(Address::Id(id))
            }
            1 => Ok(Address::Secp256k1(fixed_payload(payload)?)),
            2 => Ok(Address::Actor(fixed_payload(payload)?)),
            3 => Ok(Address::Bls(fixed_payload(payload)?)),
            other => Err(Error::InvalidAddress(format!("unknown protocol {other}"))),
        }
    }

    fn checksum(&self) -> [u8; CHECKSUM_LEN] {
        let mut out = [0u8; CHECKSUM_LEN];
        out.copy_from_slice(&blake2b(CHECKSUM_LEN, &[&self.to_bytes()]));
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Id(id) => write!(f, "{NETWORK_PREFIX}0{id}"),
            Address::Secp256k1(p) => write_robust(f, 1, p, self.checksum()),
            Address::Actor(p) => write_robust(f, 2, p, self.checksum()),
            Address::Bls(p) => write_robust(f, 3, p, self.checksum()),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        if chars.next() != Some(NETWORK_PREFIX) {
            return Err(Error::InvalidAddress(format!("bad network prefix in '{s}'")));
        }
        let proto = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| Error::InvalidAddress(format!("missing protocol in '{s}'")))?;
        let rest = &s[2..];

        if proto == 0 {
            let id: u64 = rest
                .parse()
                .map_err(|_| Error::InvalidAddress(format!("bad actor number in '{s}'")))?;
            return Ok(Address::Id(id));
        }

        let raw = data_encoding::BASE32_NOPAD
            .decode(rest.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::InvalidAddress(format!("bad base32 in '{s}': {e}")))?;
        if raw.len() < CHECKSUM_LEN {
            return Err(Error::InvalidAddress(format!("'{s}' too short")));
        }
        let (payload, cksum) = raw.split_at(raw.len() - CHECKSUM_LEN);

        let mut wire = vec![proto as u8];
        wire.extend_from_slice(payload);
        let addr = Address::from_bytes(&wire)?;
        if addr.checksum() != cksum {
            return Err(Error::InvalidAddress(format!("checksum mismatch in '{s}'")));
        }
        Ok(addr)
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn write_robust(
    f: &mut fmt::Formatter<'_>,
    proto: u8,
    payload: &[u8],
    cksum: [u8; CHECKSUM_LEN],
) -> fmt::Result {
    let mut raw = payload.to_vec();
    raw.extend_from_slice(&cksum);
    let enc = data_encoding::BASE32_NOPAD.encode(&raw).to_ascii_lowercase();
    write!(f, "{NETWORK_PREFIX}{proto}{enc}")
}

fn fixed_payload<const N: usize>(payload: &[u8]) -> Result<[u8; N]> {
    payload
        .try_into()
        .map_err(|_| Error::InvalidAddress(format!("expected {N}-byte payload, got {}", payload.len())))
}

fn blake2b(len: usize, parts: &[&[u8]]) -> Vec<u8> {
    let mut h = Blake2bVar::new(len).expect("output length is static and valid");
    for p in parts {
        h.update(p);
    }
    let mut out = vec![0u8; len];
    h.finalize_variable(&mut out)
        .expect("buffer length matches requested output");
    out
}

/// blake2b-256, the digest the chain applies before signature verification.
pub fn signing_digest(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&blake2b(32, &[data]));
    out
}

fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

fn take_uvarint(b: &[u8]) -> Option<(u64, usize)> {
    let mut v: u64 = 0;
    for (i, &byte) in b.iter().enumerate() {
        if i >= 10 {
            return None;
        }
        v |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((v, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_address_roundtrip() {
        let addr: Address = "f01151139".parse().unwrap();
        assert_eq!(addr, Address::Id(1151139));
        assert_eq!(addr.to_string(), "f01151139");
        assert_eq!(Address::from_bytes(&addr.to_bytes()).unwrap(), addr);
    }

    #[test]
    fn actor_id_rejects_robust_forms() {
        let secp = Address::Secp256k1([7u8; 20]);
        assert!(secp.to_string().parse::<ActorId>().is_err());
        assert!("f0999".parse::<ActorId>().is_ok());
    }

    #[test]
    fn robust_address_string_roundtrip() {
        let addr = Address::Secp256k1([0xab; 20]);
        let s = addr.to_string();
        assert!(s.starts_with("f1"));
        let parsed: Address = s.parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let s = Address::Secp256k1([3u8; 20]).to_string();
        // flip the final character to damage the checksum
        let mut chars: Vec<char> = s.chars().collect();
        let last = *chars.last().unwrap();
        *chars.last_mut().unwrap() = if last == 'a' { 'b' } else { 'a' };
        let bad: String = chars.into_iter().collect();
        assert!(bad.parse::<Address>().is_err());
    }

    #[test]
    fn wire_bytes_roundtrip_all_protocols() {
        for addr in [
            Address::Id(0),
            Address::Id(u64::MAX),
            Address::Secp256k1([1; 20]),
            Address::Actor([2; 20]),
            Address::Bls([3; 48]),
        ] {
            assert_eq!(Address::from_bytes(&addr.to_bytes()).unwrap(), addr);
        }
    }
}
