//! Piece commitments and their CID forms.
//!
//! A piece is a power-of-two-sized unit of storage addressed by the root of
//! its fr32 merkle commitment. The commitment travels in two CID encodings:
//! the legacy v1 form (bare 32-byte root) and the v2 form whose multihash
//! digest also carries the tree height and trailing padding, making the CID
//! self-describing with respect to size.

use crate::error::{Error, Result};
use cid::Cid;
use multihash::Multihash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Multicodec for an unsealed piece commitment (v1 piece CIDs).
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;

/// Multihash for the bare sha2-256-trunc254-padded root (v1 piece CIDs).
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

/// Multicodec `raw`, used by v2 piece CIDs.
pub const RAW_CODEC: u64 = 0x55;

/// Multihash carrying height+padding alongside the root (v2 piece CIDs).
pub const FR32_SHA256_TRUNC254_PADBINTREE: u64 = 0x1011;

/// Smallest supported piece: 2^5 = one 32-byte merkle leaf.
pub const MIN_PIECE_LOG2_SIZE: u8 = 5;

/// Largest supported piece: 2^36 = 64 GiB.
pub const MAX_PIECE_LOG2_SIZE: u8 = 36;

/// A piece commitment together with its padded size.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommP {
    root: [u8; 32],
    log2_size: u8,
    /// Trailing bytes of the padded tree not covered by payload. Zero for
    /// every piece the broker mints itself; preserved on parse for fidelity.
    padding: u64,
}

impl CommP {
    /// Construct from a raw commitment root and padded-size exponent.
    pub fn new(root: [u8; 32], log2_size: u8) -> Result<Self> {
        if !(MIN_PIECE_LOG2_SIZE..=MAX_PIECE_LOG2_SIZE).contains(&log2_size) {
            return Err(Error::Log2SizeOutOfRange(log2_size));
        }
        Ok(Self {
            root,
            log2_size,
            padding: 0,
        })
    }

    /// The 32-byte commitment root.
    pub fn root(&self) -> &[u8; 32] {
        &self.root
    }

    /// Padded piece size exponent.
    pub fn log2_size(&self) -> u8 {
        self.log2_size
    }

    /// Padded piece size in bytes.
    pub fn padded_size(&self) -> u64 {
        1u64 << self.log2_size
    }

    /// Merkle tree height above the 32-byte leaves.
    pub fn height(&self) -> u8 {
        self.log2_size - MIN_PIECE_LOG2_SIZE
    }

    /// Parse the legacy v1 form. The CID does not carry size, so the caller
    /// supplies the padded-size exponent from its own records.
    pub fn from_pcid_v1(c: &Cid, log2_size: u8) -> Result<Self> {
        if c.codec() != FIL_COMMITMENT_UNSEALED || c.hash().code() != SHA2_256_TRUNC254_PADDED {
            return Err(Error::InvalidPieceCid(format!(
                "{c} is not a v1 piece commitment"
            )));
        }
        let digest: [u8; 32] = c
            .hash()
            .digest()
            .try_into()
            .map_err(|_| Error::InvalidPieceCid(format!("{c} digest is not 32 bytes")))?;
        Self::new(digest, log2_size)
    }

    /// Parse the v2 form, recovering size and padding from the digest.
    pub fn from_pcid_v2(c: &Cid) -> Result<Self> {
        if c.codec() != RAW_CODEC || c.hash().code() != FR32_SHA256_TRUNC254_PADBINTREE {
            return Err(Error::InvalidPieceCid(format!(
                "{c} is not a v2 piece commitment"
            )));
        }
        let digest = c.hash().digest();
        let (padding, used) = take_uvarint(digest)
            .ok_or_else(|| Error::InvalidPieceCid(format!("{c} has a malformed padding varint")))?;
        let rest = &digest[used..];
        if rest.len() != 33 {
            return Err(Error::InvalidPieceCid(format!(
                "{c} digest has {} trailing bytes, expected 33",
                rest.len()
            )));
        }
        let height = rest[0];
        let mut root = [0u8; 32];
        root.copy_from_slice(&rest[1..]);
        let mut commp = Self::new(root, height + MIN_PIECE_LOG2_SIZE)?;
        commp.padding = padding;
        Ok(commp)
    }

    /// The legacy v1 CID (bare root, no size information).
    pub fn pcid_v1(&self) -> Cid {
        let mh = Multihash::wrap(SHA2_256_TRUNC254_PADDED, &self.root)
            .expect("32-byte digest always fits");
        Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh)
    }

    /// The v2 CID carrying padding, height and root.
    pub fn pcid_v2(&self) -> Cid {
        let mut digest = Vec::with_capacity(43);
        put_uvarint(&mut digest, self.padding);
        digest.push(self.height());
        digest.extend_from_slice(&self.root);
        let mh = Multihash::wrap(FR32_SHA256_TRUNC254_PADBINTREE, &digest)
            .expect("digest is at most 43 bytes");
        Cid::new_v1(RAW_CODEC, mh)
    }

    /// The (v1 CID, padded size) pair used by aggregation arithmetic.
    pub fn piece_info(&self) -> PieceInfo {
        PieceInfo {
            cid: self.pcid_v1(),
            size: self.padded_size(),
        }
    }
}

impl fmt::Debug for CommP {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommP({}, 2^{})", self.pcid_v1(), self.log2_size)
    }
}

/// A piece identified by its v1 CID and padded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub cid: Cid,
    pub size: u64,
}

impl PieceInfo {
    /// Recover the commitment; fails if `size` is not a supported power of two.
    pub fn commp(&self) -> Result<CommP> {
        if !self.size.is_power_of_two() {
            return Err(Error::SizeNotPowerOfTwo { size: self.size });
        }
        CommP::from_pcid_v1(&self.cid, self.size.trailing_zeros() as u8)
    }
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

    fn sample(root_byte: u8, log2: u8) -> CommP {
        CommP::new([root_byte; 32], log2).unwrap()
    }

    #[test]
    fn v1_roundtrip() {
        let c = sample(0x11, 30);
        let parsed = CommP::from_pcid_v1(&c.pcid_v1(), 30).unwrap();
        assert_eq!(parsed, c);
    }

    #[test]
    fn v2_roundtrip_carries_size() {
        let c = sample(0x22, 28);
        let parsed = CommP::from_pcid_v2(&c.pcid_v2()).unwrap();
        assert_eq!(parsed, c);
        assert_eq!(parsed.padded_size(), 1 << 28);
    }

    #[test]
    fn v1_and_v2_share_the_root() {
        let c = sample(0x33, 20);
        let via_v2 = CommP::from_pcid_v2(&c.pcid_v2()).unwrap();
        assert_eq!(via_v2.pcid_v1(), c.pcid_v1());
    }

    #[test]
    fn rejects_out_of_range_sizes() {
        assert!(CommP::new([0; 32], 4).is_err());
        assert!(CommP::new([0; 32], 37).is_err());
        assert!(CommP::new([0; 32], 5).is_ok());
        assert!(CommP::new([0; 32], 36).is_ok());
    }

    #[test]
    fn v2_parse_rejects_wrong_codec() {
        let c = sample(0x44, 21);
        assert!(CommP::from_pcid_v2(&c.pcid_v1()).is_err());
        assert!(CommP::from_pcid_v1(&c.pcid_v2(), 21).is_err());
    }

    #[test]
    fn piece_info_size_must_be_power_of_two() {
        let c = sample(0x55, 17);
        let mut pi = c.piece_info();
        assert_eq!(pi.commp().unwrap(), c);
        pi.size = 100;
        assert!(matches!(pi.commp(), Err(Error::SizeNotPowerOfTwo { .. })));
    }
}
