//! Segment-aggregation arithmetic.
//!
//! An aggregate piece is a hybrid merkle tree: each data segment's own
//! commitment subtree is grafted in at a size-aligned offset, the tail of the
//! tree carries an index describing the segments, and everything in between
//! is zero-fill. Verifying a tenant-supplied manifest means recomputing the
//! aggregate root from the claimed segment list and comparing commitments.
//!
//! Node arithmetic is sha2-256 with the two high bits of the final byte
//! cleared, matching the fr32 commitment domain of [`crate::piece`].

use crate::error::{Error, Result};
use crate::piece::{CommP, PieceInfo, MIN_PIECE_LOG2_SIZE};
use sha2::{Digest, Sha256};

/// A 32-byte tree node.
pub type Node = [u8; 32];

const NODE_SIZE: u64 = 32;

/// Bytes per serialized index entry: root + offset + size + checksum.
const INDEX_ENTRY_SIZE: u64 = 64;

/// Fraction of the aggregate reserved for the segment index.
const INDEX_RESERVATION_DENOMINATOR: u64 = 2048;

/// Smallest index the construction ever emits.
const MIN_INDEX_ENTRIES: u64 = 4;

/// Combine two child nodes into their parent.
pub fn combine(left: &Node, right: &Node) -> Node {
    let mut h = Sha256::new();
    h.update(left);
    h.update(right);
    let mut out: Node = h.finalize().into();
    out[31] &= 0x3f;
    out
}

/// Root of an all-zero subtree of the given height.
fn zero_node(height: u8) -> Node {
    // heights never exceed 31
    let mut n = [0u8; 32];
    for _ in 0..height {
        n = combine(&n, &n);
    }
    n
}

/// Number of index entries reserved in an aggregate of the given size.
pub fn index_entries_for_size(agg_size: u64) -> u64 {
    (agg_size / INDEX_RESERVATION_DENOMINATOR / INDEX_ENTRY_SIZE).max(MIN_INDEX_ENTRIES)
}

#[derive(Debug, Clone, Copy)]
struct PlacedSegment {
    offset: u64,
    size: u64,
    root: Node,
}

/// A fully laid-out aggregate, ready to yield its commitment.
#[derive(Debug, Clone)]
pub struct Aggregate {
    log2_size: u8,
    segments: Vec<PlacedSegment>,
    index_start: u64,
    index_bytes: Vec<u8>,
}

impl Aggregate {
    /// Lay out `segments` (in order) inside an aggregate of `agg_size` padded
    /// bytes. Each segment lands at the next offset aligned to its own size;
    /// the index occupies the reserved tail region. Fails if the segments and
    /// index cannot coexist.
    pub fn new(agg_size: u64, segments: &[PieceInfo]) -> Result<Self> {
        if !agg_size.is_power_of_two() {
            return Err(Error::SizeNotPowerOfTwo { size: agg_size });
        }
        let log2_size = agg_size.trailing_zeros() as u8;

        let index_bytes_len = index_entries_for_size(agg_size) * INDEX_ENTRY_SIZE;
        let index_start = agg_size.checked_sub(index_bytes_len).ok_or_else(|| {
            Error::SegmentOverflow {
                size: agg_size,
                detail: format!("index alone needs {index_bytes_len} bytes"),
            }
        })?;

        let mut placed = Vec::with_capacity(segments.len());
        let mut cursor = 0u64;
        for (i, pi) in segments.iter().enumerate() {
            let commp = pi.commp()?;
            let size = commp.padded_size();
            let offset = cursor.next_multiple_of(size);
            if offset + size > index_start {
                return Err(Error::SegmentOverflow {
                    size: agg_size,
                    detail: format!(
                        "segment {i} ({size} bytes) would end at {} but the index begins at {index_start}",
                        offset + size
                    ),
                });
            }
            placed.push(PlacedSegment {
                offset,
                size,
                root: *commp.root(),
            });
            cursor = offset + size;
        }

        let index_bytes = serialize_index(&placed, index_bytes_len as usize);

        Ok(Self {
            log2_size,
            segments: placed,
            index_start,
            index_bytes,
        })
    }

    /// The aggregate's commitment.
    pub fn commp(&self) -> Result<CommP> {
        let height = self.log2_size - MIN_PIECE_LOG2_SIZE;
        let root = self.node_at(height, 0);
        CommP::new(root, self.log2_size)
    }

    /// Convenience: the v1 piece CID of the aggregate.
    pub fn pcid_v1(&self) -> Result<cid::Cid> {
        Ok(self.commp()?.pcid_v1())
    }

    fn node_at(&self, height: u8, offset: u64) -> Node {
        let span = NODE_SIZE << height;

        if let Some(seg) = self
            .segments
            .iter()
            .find(|s| s.offset == offset && s.size == span)
        {
            return seg.root;
        }

        let overlaps_segment = self
            .segments
            .iter()
            .any(|s| s.offset < offset + span && offset < s.offset + s.size);
        let overlaps_index = self.index_start < offset + span;

        if !overlaps_segment && !overlaps_index {
            return zero_node(height);
        }

        if height == 0 {
            // Leaves only reach here inside the index region; segment
            // subtrees are matched exactly above.
            let rel = (offset - self.index_start) as usize;
            let mut leaf = [0u8; 32];
            leaf.copy_from_slice(&self.index_bytes[rel..rel + 32]);
            return leaf;
        }

        let half = span / 2;
        combine(
            &self.node_at(height - 1, offset),
            &self.node_at(height - 1, offset + half),
        )
    }
}

/// Serialize segment descriptors into the fixed-size index region. Unused
/// entries stay zero.
fn serialize_index(segments: &[PlacedSegment], index_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; index_len];
    for (i, seg) in segments.iter().enumerate() {
        let at = i * INDEX_ENTRY_SIZE as usize;
        let entry = &mut out[at..at + INDEX_ENTRY_SIZE as usize];
        entry[..32].copy_from_slice(&seg.root);
        entry[32..40].copy_from_slice(&seg.offset.to_le_bytes());
        entry[40..48].copy_from_slice(&seg.size.to_le_bytes());
        let cksum = entry_checksum(&entry[..48]);
        entry[48..64].copy_from_slice(&cksum);
    }
    out
}

fn entry_checksum(described: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(described);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out[15] &= 0x3f;
    out
}

/// Recompute the aggregate commitment for the claimed segment list and
/// compare it against the supplied aggregate. This is the manifest
/// self-consistency check the bulk ingester runs before accepting rows.
pub fn verify_aggregate(claimed: &CommP, segments: &[PieceInfo]) -> Result<()> {
    let agg = Aggregate::new(claimed.padded_size(), segments)?;
    let recomputed = agg.commp()?;
    if recomputed.pcid_v1() != claimed.pcid_v1() {
        return Err(Error::AggregateMismatch {
            expected: claimed.pcid_v1().to_string(),
            actual: recomputed.pcid_v1().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(root_byte: u8, log2: u8) -> PieceInfo {
        CommP::new([root_byte; 32], log2).unwrap().piece_info()
    }

    #[test]
    fn combine_clears_high_bits() {
        let n = combine(&[0xff; 32], &[0xff; 32]);
        assert_eq!(n[31] & 0xc0, 0);
    }

    #[test]
    fn zero_tree_is_consistent() {
        let z1 = zero_node(1);
        assert_eq!(z1, combine(&[0; 32], &[0; 32]));
        let z3 = zero_node(3);
        let z2 = zero_node(2);
        assert_eq!(z3, combine(&z2, &z2));
    }

    #[test]
    fn index_reservation_floor() {
        assert_eq!(index_entries_for_size(1 << 11), 4);
        assert_eq!(index_entries_for_size(1 << 30), (1 << 30) / 2048 / 64);
    }

    #[test]
    fn aggregate_is_deterministic() {
        let segments = vec![seg(1, 8), seg(2, 7), seg(3, 7)];
        let a = Aggregate::new(1 << 11, &segments).unwrap();
        let b = Aggregate::new(1 << 11, &segments).unwrap();
        assert_eq!(a.commp().unwrap(), b.commp().unwrap());
    }

    #[test]
    fn segment_order_matters() {
        let a = Aggregate::new(1 << 11, &[seg(1, 7), seg(2, 8)])
            .unwrap()
            .commp()
            .unwrap();
        let b = Aggregate::new(1 << 11, &[seg(2, 8), seg(1, 7)])
            .unwrap()
            .commp()
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn segments_are_size_aligned() {
        // A 2^7 segment followed by a 2^8 one forces a 128-byte alignment gap.
        let agg = Aggregate::new(1 << 11, &[seg(1, 7), seg(2, 8)]).unwrap();
        assert_eq!(agg.segments[0].offset, 0);
        assert_eq!(agg.segments[1].offset, 256);
    }

    #[test]
    fn overflow_into_index_region_is_rejected() {
        // 2^11 aggregate reserves 256 index bytes; a 2^11 segment cannot fit.
        let err = Aggregate::new(1 << 11, &[seg(1, 11)]).unwrap_err();
        assert!(matches!(err, Error::SegmentOverflow { .. }));
    }

    #[test]
    fn verify_accepts_matching_manifest() {
        let segments = vec![seg(9, 8), seg(8, 8)];
        let claimed = Aggregate::new(1 << 12, &segments).unwrap().commp().unwrap();
        verify_aggregate(&claimed, &segments).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_segment_list() {
        let segments = vec![seg(9, 8), seg(8, 8)];
        let claimed = Aggregate::new(1 << 12, &segments).unwrap().commp().unwrap();

        let swapped = vec![seg(8, 8), seg(9, 8)];
        assert!(matches!(
            verify_aggregate(&claimed, &swapped),
            Err(Error::AggregateMismatch { .. })
        ));

        let truncated = vec![seg(9, 8)];
        assert!(matches!(
            verify_aggregate(&claimed, &truncated),
            Err(Error::AggregateMismatch { .. })
        ));
    }

    #[test]
    fn non_power_of_two_segment_is_rejected() {
        let mut bad = seg(1, 8);
        bad.size = 300;
        assert!(Aggregate::new(1 << 12, &[bad]).is_err());
    }
}
