//! Walker for the chain's adt array encoding (indexed merkle array).
//!
//! The market actor keeps DealProposals and DealStates in these arrays. We
//! only ever read them: root = `[bit_width, height, count, node]`, node =
//! `[bitmap, [link...], [value...]]`, with occupied slots compacted into the
//! link/value lists in bitmap order.

use crate::blockstore::Blockstore;
use crate::error::{ChainError, ChainResult};
use cid::Cid;
use ipld_core::ipld::Ipld;

/// Iterate all (index, value) pairs in ascending index order.
pub async fn for_each<F>(bs: &dyn Blockstore, root: &Cid, mut f: F) -> ChainResult<()>
where
    F: FnMut(u64, &Ipld) -> ChainResult<()>,
{
    let root_ipld = decode_block(bs, root).await?;
    let fields = as_list(&root_ipld, "amt root")?;
    if fields.len() != 4 {
        return Err(ChainError::Decode(format!(
            "amt root has {} fields, expected 4",
            fields.len()
        )));
    }
    let bit_width = as_u64(&fields[0], "amt bit width")? as u32;
    let height = as_u64(&fields[1], "amt height")?;
    if bit_width == 0 || bit_width > 8 {
        return Err(ChainError::Decode(format!(
            "implausible amt bit width {bit_width}"
        )));
    }

    // Depth-first with children pushed in reverse keeps index order ascending.
    let mut stack: Vec<(Ipld, u64, u64)> = vec![(fields[3].clone(), height, 0)];
    while let Some((node, height, base)) = stack.pop() {
        let parts = as_list(&node, "amt node")?;
        if parts.len() != 3 {
            return Err(ChainError::Decode(format!(
                "amt node has {} fields, expected 3",
                parts.len()
            )));
        }
        let bitmap = match &parts[0] {
            Ipld::Bytes(b) => b.as_slice(),
            other => {
                return Err(ChainError::Decode(format!(
                    "amt bitmap is {other:?}, expected bytes"
                )))
            }
        };
        let links = as_list(&parts[1], "amt links")?;
        let values = as_list(&parts[2], "amt values")?;

        let slots = 1u64 << bit_width;
        let span = slots.pow(height as u32);

        let mut occupied = 0usize;
        let mut children: Vec<(Ipld, u64, u64)> = Vec::new();
        for slot in 0..slots {
            let byte = (slot / 8) as usize;
            let bit = slot % 8;
            if byte >= bitmap.len() || bitmap[byte] & (1 << bit) == 0 {
                continue;
            }
            if height == 0 {
                let value = values.get(occupied).ok_or_else(|| {
                    ChainError::Decode("amt bitmap and value list disagree".into())
                })?;
                f(base + slot, value)?;
            } else {
                let link = links.get(occupied).ok_or_else(|| {
                    ChainError::Decode("amt bitmap and link list disagree".into())
                })?;
                let child_cid = match link {
                    Ipld::Link(c) => *c,
                    other => {
                        return Err(ChainError::Decode(format!(
                            "amt link is {other:?}, expected a cid"
                        )))
                    }
                };
                let child = decode_block(bs, &child_cid).await?;
                children.push((child, height - 1, base + slot * span));
            }
            occupied += 1;
        }
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }
    Ok(())
}

async fn decode_block(bs: &dyn Blockstore, cid: &Cid) -> ChainResult<Ipld> {
    let bytes = bs.get(cid).await?;
    serde_ipld_dagcbor::from_slice(&bytes)
        .map_err(|e| ChainError::Decode(format!("block {cid}: {e}")))
}

fn as_list<'a>(ipld: &'a Ipld, what: &str) -> ChainResult<&'a Vec<Ipld>> {
    match ipld {
        Ipld::List(l) => Ok(l),
        other => Err(ChainError::Decode(format!(
            "{what} is {other:?}, expected a list"
        ))),
    }
}

fn as_u64(ipld: &Ipld, what: &str) -> ChainResult<u64> {
    match ipld {
        Ipld::Integer(i) if *i >= 0 => Ok(*i as u64),
        other => Err(ChainError::Decode(format!(
            "{what} is {other:?}, expected an unsigned integer"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Encode-side helpers so tests can lay out arrays for the walker.

    use super::*;
    use crate::blockstore::MemoryBlockstore;
    use multihash::Multihash;
    use sha2::{Digest, Sha256};

    const DAG_CBOR: u64 = 0x71;
    const SHA2_256: u64 = 0x12;

    pub fn put_block(bs: &MemoryBlockstore, ipld: &Ipld) -> Cid {
        let bytes = serde_ipld_dagcbor::to_vec(ipld).unwrap();
        let mh = Multihash::wrap(SHA2_256, &Sha256::digest(&bytes)).unwrap();
        let cid = Cid::new_v1(DAG_CBOR, mh);
        bs.put(cid, bytes);
        cid
    }

    fn leaf_node(bit_width: u32, entries: &[(u64, Ipld)], base: u64) -> Ipld {
        let slots = 1u64 << bit_width;
        let mut bitmap = vec![0u8; ((slots + 7) / 8) as usize];
        let mut values = Vec::new();
        for (index, value) in entries {
            let slot = index - base;
            bitmap[(slot / 8) as usize] |= 1 << (slot % 8);
            values.push(value.clone());
        }
        Ipld::List(vec![
            Ipld::Bytes(bitmap),
            Ipld::List(vec![]),
            Ipld::List(values),
        ])
    }

    /// Build a one- or two-level array holding `entries` (ascending indexes).
    pub fn build_amt(bs: &MemoryBlockstore, bit_width: u32, entries: &[(u64, Ipld)]) -> Cid {
        let slots = 1u64 << bit_width;
        let max_index = entries.iter().map(|(i, _)| *i).max().unwrap_or(0);

        let (height, node) = if max_index < slots {
            (0u64, leaf_node(bit_width, entries, 0))
        } else {
            assert!(max_index < slots * slots, "test builder supports 2 levels");
            let mut bitmap = vec![0u8; ((slots + 7) / 8) as usize];
            let mut links = Vec::new();
            for slot in 0..slots {
                let lo = slot * slots;
                let hi = lo + slots;
                let in_child: Vec<(u64, Ipld)> = entries
                    .iter()
                    .filter(|(i, _)| *i >= lo && *i < hi)
                    .cloned()
                    .collect();
                if in_child.is_empty() {
                    continue;
                }
                bitmap[(slot / 8) as usize] |= 1 << (slot % 8);
                let child = leaf_node(bit_width, &in_child, lo);
                links.push(Ipld::Link(put_block(bs, &child)));
            }
            (
                1u64,
                Ipld::List(vec![
                    Ipld::Bytes(bitmap),
                    Ipld::List(links),
                    Ipld::List(vec![]),
                ]),
            )
        };

        let root = Ipld::List(vec![
            Ipld::Integer(bit_width as i128),
            Ipld::Integer(height as i128),
            Ipld::Integer(entries.len() as i128),
            node,
        ]);
        put_block(bs, &root)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::build_amt;
    use super::*;
    use crate::blockstore::MemoryBlockstore;

    async fn collect(bs: &MemoryBlockstore, root: &Cid) -> Vec<(u64, i128)> {
        let mut out = Vec::new();
        for_each(bs, root, |i, v| {
            match v {
                Ipld::Integer(n) => out.push((i, *n)),
                other => panic!("unexpected value {other:?}"),
            }
            Ok(())
        })
        .await
        .unwrap();
        out
    }

    #[tokio::test]
    async fn single_level_walk() {
        let bs = MemoryBlockstore::new();
        let entries = vec![
            (0u64, Ipld::Integer(10)),
            (3, Ipld::Integer(13)),
            (7, Ipld::Integer(17)),
        ];
        let root = build_amt(&bs, 3, &entries);
        assert_eq!(collect(&bs, &root).await, vec![(0, 10), (3, 13), (7, 17)]);
    }

    #[tokio::test]
    async fn two_level_walk_is_index_ordered() {
        let bs = MemoryBlockstore::new();
        // bit_width 3 => 8 slots per node; indexes above 7 force height 1
        let entries = vec![
            (2u64, Ipld::Integer(2)),
            (9, Ipld::Integer(9)),
            (17, Ipld::Integer(17)),
            (63, Ipld::Integer(63)),
        ];
        let root = build_amt(&bs, 3, &entries);
        assert_eq!(
            collect(&bs, &root).await,
            vec![(2, 2), (9, 9), (17, 17), (63, 63)]
        );
    }

    #[tokio::test]
    async fn missing_child_block_is_an_error() {
        let bs = MemoryBlockstore::new();
        let entries = vec![(9u64, Ipld::Integer(9))];
        let root = build_amt(&bs, 3, &entries);

        // rebuild the store without the child blocks
        let empty = MemoryBlockstore::new();
        let root_bytes = bs.get(&root).await.unwrap();
        empty.put(root, root_bytes);

        let err = for_each(&empty, &root, |_, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, ChainError::MissingBlock(_)));
    }
}
