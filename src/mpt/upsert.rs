//! Upsert: apply a sorted batch of key/value updates to a trie rooted at
//! `base_root`, producing a new root via structural sharing — every node
//! off the path of an updated key is reused unchanged, only the nodes on
//! the path from the root to each changed key are rewritten.

use alloy_primitives::B256;

use crate::chunk::{ChunkOffset, INVALID_OFFSET};
use crate::error::MptError;
use crate::mpt::node::{encode_node, Node, StoredValue, INLINE_VALUE_THRESHOLD};
use crate::nibbles::Nibbles;
use crate::node_cache::NodeCache;
use crate::node_writer::NodeWriter;

/// One key's update: `Some(value)` to upsert, `None` to delete.
pub struct Update {
    /// Full key, as nibbles.
    pub key: Nibbles,
    /// New value, or `None` to delete the key.
    pub value: Option<Vec<u8>>,
}

/// Apply `updates` (sorted by key, no duplicates, checked here) atop
/// `base_root`, writing new nodes through `writer` and returning the new
/// root offset. `base_root` of `INVALID_OFFSET` means an empty trie.
pub fn upsert(
    cache: &NodeCache,
    writer: &NodeWriter,
    version: u64,
    base_root: ChunkOffset,
    updates: &[Update],
) -> Result<ChunkOffset, MptError> {
    if updates.is_empty() {
        return Err(MptError::EmptyUpdateSet);
    }
    check_sorted_no_duplicates(updates)?;
    let result = upsert_at(cache, writer, version, base_root, updates)?;
    Ok(result.unwrap_or(INVALID_OFFSET))
}

fn check_sorted_no_duplicates(updates: &[Update]) -> Result<(), MptError> {
    for pair in updates.windows(2) {
        if pair[0].key.view().cmp(&pair[1].key.view()) != std::cmp::Ordering::Less {
            return Err(MptError::UnsortedOrDuplicateUpdates);
        }
    }
    Ok(())
}

/// Split `updates` (all sharing the nibble prefix already consumed by the
/// caller) into the value terminating exactly at this depth (if any) and
/// sixteen per-nibble child groups, each with that nibble stripped off.
fn partition_by_next_nibble(updates: &[Update], depth: usize) -> (Option<Vec<u8>>, [Vec<Update>; 16]) {
    let mut value = None;
    let mut groups: [Vec<Update>; 16] = Default::default();
    for update in updates {
        if update.key.nibble_size() == depth {
            value = update.value.clone();
        } else {
            let nibble = update.key.get(depth) as usize;
            let rest = update.key.substr(depth + 1, None);
            groups[nibble].push(Update { key: rest, value: update.value.clone() });
        }
    }
    (value, groups)
}

/// Recursively apply `updates` to the subtree at `node_offset`, returning
/// the new subtree's offset, or `None` if the subtree became empty.
fn upsert_at(
    cache: &NodeCache,
    writer: &NodeWriter,
    version: u64,
    node_offset: ChunkOffset,
    updates: &[Update],
) -> Result<Option<ChunkOffset>, MptError> {
    if node_offset.is_invalid() {
        return build_fresh_subtree(cache, writer, version, updates);
    }
    let existing = cache.get(node_offset)?;
    let existing_path = existing.path.view();
    let common = updates
        .iter()
        .map(|u| existing_path.common_prefix_len(u.key.view()))
        .min()
        .unwrap_or(0);

    if common < existing_path.nibble_size() {
        return split_and_insert(cache, writer, version, &existing, common, updates);
    }

    let (value_update, groups) = partition_by_next_nibble(updates, common);
    let value = match value_update {
        Some(v) => Some(to_stored(writer, v)?),
        None if updates.iter().any(|u| u.key.nibble_size() == common) => None, // explicit delete
        None => existing.value.clone(),
    };

    let mut children = existing.children;
    for (nibble, group) in groups.into_iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        let new_child = upsert_at(cache, writer, version, children[nibble], &group)?;
        children[nibble] = new_child.unwrap_or(INVALID_OFFSET);
    }

    finalize_node(cache, writer, version, existing_path.substr(0, None), children, value)
}

/// Build a fresh subtree (no existing node along this path) for
/// `updates`, whose keys have already had the consumed prefix stripped.
fn build_fresh_subtree(
    cache: &NodeCache,
    writer: &NodeWriter,
    version: u64,
    updates: &[Update],
) -> Result<Option<ChunkOffset>, MptError> {
    let live: Vec<&Update> = updates.iter().filter(|u| u.value.is_some()).collect();
    if live.is_empty() {
        return Ok(None);
    }

    if live.len() == 1 && updates.len() == 1 {
        let update = live[0];
        let leaf = Node {
            version,
            path: update.key.clone(),
            children: [INVALID_OFFSET; 16],
            value: Some(to_stored(writer, update.value.clone().unwrap())?),
            hash: B256::ZERO,
        };
        return Ok(Some(write_node(writer, cache, leaf)?));
    }

    let common = live
        .iter()
        .skip(1)
        .fold(live[0].key.nibble_size(), |acc, u| acc.min(live[0].key.view().common_prefix_len(u.key.view())));

    let (value, groups) = partition_by_next_nibble(updates, common);
    let mut children = [INVALID_OFFSET; 16];
    for (nibble, group) in groups.into_iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        children[nibble] = build_fresh_subtree(cache, writer, version, &group)?.unwrap_or(INVALID_OFFSET);
    }

    let value = match value {
        Some(v) => Some(to_stored(writer, v)?),
        None => None,
    };
    finalize_node(cache, writer, version, updates[0].key.substr(0, Some(common)), children, value)
}

fn split_and_insert(
    cache: &NodeCache,
    writer: &NodeWriter,
    version: u64,
    existing: &Node,
    common: usize,
    updates: &[Update],
) -> Result<Option<ChunkOffset>, MptError> {
    let existing_path = existing.path.view();
    let existing_remainder_nibble = existing_path.get(common) as usize;
    let existing_remainder_path = existing_path.substr(common + 1, None);

    let rebuilt_existing = Node {
        version: existing.version,
        path: existing_remainder_path,
        children: existing.children,
        value: existing.value.clone(),
        hash: existing.hash,
    };
    let existing_offset = write_node(writer, cache, rebuilt_existing)?;

    let mut children = [INVALID_OFFSET; 16];
    children[existing_remainder_nibble] = existing_offset;

    let (value_at_split, groups) = partition_by_next_nibble(updates, common);
    for (nibble, group) in groups.into_iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        if nibble == existing_remainder_nibble {
            let new_child = upsert_at(cache, writer, version, children[nibble], &group)?;
            children[nibble] = new_child.unwrap_or(INVALID_OFFSET);
        } else {
            children[nibble] = build_fresh_subtree(cache, writer, version, &group)?.unwrap_or(INVALID_OFFSET);
        }
    }

    let value = match value_at_split {
        Some(v) => Some(to_stored(writer, v)?),
        None => None,
    };
    finalize_node(cache, writer, version, existing_path.substr(0, Some(common)), children, value)
}

fn finalize_node(
    cache: &NodeCache,
    writer: &NodeWriter,
    version: u64,
    path: Nibbles,
    children: [ChunkOffset; 16],
    value: Option<StoredValue>,
) -> Result<Option<ChunkOffset>, MptError> {
    let has_children = children.iter().any(|c| !c.is_invalid());
    if !has_children && value.is_none() {
        return Ok(None);
    }
    let node = Node { version, path, children, value, hash: B256::ZERO };
    Ok(Some(write_node(writer, cache, node)?))
}

/// Hash, encode, and durably queue `node`, inserting the decoded node into
/// `cache` under its freshly assigned offset. Shared with [`super::copy`],
/// which re-hashes an unchanged subtree at new storage addresses.
pub(crate) fn write_node(writer: &NodeWriter, cache: &NodeCache, mut node: Node) -> Result<ChunkOffset, MptError> {
    let mut child_hashes = [None; 16];
    for (i, child_offset) in node.children.iter().enumerate() {
        if !child_offset.is_invalid() {
            child_hashes[i] = Some(cache.get(*child_offset)?.hash);
        }
    }
    node.compute_hash(&child_hashes);
    let bytes = encode_node(&node);
    let offset = writer.write_record(bytes)?;
    cache.insert(offset, std::sync::Arc::new(node));
    Ok(offset)
}

/// Store `value`, inlining it into the node record when small enough or
/// else writing it as a standalone length-prefixed record referenced by
/// offset. The length prefix lets [`crate::node_cache::NodeCache::get_indirect`]
/// read the value back without first decoding a node.
fn to_stored(writer: &NodeWriter, value: Vec<u8>) -> Result<StoredValue, MptError> {
    if value.len() <= INLINE_VALUE_THRESHOLD {
        Ok(StoredValue::Inline(value))
    } else {
        let mut framed = Vec::with_capacity(4 + value.len());
        framed.extend_from_slice(&(value.len() as u32).to_le_bytes());
        framed.extend_from_slice(&value);
        let offset = writer.write_record(framed)?;
        Ok(StoredValue::Indirect(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkList;
    use crate::storage_pool::{OpenMode, PoolConfig};
    use std::sync::Arc;

    fn setup(dir: &tempfile::TempDir) -> (Arc<NodeCache>, NodeWriter) {
        let pool = Arc::new(
            StoragePool::open(&PoolConfig {
                path: dir.path().join("pool.dat"),
                chunk_capacity: 1 << 20,
                sequential_chunk_count: 8,
                mode: OpenMode::CreateIfNeeded,
            })
            .unwrap(),
        );
        let cache = Arc::new(NodeCache::new(pool.clone()));
        let writer = NodeWriter::new(ChunkList::Fast, pool);
        (cache, writer)
    }

    fn key(bytes: &[u8]) -> Nibbles {
        Nibbles::from_bytes(bytes).unwrap()
    }

    #[test]
    fn single_insert_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, writer) = setup(&dir);
        let updates = vec![Update { key: key(b"abc0"), value: Some(b"v1".to_vec()) }];
        let root = upsert(&cache, &writer, 1, INVALID_OFFSET, &updates).unwrap();
        writer.flush().unwrap();
        let node = cache.get(root).unwrap();
        assert_eq!(node.value, Some(StoredValue::Inline(b"v1".to_vec())));
    }

    #[test]
    fn two_keys_share_a_branch() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, writer) = setup(&dir);
        let updates = vec![
            Update { key: key(&[0x12, 0x30]), value: Some(b"a".to_vec()) },
            Update { key: key(&[0x12, 0x31]), value: Some(b"b".to_vec()) },
        ];
        let root = upsert(&cache, &writer, 1, INVALID_OFFSET, &updates).unwrap();
        writer.flush().unwrap();
        let branch = cache.get(root).unwrap();
        assert_eq!(branch.child_count(), 2);
    }

    #[test]
    fn unsorted_updates_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, writer) = setup(&dir);
        let updates = vec![
            Update { key: key(&[0x02]), value: Some(b"b".to_vec()) },
            Update { key: key(&[0x01]), value: Some(b"a".to_vec()) },
        ];
        assert!(matches!(
            upsert(&cache, &writer, 1, INVALID_OFFSET, &updates),
            Err(MptError::UnsortedOrDuplicateUpdates)
        ));
    }

    #[test]
    fn empty_update_set_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, writer) = setup(&dir);
        assert!(matches!(upsert(&cache, &writer, 1, INVALID_OFFSET, &[]), Err(MptError::EmptyUpdateSet)));
    }

    #[test]
    fn update_then_overwrite_structural_sharing() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, writer) = setup(&dir);
        let first = vec![
            Update { key: key(&[0x10]), value: Some(b"a".to_vec()) },
            Update { key: key(&[0x20]), value: Some(b"b".to_vec()) },
        ];
        let root1 = upsert(&cache, &writer, 1, INVALID_OFFSET, &first).unwrap();
        writer.flush().unwrap();

        let second = vec![Update { key: key(&[0x10]), value: Some(b"a2".to_vec()) }];
        let root2 = upsert(&cache, &writer, 2, root1, &second).unwrap();
        writer.flush().unwrap();

        // The 0x20 child is untouched, so its offset is reused verbatim.
        let node1 = cache.get(root1).unwrap();
        let node2 = cache.get(root2).unwrap();
        assert_eq!(node1.children[0x2], node2.children[0x2]);
        assert_ne!(node1.children[0x1], node2.children[0x1]);
    }
}
