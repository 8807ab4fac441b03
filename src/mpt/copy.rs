//! Copy Trie: splice the subtree found under a source prefix into a
//! (possibly different) destination trie at a destination prefix,
//! rewriting every visited source node through the slow writer. Used to
//! compact a trie's live nodes into a contiguous region (leaving stale
//! nodes behind to be reclaimed) and to fork part of a trie into another
//! version or another table without aliasing its storage.

use alloy_primitives::B256;

use crate::chunk::{ChunkOffset, INVALID_OFFSET};
use crate::error::MptError;
use crate::mpt::node::Node;
use crate::nibbles::{Nibbles, NibblesView};
use crate::node_cache::NodeCache;
use crate::node_writer::NodeWriter;

use super::upsert::write_node;

/// Locate the subtree of the trie rooted at `src_root` that contains
/// every key sharing `prefix`. Returns `None` if no key in the trie has
/// that prefix.
fn locate_subtree(
    cache: &NodeCache,
    root: ChunkOffset,
    prefix: NibblesView<'_>,
) -> Result<Option<ChunkOffset>, MptError> {
    if root.is_invalid() {
        return Ok(None);
    }
    if prefix.is_empty() {
        return Ok(Some(root));
    }
    let node = cache.get(root)?;
    let path = node.path.view();
    let common = path.common_prefix_len(prefix);
    if common == prefix.nibble_size() {
        // The whole prefix is consumed within (or exactly at the end of)
        // this node's own compressed path: this node is the subtree.
        return Ok(Some(root));
    }
    if common < path.nibble_size() {
        // Diverges before the node's own path ends: nothing under `prefix`.
        return Ok(None);
    }
    let nibble = prefix.get(common);
    let child = node.children[nibble as usize];
    locate_subtree(cache, child, prefix.substr(common + 1, None).view())
}

/// Recursively copy the subtree rooted at `offset` into `writer`,
/// returning the new root offset. Every node is re-encoded and hashed
/// identically to the source (the Merkle commitment is unchanged by a
/// copy), but lands at new storage addresses.
fn copy_subtree(cache: &NodeCache, writer: &NodeWriter, offset: ChunkOffset) -> Result<ChunkOffset, MptError> {
    let node = cache.get(offset)?;
    let mut new_children = node.children;
    for child in new_children.iter_mut() {
        if !child.is_invalid() {
            *child = copy_subtree(cache, writer, *child)?;
        }
    }
    let copied = Node {
        version: node.version,
        path: node.path.clone(),
        children: new_children,
        value: node.value.clone(),
        hash: node.hash,
    };
    write_node(writer, cache, copied)
}

/// Splice `target` (an already-written node, re-hashed as needed) into
/// the trie at `node_offset` so that every key reachable via `remaining`
/// from here ends up pointing at `target`'s subtree. `node_offset` may be
/// `INVALID_OFFSET` (nothing here yet).
fn splice(
    cache: &NodeCache,
    writer: &NodeWriter,
    version: u64,
    node_offset: ChunkOffset,
    remaining: NibblesView<'_>,
    target: ChunkOffset,
) -> Result<ChunkOffset, MptError> {
    if remaining.is_empty() {
        return Ok(target);
    }

    if node_offset.is_invalid() {
        // Nothing here: build an extension that carries `remaining` down
        // onto `target`'s own path.
        let target_node = cache.get(target)?;
        let combined_path = Nibbles::from_view(remaining).concat(target_node.path.view());
        let extended = Node {
            version,
            path: combined_path,
            children: target_node.children,
            value: target_node.value.clone(),
            hash: B256::ZERO,
        };
        return write_node(writer, cache, extended);
    }

    let existing = cache.get(node_offset)?;
    let existing_path = existing.path.view();
    let common = existing_path.common_prefix_len(remaining);

    if common == remaining.nibble_size() {
        // `remaining` is fully consumed here: this whole node (and
        // whatever it used to hold) is replaced by `target`.
        return Ok(target);
    }

    if common == existing_path.nibble_size() {
        // Existing path fully matches the start of `remaining`: descend
        // into the child selected by the next nibble.
        let next_nibble = remaining.get(common);
        let rest = remaining.substr(common + 1, None);
        let child = existing.children[next_nibble as usize];
        let new_child = splice(cache, writer, version, child, rest.view(), target)?;
        let mut children = existing.children;
        children[next_nibble as usize] = new_child;
        let node =
            Node { version, path: existing.path.clone(), children, value: existing.value.clone(), hash: B256::ZERO };
        return write_node(writer, cache, node);
    }

    // Diverge mid-path: split the existing node into a branch with its
    // own remainder as one child and the new target as another.
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

    let target_remainder_nibble = remaining.get(common) as usize;
    let target_remainder = remaining.substr(common + 1, None);
    let target_offset = splice(cache, writer, version, INVALID_OFFSET, target_remainder.view(), target)?;

    let mut children = [INVALID_OFFSET; 16];
    children[existing_remainder_nibble] = existing_offset;
    children[target_remainder_nibble] = target_offset;
    let branch = Node { version, path: existing_path.substr(0, Some(common)), children, value: None, hash: B256::ZERO };
    write_node(writer, cache, branch)
}

/// Copy the subtree found under `src_prefix` at `src_root` into `writer`,
/// splicing it into the trie rooted at `dest_root` at `dest_prefix` and
/// returning the new root. An empty `dest_prefix` replaces `dest_root`
/// wholesale; a non-empty one walks the destination trie and installs
/// the copy at the point of divergence from whatever was there before. If
/// no key under `src_root` has `src_prefix`, `dest_root` is returned
/// unchanged.
pub fn copy_trie(
    cache: &NodeCache,
    writer: &NodeWriter,
    src_root: ChunkOffset,
    src_prefix: NibblesView<'_>,
    new_version: u64,
    dest_root: ChunkOffset,
    dest_prefix: NibblesView<'_>,
) -> Result<ChunkOffset, MptError> {
    let Some(subtree_offset) = locate_subtree(cache, src_root, src_prefix)? else {
        return Ok(dest_root);
    };
    let copied_root = copy_subtree(cache, writer, subtree_offset)?;
    if dest_prefix.is_empty() {
        return Ok(copied_root);
    }
    splice(cache, writer, new_version, dest_root, dest_prefix, copied_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkList;
    use crate::mpt::traverse::get;
    use crate::mpt::upsert::{upsert, Update};
    use crate::storage_pool::{OpenMode, PoolConfig};
    use std::sync::Arc;

    fn open_pool(dir: &tempfile::TempDir) -> crate::storage_pool::StoragePool {
        crate::storage_pool::StoragePool::open(&PoolConfig {
            path: dir.path().join("pool.dat"),
            chunk_capacity: 1 << 20,
            sequential_chunk_count: 8,
            mode: OpenMode::CreateIfNeeded,
        })
        .unwrap()
    }

    #[test]
    fn whole_root_copy_preserves_root_hash_but_not_offset() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(open_pool(&dir));
        let cache = Arc::new(NodeCache::new(pool.clone()));
        let fast = NodeWriter::new(ChunkList::Fast, pool.clone());
        let slow = NodeWriter::new(ChunkList::Slow, pool);

        let updates = vec![
            Update { key: Nibbles::from_bytes(&[0x11]).unwrap(), value: Some(b"a".to_vec()) },
            Update { key: Nibbles::from_bytes(&[0x22]).unwrap(), value: Some(b"b".to_vec()) },
        ];
        let root = upsert(&cache, &fast, 1, INVALID_OFFSET, &updates).unwrap();
        fast.flush().unwrap();

        let empty = Nibbles::empty();
        let new_root =
            copy_trie(&cache, &slow, root, empty.view(), 2, INVALID_OFFSET, empty.view()).unwrap();
        slow.flush().unwrap();

        assert_ne!(root, new_root);
        let original = cache.get(root).unwrap();
        let copied = cache.get(new_root).unwrap();
        assert_eq!(original.hash, copied.hash);
    }

    #[test]
    fn copy_with_prefix_splices_into_destination() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(open_pool(&dir));
        let cache = Arc::new(NodeCache::new(pool.clone()));
        let fast = NodeWriter::new(ChunkList::Fast, pool.clone());
        let slow = NodeWriter::new(ChunkList::Slow, pool);

        // Source trie at version 10, root over keys 0x01.. (a single key).
        let src_updates = vec![Update { key: Nibbles::from_bytes(&[0x01]).unwrap(), value: Some(b"src".to_vec()) }];
        let src_root = upsert(&cache, &fast, 10, INVALID_OFFSET, &src_updates).unwrap();
        fast.flush().unwrap();

        // Destination trie at version 11, already holding one unrelated key.
        let dest_updates = vec![Update { key: Nibbles::from_bytes(&[0xFF]).unwrap(), value: Some(b"dest".to_vec()) }];
        let dest_root = upsert(&cache, &fast, 11, INVALID_OFFSET, &dest_updates).unwrap();
        fast.flush().unwrap();

        // Copy the whole source trie (empty src_prefix) under dest_prefix
        // 0x01 of the destination trie.
        let dest_prefix = Nibbles::from_bytes(&[0x01]).unwrap();
        let empty = Nibbles::empty();
        let new_dest_root =
            copy_trie(&cache, &slow, src_root, empty.view(), 11, dest_root, dest_prefix.view()).unwrap();
        slow.flush().unwrap();

        // The unrelated key is still reachable...
        assert_eq!(get(&cache, new_dest_root, Nibbles::from_bytes(&[0xFF]).unwrap().view()).unwrap(), Some(b"dest".to_vec()));
        // ...and the copied subtree is reachable at dest_prefix + its own key.
        let mut full_key = Vec::new();
        full_key.extend_from_slice(&[0x01]);
        full_key.extend_from_slice(&[0x01]);
        assert_eq!(get(&cache, new_dest_root, Nibbles::from_bytes(&full_key).unwrap().view()).unwrap(), Some(b"src".to_vec()));
    }

    #[test]
    fn copy_of_missing_prefix_leaves_destination_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(open_pool(&dir));
        let cache = Arc::new(NodeCache::new(pool.clone()));
        let fast = NodeWriter::new(ChunkList::Fast, pool.clone());
        let slow = NodeWriter::new(ChunkList::Slow, pool);

        let updates = vec![Update { key: Nibbles::from_bytes(&[0x01]).unwrap(), value: Some(b"a".to_vec()) }];
        let dest_root = upsert(&cache, &fast, 1, INVALID_OFFSET, &updates).unwrap();
        fast.flush().unwrap();

        let missing_prefix = Nibbles::from_bytes(&[0xEE]).unwrap();
        let dest_prefix = Nibbles::from_bytes(&[0x02]).unwrap();
        let result =
            copy_trie(&cache, &slow, dest_root, missing_prefix.view(), 2, dest_root, dest_prefix.view()).unwrap();
        assert_eq!(result, dest_root);
    }
}
