//! Traversal: point lookups against a trie root, and a visitor-driven walk
//! of a whole subtree with optional concurrent read-ahead.

use std::sync::Arc;

use rayon::prelude::*;

use crate::chunk::ChunkOffset;
use crate::error::MptError;
use crate::mpt::node::{Node, StoredValue};
use crate::nibbles::NibblesView;
use crate::node_cache::NodeCache;

/// Look up `key` in the trie rooted at `root`. Returns `Ok(None)` if the
/// key is absent (distinct from [`MptError::NotFound`], which this
/// function never returns — callers that want "missing key is an error"
/// semantics map the `None` case themselves).
pub fn get(cache: &NodeCache, root: ChunkOffset, key: NibblesView<'_>) -> Result<Option<Vec<u8>>, MptError> {
    if root.is_invalid() {
        return Ok(None);
    }
    let mut current = root;
    let mut depth = 0usize;
    loop {
        let node = cache.get(current)?;
        let path = node.path.view();
        let path_len = path.nibble_size();
        if depth + path_len > key.nibble_size() {
            return Ok(None);
        }
        for i in 0..path_len {
            if key.get(depth + i) != path.get(i) {
                return Ok(None);
            }
        }
        depth += path_len;
        if depth == key.nibble_size() {
            return Ok(match &node.value {
                Some(StoredValue::Inline(bytes)) => Some(bytes.clone()),
                Some(StoredValue::Indirect(offset)) => Some(read_indirect(cache, *offset)?),
                None => None,
            });
        }
        let nibble = key.get(depth);
        let child = node.children[nibble as usize];
        if child.is_invalid() {
            return Ok(None);
        }
        depth += 1;
        current = child;
    }
}

fn read_indirect(cache: &NodeCache, offset: ChunkOffset) -> Result<Vec<u8>, MptError> {
    cache.get_indirect(offset)
}

/// Callbacks driving a trie walk. `down` fires on entry to a node and may
/// return `false` to prune the whole subtree (its children are skipped and
/// `up` is not called for it); `up` fires on exit from every node whose
/// `down` returned `true`, after all of its children have been visited.
pub trait Visitor {
    /// Called when the walk enters `node`. Returning `false` prunes the
    /// subtree rooted here.
    fn down(&mut self, node: &Node) -> bool;
    /// Called when the walk leaves `node`, after its children.
    fn up(&mut self, node: &Node);
}

/// Walk the subtree rooted at `root` against `visitor`, purely
/// sequentially. Equivalent to calling [`traverse`] with a
/// `concurrency_limit` of 1.
pub fn traverse_blocking(cache: &NodeCache, root: ChunkOffset, visitor: &mut dyn Visitor) -> Result<(), MptError> {
    traverse(cache, root, visitor, 1)
}

/// Walk the subtree rooted at `root` against `visitor`. Up to
/// `concurrency_limit` of a node's children have their records prefetched
/// into the [`NodeCache`] concurrently via `rayon` before `down`/`up` are
/// invoked on any of them — the callbacks themselves always fire in
/// strict depth-first order, matching what a purely sequential walk would
/// observe, only the storage reads behind a cache miss are overlapped.
pub fn traverse(
    cache: &NodeCache,
    root: ChunkOffset,
    visitor: &mut dyn Visitor,
    concurrency_limit: usize,
) -> Result<(), MptError> {
    if root.is_invalid() {
        return Ok(());
    }
    let node = cache.get(root)?;
    if !visitor.down(&node) {
        return Ok(());
    }
    let children: Vec<ChunkOffset> = node.children.iter().copied().filter(|c| !c.is_invalid()).collect();
    let batch_size = concurrency_limit.max(1);
    for batch in children.chunks(batch_size) {
        let warmed: Vec<Result<Arc<Node>, MptError>> = if batch.len() > 1 {
            batch.par_iter().map(|&off| cache.get(off)).collect()
        } else {
            batch.iter().map(|&off| cache.get(off)).collect()
        };
        for (&offset, warm) in batch.iter().zip(warmed) {
            warm?;
            traverse(cache, offset, visitor, concurrency_limit)?;
        }
    }
    visitor.up(&node);
    Ok(())
}
