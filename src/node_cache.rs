//! Node Cache: a striped, sharded LRU over decoded trie nodes, keyed by
//! their storage [`ChunkOffset`], with inflight-read coalescing so a burst
//! of readers chasing the same cold node only issues one chunk read.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::chunk::ChunkOffset;
use crate::error::MptError;
use crate::mpt::node::{decode_node, Node};
use crate::storage_pool::StoragePool;

const DEFAULT_SHARD_COUNT: usize = 16;
const DEFAULT_CAPACITY_PER_SHARD: usize = 4096;

/// The result a leader publishes once its blocking read completes.
/// `MptError` is not `Clone`, so a follower that observes `Failed` retries
/// the read itself rather than trying to reproduce the leader's error.
enum InflightState {
    Pending,
    Ready(Arc<Node>),
    Failed,
}

struct InflightRead {
    state: Mutex<InflightState>,
    done: Condvar,
}

struct Shard {
    entries: DashMap<ChunkOffset, Arc<Node>, ahash::RandomState>,
    lru: Mutex<Vec<ChunkOffset>>,
    capacity: usize,
    inflight: Mutex<HashMap<ChunkOffset, Arc<InflightRead>>>,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            lru: Mutex::new(Vec::new()),
            capacity,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn touch(&self, offset: ChunkOffset) {
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|o| *o == offset) {
            lru.remove(pos);
        }
        lru.push(offset);
        if lru.len() > self.capacity {
            let evict = lru.remove(0);
            self.entries.remove(&evict);
        }
    }
}

/// Node record cache. Safe to share across threads and across concurrent
/// trie traversals.
pub struct NodeCache {
    shards: Vec<Shard>,
    pool: Arc<StoragePool>,
}

fn shard_index(offset: ChunkOffset, shard_count: usize) -> usize {
    (offset.chunk_id() as usize) % shard_count
}

impl NodeCache {
    /// Create a cache with the default shard count and per-shard capacity.
    pub fn new(pool: Arc<StoragePool>) -> Self {
        Self::with_capacity(pool, DEFAULT_SHARD_COUNT, DEFAULT_CAPACITY_PER_SHARD)
    }

    /// Create a cache with explicit sizing, mainly for tests that want to
    /// force evictions quickly.
    pub fn with_capacity(pool: Arc<StoragePool>, shard_count: usize, capacity_per_shard: usize) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| Shard::new(capacity_per_shard)).collect();
        Self { shards, pool }
    }

    /// Fetch the node at `offset`, reading through to storage on a miss.
    /// Concurrent callers racing on the same cold offset coalesce onto a
    /// single blocking read: the first caller to arrive becomes the
    /// leader and performs the read, every other caller registers itself
    /// as a follower and waits on a condvar for the leader to publish a
    /// result (or retries the read itself if the leader's attempt
    /// failed).
    pub fn get(&self, offset: ChunkOffset) -> Result<Arc<Node>, MptError> {
        debug_assert!(!offset.is_invalid());
        let shard = &self.shards[shard_index(offset, self.shards.len())];
        if let Some(node) = shard.entries.get(&offset) {
            let node = node.clone();
            shard.touch(offset);
            return Ok(node);
        }

        let (inflight, is_leader) = {
            let mut table = shard.inflight.lock();
            if let Some(existing) = table.get(&offset) {
                (existing.clone(), false)
            } else {
                let fresh = Arc::new(InflightRead { state: Mutex::new(InflightState::Pending), done: Condvar::new() });
                table.insert(offset, fresh.clone());
                (fresh, true)
            }
        };

        if is_leader {
            let result = self.read_through(offset);
            {
                let mut state = inflight.state.lock();
                *state = match &result {
                    Ok(node) => InflightState::Ready(node.clone()),
                    Err(_) => InflightState::Failed,
                };
                inflight.done.notify_all();
            }
            shard.inflight.lock().remove(&offset);
            if let Ok(node) = &result {
                shard.entries.insert(offset, node.clone());
                shard.touch(offset);
            }
            return result;
        }

        let mut state = inflight.state.lock();
        loop {
            match &*state {
                InflightState::Pending => inflight.done.wait(&mut state),
                InflightState::Ready(node) => {
                    let node = node.clone();
                    drop(state);
                    shard.touch(offset);
                    return Ok(node);
                }
                InflightState::Failed => {
                    drop(state);
                    return self.read_through(offset);
                }
            }
        }
    }

    /// Insert a freshly written node directly into the cache, skipping
    /// the storage round trip. Used by upsert, which already holds the
    /// decoded node it just wrote.
    pub fn insert(&self, offset: ChunkOffset, node: Arc<Node>) {
        let shard = &self.shards[shard_index(offset, self.shards.len())];
        shard.entries.insert(offset, node);
        shard.touch(offset);
    }

    /// Read a length-prefixed, indirected value record written by
    /// [`crate::mpt::upsert::to_stored`] — not a node record, so this
    /// bypasses the decode-and-cache path `get` uses.
    pub fn get_indirect(&self, offset: ChunkOffset) -> Result<Vec<u8>, MptError> {
        let chunk = self.pool.chunk(offset.chunk_id())?;
        let mut len_buf = [0u8; 4];
        chunk
            .read_at(&mut len_buf, offset.byte_offset() as u64)
            .map_err(|e| MptError::Io(crate::error::IoError::Io(e)))?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        chunk
            .read_at(&mut buf, offset.byte_offset() as u64 + 4)
            .map_err(|e| MptError::Io(crate::error::IoError::Io(e)))?;
        Ok(buf)
    }

    fn read_through(&self, offset: ChunkOffset) -> Result<Arc<Node>, MptError> {
        let chunk = self.pool.chunk(offset.chunk_id())?;
        // Node records are variable-length; read a generously sized
        // window and decode from the front. Production deployments size
        // this to the 99th-percentile record length to avoid a second
        // read for oversized branch nodes; here we just read to the end
        // of the chunk, which is always resident and cheap relative to
        // the syscall itself.
        let window = (chunk.capacity() - offset.byte_offset() as u64) as usize;
        let mut buf = vec![0u8; window];
        chunk.read_at(&mut buf, offset.byte_offset() as u64)
            .map_err(|e| MptError::Io(crate::error::IoError::Io(e)))?;
        let node = decode_node(&buf)?;
        Ok(Arc::new(node))
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache").field("shards", &self.shards.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkList;
    use crate::mpt::node::StoredValue;
    use crate::nibbles::Nibbles;
    use crate::storage_pool::{OpenMode, PoolConfig};
    use alloy_primitives::B256;

    fn pool(dir: &tempfile::TempDir) -> Arc<StoragePool> {
        Arc::new(
            StoragePool::open(&PoolConfig {
                path: dir.path().join("pool.dat"),
                chunk_capacity: 8192,
                sequential_chunk_count: 2,
                mode: OpenMode::CreateIfNeeded,
            })
            .unwrap(),
        )
    }

    #[test]
    fn read_through_then_cached() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let chunk = pool.allocate(ChunkList::Fast).unwrap();
        let mut node = Node {
            version: 1,
            path: Nibbles::from_bytes(&[0xAB]).unwrap(),
            children: [crate::chunk::INVALID_OFFSET; 16],
            value: Some(StoredValue::Inline(b"v".to_vec())),
            hash: B256::ZERO,
        };
        node.compute_hash(&[None; 16]);
        let bytes = crate::mpt::node::encode_node(&node);
        let byte_offset = chunk.append(&bytes).unwrap();
        let offset = ChunkOffset::new(chunk.id(), byte_offset as u32);

        let cache = NodeCache::new(pool.clone());
        let fetched = cache.get(offset).unwrap();
        assert_eq!(*fetched, node);
        let fetched_again = cache.get(offset).unwrap();
        assert!(Arc::ptr_eq(&fetched, &fetched_again));
    }

    #[test]
    fn concurrent_readers_of_a_cold_offset_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let chunk = pool.allocate(ChunkList::Fast).unwrap();
        let mut node = Node {
            version: 1,
            path: Nibbles::from_bytes(&[0xCD]).unwrap(),
            children: [crate::chunk::INVALID_OFFSET; 16],
            value: Some(StoredValue::Inline(b"w".to_vec())),
            hash: B256::ZERO,
        };
        node.compute_hash(&[None; 16]);
        let bytes = crate::mpt::node::encode_node(&node);
        let byte_offset = chunk.append(&bytes).unwrap();
        let offset = ChunkOffset::new(chunk.id(), byte_offset as u32);

        let cache = Arc::new(NodeCache::new(pool.clone()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get(offset).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Every reader observes the same decoded node, and whichever
        // result got cached is shared by every subsequent hit.
        for r in &results {
            assert_eq!(**r, node);
        }
        assert!(Arc::ptr_eq(&results[0], &cache.get(offset).unwrap()));
    }
}
