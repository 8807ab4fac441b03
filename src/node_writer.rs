//! Node Writer: a per-list (fast/slow) streaming writer over the Storage
//! Pool's sequential chunks.
//!
//! Every upsert writes new node records through the fast writer; copy_trie
//! splices into background-compacted destinations through the slow
//! writer. Both track a virtual offset that only becomes a durable
//! [`ChunkOffset`] once the record is actually flushed — callers may build
//! up several records referencing each other's *virtual* offsets before a
//! single flush lands them all at once, provided children are always
//! flushed before the parents that reference them (§8 structural
//! invariant, enforced by [`crate::error::MptError::ChildNotWrittenBeforeParent`]
//! at the MPT layer).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::{Chunk, ChunkList, ChunkOffset};
use crate::error::PoolError;
use crate::storage_pool::StoragePool;

/// A single buffered record awaiting flush.
struct PendingRecord {
    bytes: Vec<u8>,
}

/// Streaming writer over one chunk list. Buffers records in memory,
/// assigning each a virtual offset immediately, and only calls into the
/// pool to activate a fresh chunk when the current one would overflow.
pub struct NodeWriter {
    list: ChunkList,
    pool: Arc<StoragePool>,
    state: Mutex<WriterState>,
}

struct WriterState {
    current_chunk: Option<Arc<Chunk>>,
    /// Sum of the sizes of all buffered-but-unflushed records plus
    /// whatever is already durably appended to `current_chunk`. This is
    /// the virtual offset new records are assigned against.
    virtual_size: u64,
    pending: Vec<PendingRecord>,
}

impl NodeWriter {
    /// Create a writer over `list`, lazily activating its first chunk on
    /// the first `write_record`.
    pub fn new(list: ChunkList, pool: Arc<StoragePool>) -> Self {
        assert_ne!(list, ChunkList::Free, "NodeWriter targets fast or slow");
        Self {
            list,
            pool,
            state: Mutex::new(WriterState { current_chunk: None, virtual_size: 0, pending: Vec::new() }),
        }
    }

    /// Buffer `bytes` as the next record and return the offset it will
    /// occupy once flushed. The offset is stable: it will not change
    /// between this call and the eventual flush.
    pub fn write_record(&self, bytes: Vec<u8>) -> Result<ChunkOffset, PoolError> {
        let mut state = self.state.lock();
        if state.current_chunk.is_none() {
            state.current_chunk = Some(self.pool.allocate(self.list)?);
        }
        let chunk = state.current_chunk.as_ref().unwrap();
        let needed = state.virtual_size + bytes.len() as u64;
        if needed > chunk.capacity() {
            self.rotate_locked(&mut state)?;
        }
        let chunk = state.current_chunk.as_ref().unwrap();
        let offset = ChunkOffset::new(chunk.id(), state.virtual_size as u32);
        state.virtual_size += bytes.len() as u64;
        state.pending.push(PendingRecord { bytes });
        Ok(offset)
    }

    fn rotate_locked(&self, state: &mut WriterState) -> Result<(), PoolError> {
        self.flush_locked(state)?;
        state.current_chunk = Some(self.pool.allocate(self.list)?);
        state.virtual_size = 0;
        tracing::trace!(list = ?self.list, "node writer rotated onto a fresh chunk");
        Ok(())
    }

    /// Durably append every buffered record to the current chunk, in
    /// order, via blocking positioned writes. Children must be written
    /// (i.e. have had `write_record` called) strictly before the parent
    /// record that references their offset — this writer does not
    /// reorder records, so callers are responsible for that ordering.
    pub fn flush(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut WriterState) -> Result<(), PoolError> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let chunk = match &state.current_chunk {
            Some(c) => c.clone(),
            None => return Ok(()),
        };
        for record in state.pending.drain(..) {
            chunk.append(&record.bytes)?;
        }
        Ok(())
    }

    /// Which list this writer targets.
    pub fn list(&self) -> ChunkList {
        self.list
    }
}

impl std::fmt::Debug for NodeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NodeWriter")
            .field("list", &self.list)
            .field("virtual_size", &state.virtual_size)
            .field("pending_records", &state.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_pool::{OpenMode, PoolConfig};

    fn pool(dir: &tempfile::TempDir) -> Arc<StoragePool> {
        Arc::new(
            StoragePool::open(&PoolConfig {
                path: dir.path().join("pool.dat"),
                chunk_capacity: 8192,
                sequential_chunk_count: 4,
                mode: OpenMode::CreateIfNeeded,
            })
            .unwrap(),
        )
    }

    #[test]
    fn offsets_are_assigned_before_flush_and_stable_after() {
        let dir = tempfile::tempdir().unwrap();
        let writer = NodeWriter::new(ChunkList::Fast, pool(&dir));
        let off_a = writer.write_record(vec![1, 2, 3]).unwrap();
        let off_b = writer.write_record(vec![4, 5]).unwrap();
        assert_eq!(off_a.chunk_id(), off_b.chunk_id());
        assert_eq!(off_b.byte_offset() - off_a.byte_offset(), 3);
        writer.flush().unwrap();

        let chunk = writer.state.lock().current_chunk.clone().unwrap();
        let mut buf = [0u8; 3];
        chunk.read_at(&mut buf, off_a.byte_offset() as u64).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn rotates_chunk_on_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let writer = NodeWriter::new(ChunkList::Fast, pool(&dir));
        let off_a = writer.write_record(vec![0u8; 6000]).unwrap();
        let off_b = writer.write_record(vec![0u8; 6000]).unwrap();
        assert_ne!(off_a.chunk_id(), off_b.chunk_id());
        assert_eq!(off_b.byte_offset(), 0);
    }
}
