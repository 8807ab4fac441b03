//! Storage Pool: a fixed-size collection of chunks backed by one or more
//! files (or raw block devices), with a dual-mirrored metadata header that
//! survives a torn write across process crashes.
//!
//! The pool carves its backing storage into two conventional (randomly
//! writable) chunks right at the front — used only to hold the two
//! metadata mirrors — followed by the remaining conventional chunks (free
//! for the caller's own random-access needs, though this crate does not
//! use them) and then the sequential (append-only) chunks that back trie
//! node data.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read as _, Write as _};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::chunk::{Chunk, ChunkKind, ChunkList, ChunkListEntry, ChunkLists};
use crate::error::PoolError;

const METADATA_MAGIC: [u8; 4] = *b"MND0";
const METADATA_MIRROR_BYTES: u64 = 4096;
const METADATA_MIRROR_COUNT: u64 = 2;
/// The two metadata mirrors occupy the first two conventional chunk slots.
const RESERVED_CONVENTIONAL_CHUNKS: u32 = 2;

/// How `StoragePool::open` should treat an existing backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum OpenMode {
    /// Fail unless the backing file already holds a valid pool.
    OpenExisting,
    /// Open a valid existing pool, or format a fresh one if the file is
    /// empty or absent.
    CreateIfNeeded,
    /// Always format a fresh pool, discarding any prior contents.
    Truncate,
}

/// Configuration for [`StoragePool::open`].
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PoolConfig {
    /// Path to the backing file (a regular file or a raw block device).
    pub path: std::path::PathBuf,
    /// Byte capacity of each chunk. Tests use small values; production
    /// deployments use [`crate::chunk::DEFAULT_CHUNK_CAPACITY`].
    pub chunk_capacity: u64,
    /// Number of sequential (append-only) chunks to provision for node
    /// data, in addition to the reserved metadata chunks.
    pub sequential_chunk_count: u32,
    /// How to treat an existing file at `path`.
    pub mode: OpenMode,
}

impl PoolConfig {
    fn validate(&self) -> Result<(), PoolError> {
        if self.chunk_capacity < METADATA_MIRROR_BYTES * METADATA_MIRROR_COUNT {
            return Err(PoolError::CapacityTooSmall(self.chunk_capacity));
        }
        if self.sequential_chunk_count == 0 {
            return Err(PoolError::InvalidConfig("sequential_chunk_count must be > 0"));
        }
        Ok(())
    }
}

/// The persisted, fixed-size portion of the metadata header. Everything
/// variable-length (the per-chunk list-membership table) follows
/// immediately after in the same mirror.
#[derive(Debug, Clone, Copy)]
struct MetadataFixed {
    chunk_capacity: u64,
    sequential_chunk_count: u32,
    next_insertion_count: u64,
}

/// A chunk's persisted list membership, as recorded in a metadata mirror.
#[derive(Debug, Clone, Copy)]
struct PersistedChunkState {
    list: ChunkList,
    insertion_count: u64,
    write_offset: u32,
}

fn list_tag(list: ChunkList) -> u8 {
    match list {
        ChunkList::Free => 0,
        ChunkList::Fast => 1,
        ChunkList::Slow => 2,
    }
}

fn list_from_tag(tag: u8) -> Result<ChunkList, PoolError> {
    match tag {
        0 => Ok(ChunkList::Free),
        1 => Ok(ChunkList::Fast),
        2 => Ok(ChunkList::Slow),
        _ => Err(PoolError::InvalidConfig("corrupt list tag in metadata mirror")),
    }
}

fn encode_metadata(
    fixed: &MetadataFixed,
    chunks: &[PersistedChunkState],
) -> Result<Vec<u8>, PoolError> {
    let mut buf = Cursor::new(Vec::with_capacity(METADATA_MIRROR_BYTES as usize));
    buf.write_all(&METADATA_MAGIC)?;
    buf.write_u64::<LittleEndian>(fixed.chunk_capacity)?;
    buf.write_u32::<LittleEndian>(fixed.sequential_chunk_count)?;
    buf.write_u64::<LittleEndian>(fixed.next_insertion_count)?;
    buf.write_u32::<LittleEndian>(chunks.len() as u32)?;
    for c in chunks {
        buf.write_u8(list_tag(c.list))?;
        buf.write_u64::<LittleEndian>(c.insertion_count)?;
        buf.write_u32::<LittleEndian>(c.write_offset)?;
    }
    let bytes = buf.into_inner();
    if bytes.len() as u64 > METADATA_MIRROR_BYTES {
        return Err(PoolError::InvalidConfig("metadata does not fit in one mirror"));
    }
    Ok(bytes)
}

fn decode_metadata(bytes: &[u8]) -> Result<(MetadataFixed, Vec<PersistedChunkState>), PoolError> {
    let mut cur = Cursor::new(bytes);
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic)?;
    if magic != METADATA_MAGIC {
        return Err(PoolError::BadMagic);
    }
    let chunk_capacity = cur.read_u64::<LittleEndian>()?;
    let sequential_chunk_count = cur.read_u32::<LittleEndian>()?;
    let next_insertion_count = cur.read_u64::<LittleEndian>()?;
    let count = cur.read_u32::<LittleEndian>()?;
    let mut chunks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let list = list_from_tag(cur.read_u8()?)?;
        let insertion_count = cur.read_u64::<LittleEndian>()?;
        let write_offset = cur.read_u32::<LittleEndian>()?;
        chunks.push(PersistedChunkState { list, insertion_count, write_offset });
    }
    Ok((MetadataFixed { chunk_capacity, sequential_chunk_count, next_insertion_count }, chunks))
}

/// A fixed-size collection of chunks with crash-safe metadata. Chunks
/// beyond the two reserved metadata slots are lazily activated on first
/// use and cached for the pool's lifetime.
pub struct StoragePool {
    file: File,
    chunk_capacity: u64,
    sequential_chunk_count: u32,
    /// Which of the two mirrors (0 or 1) was most recently written; the
    /// next flush targets the other one, so a crash mid-write leaves the
    /// previous mirror intact.
    active_mirror: AtomicU32,
    chunks: Mutex<Vec<Option<Arc<Chunk>>>>,
    lists: ChunkLists,
}

impl StoragePool {
    /// Open or create a pool according to `config`.
    pub fn open(config: &PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let exists = config.path.exists();
        let format_fresh = match config.mode {
            OpenMode::OpenExisting => {
                if !exists {
                    return Err(PoolError::InvalidConfig("pool file does not exist"));
                }
                false
            }
            OpenMode::CreateIfNeeded => !exists || std::fs::metadata(&config.path)?.len() == 0,
            OpenMode::Truncate => true,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(format_fresh)
            .open(&config.path)?;

        let total_chunks = RESERVED_CONVENTIONAL_CHUNKS + config.sequential_chunk_count;
        let total_len = config.chunk_capacity * total_chunks as u64;
        file.set_len(total_len)?;

        let pool = if format_fresh {
            Self::format(file, config)?
        } else {
            Self::recover(file, config)?
        };
        Ok(pool)
    }

    fn format(file: File, config: &PoolConfig) -> Result<Self, PoolError> {
        let fixed = MetadataFixed {
            chunk_capacity: config.chunk_capacity,
            sequential_chunk_count: config.sequential_chunk_count,
            next_insertion_count: 0,
        };
        let chunk_states: Vec<PersistedChunkState> = (0..config.sequential_chunk_count)
            .map(|_| PersistedChunkState { list: ChunkList::Free, insertion_count: 0, write_offset: 0 })
            .collect();
        let bytes = encode_metadata(&fixed, &chunk_states)?;
        write_mirror(&file, 0, &bytes)?;
        write_mirror(&file, 1, &bytes)?;

        let lists = ChunkLists::default();
        {
            let mut free = lists.free.lock();
            for id in 0..config.sequential_chunk_count {
                free.push(ChunkListEntry { id, insertion_count: 0 });
            }
        }

        let mut chunks = Vec::with_capacity(config.sequential_chunk_count as usize);
        chunks.resize_with(config.sequential_chunk_count as usize, || None);

        Ok(Self {
            file,
            chunk_capacity: config.chunk_capacity,
            sequential_chunk_count: config.sequential_chunk_count,
            active_mirror: AtomicU32::new(1),
            chunks: Mutex::new(chunks),
            lists,
        })
    }

    fn recover(file: File, config: &PoolConfig) -> Result<Self, PoolError> {
        let mirror0 = read_mirror(&file)?;
        let mirror1 = read_mirror_at(&file, 1)?;
        let (fixed, chunk_states, active_mirror) =
            match (decode_metadata(&mirror0), decode_metadata(&mirror1)) {
                (Ok(a), Ok(b)) => {
                    // Both mirrors parse; prefer the one with the higher
                    // insertion counter, since a crash always leaves the
                    // *other* mirror holding the most recent write.
                    if a.0.next_insertion_count >= b.0.next_insertion_count {
                        (a.0, a.1, 0u32)
                    } else {
                        (b.0, b.1, 1u32)
                    }
                }
                (Ok(a), Err(_)) => (a.0, a.1, 0),
                (Err(_), Ok(b)) => (b.0, b.1, 1),
                (Err(_), Err(_)) => return Err(PoolError::BothMirrorsDirty),
            };

        if fixed.chunk_capacity != config.chunk_capacity {
            return Err(PoolError::InvalidConfig("chunk_capacity does not match recovered pool"));
        }

        let lists = ChunkLists::default();
        {
            let mut free = lists.free.lock();
            let mut fast = lists.fast.lock();
            let mut slow = lists.slow.lock();
            for (id, state) in chunk_states.iter().enumerate() {
                let entry = ChunkListEntry { id: id as u32, insertion_count: state.insertion_count };
                match state.list {
                    ChunkList::Free => free.push(entry),
                    ChunkList::Fast => fast.push(entry),
                    ChunkList::Slow => slow.push(entry),
                }
            }
            for list in [&mut *free, &mut *fast, &mut *slow] {
                list.sort_by_key(|e| e.insertion_count);
            }
        }
        lists.next_insertion_count.store(fixed.next_insertion_count, Ordering::Release);

        let mut chunks = Vec::with_capacity(chunk_states.len());
        chunks.resize_with(chunk_states.len(), || None);

        let pool = Self {
            file,
            chunk_capacity: fixed.chunk_capacity,
            sequential_chunk_count: fixed.sequential_chunk_count,
            active_mirror: AtomicU32::new(active_mirror),
            chunks: Mutex::new(chunks),
            lists,
        };

        for (id, state) in chunk_states.iter().enumerate() {
            let chunk = pool.activate_sequential(id as u32)?;
            chunk.truncate_write_offset(state.write_offset);
        }
        Ok(pool)
    }

    /// Byte capacity of each chunk in this pool.
    pub fn chunk_capacity(&self) -> u64 {
        self.chunk_capacity
    }

    /// Number of sequential chunks provisioned.
    pub fn sequential_chunk_count(&self) -> u32 {
        self.sequential_chunk_count
    }

    fn sequential_offset(&self, id: u32) -> Result<u64, PoolError> {
        if id >= self.sequential_chunk_count {
            return Err(PoolError::ChunkOutOfRange(id));
        }
        Ok(self.chunk_capacity * (RESERVED_CONVENTIONAL_CHUNKS as u64 + id as u64))
    }

    fn activate_sequential(&self, id: u32) -> Result<Arc<Chunk>, PoolError> {
        let mut slots = self.chunks.lock();
        if let Some(existing) = slots.get(id as usize).and_then(Clone::clone) {
            return Ok(existing);
        }
        let offset = self.sequential_offset(id)?;
        let read_file = self.file.try_clone()?;
        let write_file = self.file.try_clone()?;
        let chunk = Arc::new(Chunk::with_base_offset(
            ChunkKind::Sequential,
            id,
            self.chunk_capacity,
            read_file,
            write_file,
            offset,
        ));
        slots[id as usize] = Some(chunk.clone());
        Ok(chunk)
    }

    /// Activate (or fetch the already-activated handle for) a sequential
    /// chunk by id.
    pub fn chunk(&self, id: u32) -> Result<Arc<Chunk>, PoolError> {
        self.activate_sequential(id)
    }

    /// Pop a chunk off the free list and push it onto `list`, returning
    /// its activated handle. Errors if the free list is empty.
    pub fn allocate(&self, list: ChunkList) -> Result<Arc<Chunk>, PoolError> {
        assert_ne!(list, ChunkList::Free, "allocate() targets fast or slow, not free");
        let id = {
            let mut free = self.lists.free.lock();
            free.pop().ok_or(PoolError::InvalidConfig("free list exhausted"))?.id
        };
        let insertion_count = self.lists.next_insertion_count();
        {
            let target = match list {
                ChunkList::Fast => &self.lists.fast,
                ChunkList::Slow => &self.lists.slow,
                ChunkList::Free => unreachable!(),
            };
            target.lock().push(ChunkListEntry { id, insertion_count });
        }
        let chunk = self.activate_sequential(id)?;
        chunk.set_insertion_count(insertion_count);
        Ok(chunk)
    }

    /// Return a chunk to the free list, resetting (TRIM-ing) its contents.
    /// Errors if the chunk is already free.
    pub fn free(&self, chunk: &Chunk) -> Result<(), PoolError> {
        let id = chunk.id();
        let removed = {
            let mut fast = self.lists.fast.lock();
            let mut slow = self.lists.slow.lock();
            let from_fast = remove_entry(&mut fast, id);
            let from_slow = remove_entry(&mut slow, id);
            from_fast || from_slow
        };
        if !removed {
            return Err(PoolError::DoubleFree(id));
        }
        chunk.reset()?;
        let insertion_count = self.lists.next_insertion_count();
        self.lists.free.lock().push(ChunkListEntry { id, insertion_count });
        Ok(())
    }

    /// Persist the current list membership to the inactive mirror, then
    /// flip `active_mirror` to point at it. A crash between the two steps
    /// leaves the previous mirror, which still parses, as the recovered
    /// state (§4.1 torn-write recovery).
    pub fn flush_metadata(&self) -> Result<(), PoolError> {
        let slots = self.chunks.lock();
        let mut chunk_states = Vec::with_capacity(slots.len());
        let list_of = |id: u32| -> ChunkList {
            if contains(&self.lists.free.lock(), id) {
                ChunkList::Free
            } else if contains(&self.lists.fast.lock(), id) {
                ChunkList::Fast
            } else {
                ChunkList::Slow
            }
        };
        for (id, slot) in slots.iter().enumerate() {
            let write_offset = slot.as_ref().map(|c| c.size() as u32).unwrap_or(0);
            let insertion_count = slot.as_ref().map(|c| c.insertion_count()).unwrap_or(0);
            chunk_states.push(PersistedChunkState { list: list_of(id as u32), insertion_count, write_offset });
        }
        drop(slots);

        let fixed = MetadataFixed {
            chunk_capacity: self.chunk_capacity,
            sequential_chunk_count: self.sequential_chunk_count,
            next_insertion_count: self.lists.next_insertion_count.load(Ordering::Acquire),
        };
        let bytes = encode_metadata(&fixed, &chunk_states)?;

        let target = 1 - self.active_mirror.load(Ordering::Acquire);
        write_mirror(&self.file, target, &bytes)?;
        self.active_mirror.store(target, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for StoragePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePool")
            .field("chunk_capacity", &self.chunk_capacity)
            .field("sequential_chunk_count", &self.sequential_chunk_count)
            .finish()
    }
}

fn contains(list: &[ChunkListEntry], id: u32) -> bool {
    list.iter().any(|e| e.id == id)
}

fn remove_entry(list: &mut Vec<ChunkListEntry>, id: u32) -> bool {
    if let Some(pos) = list.iter().position(|e| e.id == id) {
        list.remove(pos);
        true
    } else {
        false
    }
}

fn mirror_offset(mirror: u32) -> u64 {
    mirror as u64 * METADATA_MIRROR_BYTES
}

fn write_mirror(file: &File, mirror: u32, bytes: &[u8]) -> Result<(), PoolError> {
    use std::os::unix::fs::FileExt;
    let mut padded = vec![0u8; METADATA_MIRROR_BYTES as usize];
    padded[..bytes.len()].copy_from_slice(bytes);
    file.write_all_at(&padded, mirror_offset(mirror))?;
    file.sync_data()?;
    Ok(())
}

fn read_mirror(file: &File) -> Result<Vec<u8>, PoolError> {
    read_mirror_at(file, 0)
}

fn read_mirror_at(file: &File, mirror: u32) -> Result<Vec<u8>, PoolError> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; METADATA_MIRROR_BYTES as usize];
    file.read_exact_at(&mut buf, mirror_offset(mirror))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkList;

    fn config(dir: &tempfile::TempDir, mode: OpenMode) -> PoolConfig {
        PoolConfig {
            path: dir.path().join("pool.dat"),
            chunk_capacity: METADATA_MIRROR_BYTES * 2,
            sequential_chunk_count: 4,
            mode,
        }
    }

    #[test]
    fn fresh_pool_all_chunks_free() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StoragePool::open(&config(&dir, OpenMode::CreateIfNeeded)).unwrap();
        assert_eq!(pool.lists.free.lock().len(), 4);
        assert_eq!(pool.lists.fast.lock().len(), 0);
    }

    #[test]
    fn allocate_moves_between_lists_and_free_recycles() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StoragePool::open(&config(&dir, OpenMode::CreateIfNeeded)).unwrap();
        let chunk = pool.allocate(ChunkList::Fast).unwrap();
        assert_eq!(pool.lists.free.lock().len(), 3);
        assert_eq!(pool.lists.fast.lock().len(), 1);
        pool.free(&chunk).unwrap();
        assert_eq!(pool.lists.free.lock().len(), 4);
        assert_eq!(pool.lists.fast.lock().len(), 0);
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StoragePool::open(&config(&dir, OpenMode::CreateIfNeeded)).unwrap();
        let chunk = pool.allocate(ChunkList::Fast).unwrap();
        let offset = chunk.append(b"hello").unwrap();
        let mut buf = [0u8; 5];
        chunk.read_at(&mut buf, offset).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = config(&dir, OpenMode::CreateIfNeeded).path;
        {
            let pool = StoragePool::open(&config(&dir, OpenMode::CreateIfNeeded)).unwrap();
            let chunk = pool.allocate(ChunkList::Fast).unwrap();
            chunk.append(b"hello").unwrap();
            pool.flush_metadata().unwrap();
        }
        let pool = StoragePool::open(&config(&dir, OpenMode::OpenExisting)).unwrap();
        assert_eq!(pool.lists.free.lock().len(), 3);
        assert_eq!(pool.lists.fast.lock().len(), 1);
        let _ = path;
    }
}
