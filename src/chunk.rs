//! Chunk and Chunk Offset: the unit of allocation on the Storage Pool.
//!
//! A chunk is a fixed-capacity contiguous byte region backed by a file
//! descriptor pair. Conventional chunks are randomly writable and hold
//! pool metadata; sequential chunks are append-only and hold trie node
//! records. A [`ChunkOffset`] names a location as `(chunk id, byte
//! offset)` packed into 8 bytes, matching the on-disk representation
//! described by the persistent file format.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::PoolError;

/// Default chunk capacity: 256 MiB. Tests use smaller values to exercise
/// chunk rotation without allocating huge files.
pub const DEFAULT_CHUNK_CAPACITY: u64 = 256 * 1024 * 1024;

/// Sentinel chunk offset meaning "no offset", used for absent child
/// references and uninitialized root pointers.
pub const INVALID_OFFSET: ChunkOffset = ChunkOffset(u64::MAX);

/// A chunk id plus a byte offset within that chunk, packed into a single
/// `u64`: high 32 bits are the chunk id, low 32 bits are the byte offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkOffset(u64);

impl ChunkOffset {
    /// Construct an offset from a chunk id and a byte offset within it.
    pub fn new(chunk_id: u32, byte_offset: u32) -> Self {
        Self(((chunk_id as u64) << 32) | byte_offset as u64)
    }

    /// The chunk id component.
    pub fn chunk_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The byte offset component within the chunk.
    pub fn byte_offset(&self) -> u32 {
        self.0 as u32
    }

    /// Whether this is the `INVALID_OFFSET` sentinel.
    pub fn is_invalid(&self) -> bool {
        *self == INVALID_OFFSET
    }

    /// Pack into the canonical 8-byte on-disk representation (little-endian).
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Unpack from the canonical 8-byte on-disk representation.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl std::fmt::Debug for ChunkOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_invalid() {
            write!(f, "INVALID_OFFSET")
        } else {
            write!(f, "{}:{}", self.chunk_id(), self.byte_offset())
        }
    }
}

/// Which physical kind of chunk this is. Conventional chunks permit random
/// writes and back pool metadata; sequential chunks are append-only and
/// back trie node data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Random-access chunk, used for the mirrored metadata header.
    Conventional,
    /// Append-only chunk, used for node records.
    Sequential,
}

/// Which list a chunk currently belongs to. A chunk is in exactly one list
/// at a time (§3 invariant); `reset` transitions a chunk back to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkList {
    /// Not currently in use by any live version; available for activation.
    Free,
    /// Holds recently-written, "hot" node data.
    Fast,
    /// Holds compacted or cold node data.
    Slow,
}

/// A single chunk's on-disk descriptor, as stored in the pool metadata's
/// per-chunk array. Kept separate from the runtime [`Chunk`] handle so the
/// whole descriptor table round-trips through the mmap'd mirrors as plain
/// old data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Device-local chunk id.
    pub id: u32,
    /// Which list the chunk currently belongs to.
    pub list: ChunkList,
    /// Monotonic insertion counter within its list, used to order chunks
    /// for `rewind_to_match` and reclamation sweeps.
    pub insertion_count: u64,
    /// Current write offset (sequential chunks only; conventional chunks
    /// are written at caller-specified offsets).
    pub write_offset: u32,
}

/// A runtime handle to an activated chunk: open file descriptors and a
/// live write-offset counter. Reference-counted by the pool; dropping the
/// last handle closes the underlying file descriptors.
pub struct Chunk {
    kind: ChunkKind,
    id: u32,
    capacity: u64,
    read_file: File,
    write_file: File,
    /// Byte offset of this chunk's start within the shared backing file.
    /// Zero when the pool gives each chunk its own file.
    base_offset: u64,
    /// Append point for sequential chunks. Conventional chunks ignore this
    /// and take an explicit offset on every write.
    write_offset: AtomicU64,
    insertion_count: AtomicU64,
}

impl Chunk {
    pub(crate) fn new(kind: ChunkKind, id: u32, capacity: u64, read_file: File, write_file: File) -> Self {
        Self::with_base_offset(kind, id, capacity, read_file, write_file, 0)
    }

    /// Construct a chunk whose I/O is translated by `base_offset` into a
    /// shared backing file, as used by [`crate::storage_pool::StoragePool`]
    /// when all chunks live in one file.
    pub(crate) fn with_base_offset(
        kind: ChunkKind,
        id: u32,
        capacity: u64,
        read_file: File,
        write_file: File,
        base_offset: u64,
    ) -> Self {
        Self {
            kind,
            id,
            capacity,
            read_file,
            write_file,
            base_offset,
            write_offset: AtomicU64::new(0),
            insertion_count: AtomicU64::new(0),
        }
    }

    /// Device-local chunk id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this is a conventional (randomly writable) chunk.
    pub fn is_conventional(&self) -> bool {
        self.kind == ChunkKind::Conventional
    }

    /// Whether this is a sequential (append-only) chunk.
    pub fn is_sequential(&self) -> bool {
        self.kind == ChunkKind::Sequential
    }

    /// Fixed capacity of this chunk in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current amount of the chunk filled with data.
    pub fn size(&self) -> u64 {
        self.write_offset.load(Ordering::Acquire)
    }

    /// A descriptor suitable for blocking reads at an arbitrary offset.
    pub fn read_fd(&self) -> &File {
        &self.read_file
    }

    /// Reserve room for `bytes_to_be_written` more bytes at the current
    /// append point of a sequential chunk, returning the chunk-relative
    /// offset the bytes will land at. Panics if called on a conventional
    /// chunk — callers write those at explicit offsets via
    /// [`Chunk::write_at`]. Reserving before the caller's blocking
    /// [`Chunk::write_at`] keeps concurrent writers from racing for the
    /// same bytes.
    pub fn reserve_append(&self, bytes_to_be_written: u32) -> u64 {
        assert!(self.is_sequential(), "reserve_append() is only for sequential chunks");
        self.write_offset.fetch_add(bytes_to_be_written as u64, Ordering::AcqRel)
    }

    /// Reserve space and perform a blocking write in one step, returning
    /// the chunk-relative offset the bytes landed at.
    pub fn append(&self, buf: &[u8]) -> std::io::Result<u64> {
        let offset = self.reserve_append(buf.len() as u32);
        self.write_at(buf, offset)?;
        Ok(offset)
    }

    /// Byte offset of this chunk's start within its shared backing file.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Blocking positioned read at a chunk-relative offset, used by the
    /// Node Cache on a cache miss outside of the async path (and by
    /// tests).
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        self.read_file.read_exact_at(buf, self.base_offset + offset)
    }

    /// Blocking positioned write at a chunk-relative offset, used by
    /// conventional chunks (metadata mirrors) which are not append-only.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        self.write_file.write_all_at(buf, self.base_offset + offset)
    }

    /// Reset this chunk's contents, transitioning it back to the free
    /// list. Issues TRIM on the backing storage so filesystems/raw
    /// partitions can reclaim the space (§4.1).
    pub fn reset(&self) -> Result<(), PoolError> {
        self.write_offset.store(0, Ordering::Release);
        self.destroy_contents()
    }

    /// Punch a hole over the whole chunk extent via `fallocate`
    /// `FALLOC_FL_PUNCH_HOLE`, the Linux TRIM-equivalent for files.
    pub fn destroy_contents(&self) -> Result<(), PoolError> {
        use std::os::unix::io::AsRawFd;
        let fd = self.write_file.as_raw_fd();
        // SAFETY: fd is a valid, open file descriptor owned by `self` for
        // the lifetime of this call.
        let rc = unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                0,
                self.capacity as libc::off_t,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Plain files on filesystems without hole-punching support
            // (e.g. tmpfs in some configurations) return EOPNOTSUPP; that
            // is not fatal, just means TRIM had no effect.
            if err.raw_os_error() != Some(libc::EOPNOTSUPP) {
                return Err(PoolError::Io(err));
            }
        }
        Ok(())
    }

    pub(crate) fn insertion_count(&self) -> u64 {
        self.insertion_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_insertion_count(&self, count: u64) {
        self.insertion_count.store(count, Ordering::Release);
    }

    pub(crate) fn truncate_write_offset(&self, offset: u32) {
        self.write_offset.store(offset as u64, Ordering::Release);
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Internal registry entry tracking a chunk's list membership, guarded by
/// the pool's single mutex (§5: "the Storage Pool's mutable list and
/// chunk-info tables are protected by one internal mutex").
#[derive(Debug)]
pub(crate) struct ChunkListEntry {
    pub id: u32,
    pub insertion_count: u64,
}

/// Mutex-protected free/fast/slow chunk-id lists, mirroring the layout of
/// the pool metadata's three list headers (begin/end/count each).
#[derive(Debug, Default)]
pub(crate) struct ChunkLists {
    pub free: Mutex<Vec<ChunkListEntry>>,
    pub fast: Mutex<Vec<ChunkListEntry>>,
    pub slow: Mutex<Vec<ChunkListEntry>>,
    pub next_insertion_count: AtomicU64,
}

impl ChunkLists {
    pub(crate) fn next_insertion_count(&self) -> u64 {
        self.next_insertion_count.fetch_add(1, Ordering::Relaxed)
    }
}
