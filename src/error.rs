//! Error Model: tagged status codes with optional typed payloads, propagated
//! through the `Result` types exposed at every component boundary.
//!
//! Each component gets its own `thiserror` enum rather than one flat error
//! type — `PevmError` composes `MptError`/`IoError` the same way the
//! upstream executor composed `revm::primitives::EVMError<ReadError>`.

use std::fmt;

use crate::chunk::ChunkOffset;

/// Errors surfaced by the [`crate::storage_pool::StoragePool`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The metadata header's magic bytes did not match `b"MND0"`.
    #[error("bad pool magic bytes")]
    BadMagic,
    /// Both metadata mirrors were marked dirty; the pool cannot be trusted.
    #[error("both metadata mirrors are dirty, pool is corrupt")]
    BothMirrorsDirty,
    /// `chunk_capacity` was smaller than the minimum usable size.
    #[error("chunk capacity {0} is too small")]
    CapacityTooSmall(u64),
    /// A config value failed validation at `open()`.
    #[error("invalid pool config: {0}")]
    InvalidConfig(&'static str),
    /// Attempted to activate a chunk id beyond the device's chunk count.
    #[error("chunk id {0} out of range")]
    ChunkOutOfRange(u32),
    /// Attempted to free a chunk that is already on the free list.
    #[error("double free of chunk {0}")]
    DoubleFree(u32),
    /// The requested chunk has not been activated on this pool.
    #[error("chunk {0} not activated")]
    NotActivated(u32),
    /// Underlying I/O failure; fatal to the pool.
    #[error("pool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced reading or writing chunk-backed records (node records,
/// indirect values) outside the Storage Pool's own open/activate path.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Wrapped OS-level I/O error from a positioned read or write.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the MPT engine.
#[derive(Debug, thiserror::Error)]
pub enum MptError {
    /// `find`/`get`/`traverse` referenced a version outside
    /// `[earliest_version, latest_version]`.
    #[error("version {requested} out of range [{earliest}, {latest}]")]
    VersionOutOfRange {
        /// Version that was requested.
        requested: u64,
        /// Oldest version still retained.
        earliest: u64,
        /// Newest version retained.
        latest: u64,
    },
    /// The key was not present in the trie at the requested version.
    #[error("key not found")]
    NotFound,
    /// `upsert` was called with an unsorted or duplicate-keyed update list.
    #[error("upsert updates must be sorted by key with no duplicates")]
    UnsortedOrDuplicateUpdates,
    /// `upsert` was called with an update list that targets a version that
    /// does not strictly increase from the base version.
    #[error("version regression: new version {new} <= base version {base}")]
    VersionRegression {
        /// Version the caller asked to write.
        new: u64,
        /// Version the caller claimed as the base.
        base: u64,
    },
    /// `upsert` was called with an empty update list (§9 open question,
    /// resolved as a rejection rather than a silent no-op advance).
    #[error("upsert called with an empty update list")]
    EmptyUpdateSet,
    /// A [`crate::nibbles::Nibbles`] path exceeded 255 nibbles.
    #[error("nibble path exceeds 255 nibbles")]
    PathTooLong,
    /// A stored value record's tag byte was not one of the known
    /// discriminants (0 = absent, 1 = inline, 2 = indirect).
    #[error("corrupt node record: unknown value tag {0}")]
    CorruptRecord(u8),
    /// A child reference pointed at a chunk offset that does not precede
    /// the offset of the node it belongs to; this is a structural
    /// invariant violation (§8), not a user-facing condition.
    #[error("structural invariant violated: child offset {child:?} >= parent offset {parent:?}")]
    ChildNotWrittenBeforeParent {
        /// The violating child reference.
        child: ChunkOffset,
        /// The node that referenced it.
        parent: ChunkOffset,
    },
    /// Propagated from the storage pool or async I/O layer.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Propagated from the storage pool or async I/O layer.
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Errors surfaced by the State DB layer.
#[derive(Debug, thiserror::Error)]
pub enum StateDbError {
    /// Propagated from the underlying MPT engine.
    #[error(transparent)]
    Mpt(#[from] MptError),
    /// RLP decoding of a stored value failed.
    #[error("failed to decode stored value: {0}")]
    Decode(String),
}

impl fmt::Display for ChunkOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "ChunkOffset(invalid)")
        } else {
            write!(f, "ChunkOffset(chunk={}, offset={})", self.chunk_id(), self.byte_offset())
        }
    }
}
