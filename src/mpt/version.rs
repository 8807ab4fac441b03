//! Version Map: a bounded ring of `block_number -> root chunk offset`,
//! plus the watermarks that track how far consensus has progressed.
//!
//! Entries older than `history_length` blocks behind `latest` are evicted;
//! eviction is the trigger for chunk reclamation (a node that no version
//! still in the ring can reach is eligible to be freed back to the pool).
//! The sweep itself is not implemented by this crate yet: structural
//! sharing means an evicted root's chunks can't be freed outright (a
//! newer, still-retained root may reference the same chunk), so
//! reclaiming requires pairing eviction with `Mpt::copy_trie` compaction
//! — copy the live subtree forward onto fresh chunks, then once every
//! version that could reach the old chunks has been evicted, free them
//! in bulk.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::chunk::ChunkOffset;
use crate::error::MptError;

/// Default number of versions retained before eviction.
pub const DEFAULT_HISTORY_LENGTH: u64 = 65536;

#[derive(Debug, Clone, Copy)]
struct VersionEntry {
    block_number: u64,
    root: ChunkOffset,
}

#[derive(Debug)]
struct Watermarks {
    /// Highest block number ever committed, whether or not it is still
    /// in the ring.
    latest: Option<u64>,
    /// Highest block number the fork-choice rule has finalized.
    finalized: Option<u64>,
    /// Highest block number whose state root has been externally
    /// verified (e.g. by a light client proof).
    verified: Option<u64>,
    /// Highest block number a quorum has voted for but not yet finalized.
    voted: Option<u64>,
}

/// The bounded version ring and its watermarks.
pub struct VersionMap {
    history_length: u64,
    ring: RwLock<VecDeque<VersionEntry>>,
    watermarks: RwLock<Watermarks>,
}

impl VersionMap {
    /// Create an empty version map retaining `history_length` versions.
    pub fn new(history_length: u64) -> Self {
        Self {
            history_length,
            ring: RwLock::new(VecDeque::new()),
            watermarks: RwLock::new(Watermarks { latest: None, finalized: None, verified: None, voted: None }),
        }
    }

    /// Record a newly committed version. `block_number` must strictly
    /// exceed the current latest version.
    pub fn commit(&self, block_number: u64, root: ChunkOffset) -> Result<Vec<ChunkOffset>, MptError> {
        let mut ring = self.ring.write();
        if let Some(last) = ring.back() {
            if block_number <= last.block_number {
                return Err(MptError::VersionRegression { new: block_number, base: last.block_number });
            }
        }
        ring.push_back(VersionEntry { block_number, root });
        self.watermarks.write().latest = Some(block_number);

        let mut evicted = Vec::new();
        while ring.len() as u64 > self.history_length {
            if let Some(entry) = ring.pop_front() {
                evicted.push(entry.root);
            }
        }
        Ok(evicted)
    }

    /// Root offset committed at `block_number`, if it is still retained.
    pub fn root_at(&self, block_number: u64) -> Result<ChunkOffset, MptError> {
        let ring = self.ring.read();
        let earliest = ring.front().map(|e| e.block_number);
        let latest = ring.back().map(|e| e.block_number);
        match (earliest, latest) {
            (Some(earliest), Some(latest)) if block_number >= earliest && block_number <= latest => {
                ring.iter()
                    .find(|e| e.block_number == block_number)
                    .map(|e| e.root)
                    .ok_or(MptError::NotFound)
            }
            (Some(earliest), Some(latest)) => {
                Err(MptError::VersionOutOfRange { requested: block_number, earliest, latest })
            }
            _ => Err(MptError::NotFound),
        }
    }

    /// Highest block number still in the ring.
    pub fn latest_version(&self) -> Option<u64> {
        self.ring.read().back().map(|e| e.block_number)
    }

    /// Lowest block number still in the ring.
    pub fn earliest_version(&self) -> Option<u64> {
        self.ring.read().front().map(|e| e.block_number)
    }

    /// Advance the finalized watermark. No-op if `block_number` is behind
    /// the current watermark.
    pub fn update_finalized(&self, block_number: u64) {
        let mut w = self.watermarks.write();
        if w.finalized.map_or(true, |f| block_number > f) {
            w.finalized = Some(block_number);
        }
    }

    /// Advance the verified watermark.
    pub fn update_verified(&self, block_number: u64) {
        let mut w = self.watermarks.write();
        if w.verified.map_or(true, |f| block_number > f) {
            w.verified = Some(block_number);
        }
    }

    /// Advance the voted watermark.
    pub fn update_voted(&self, block_number: u64) {
        let mut w = self.watermarks.write();
        if w.voted.map_or(true, |f| block_number > f) {
            w.voted = Some(block_number);
        }
    }

    /// Current finalized watermark.
    pub fn finalized(&self) -> Option<u64> {
        self.watermarks.read().finalized
    }

    /// Current verified watermark.
    pub fn verified(&self) -> Option<u64> {
        self.watermarks.read().verified
    }

    /// Current voted watermark.
    pub fn voted(&self) -> Option<u64> {
        self.watermarks.read().voted
    }
}

impl std::fmt::Debug for VersionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring.read();
        f.debug_struct("VersionMap")
            .field("history_length", &self.history_length)
            .field("earliest", &ring.front().map(|e| e.block_number))
            .field("latest", &ring.back().map(|e| e.block_number))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkOffset;

    #[test]
    fn eviction_past_history_length_returns_evicted_roots() {
        let map = VersionMap::new(2);
        assert!(map.commit(1, ChunkOffset::new(0, 0)).unwrap().is_empty());
        assert!(map.commit(2, ChunkOffset::new(0, 1)).unwrap().is_empty());
        let evicted = map.commit(3, ChunkOffset::new(0, 2)).unwrap();
        assert_eq!(evicted, vec![ChunkOffset::new(0, 0)]);
        assert_eq!(map.earliest_version(), Some(2));
        assert_eq!(map.latest_version(), Some(3));
    }

    #[test]
    fn regression_is_rejected() {
        let map = VersionMap::new(10);
        map.commit(5, ChunkOffset::new(0, 0)).unwrap();
        assert!(matches!(
            map.commit(5, ChunkOffset::new(0, 1)),
            Err(MptError::VersionRegression { new: 5, base: 5 })
        ));
    }

    #[test]
    fn out_of_range_lookup() {
        let map = VersionMap::new(2);
        map.commit(10, ChunkOffset::new(0, 0)).unwrap();
        map.commit(11, ChunkOffset::new(0, 1)).unwrap();
        map.commit(12, ChunkOffset::new(0, 2)).unwrap();
        assert!(matches!(
            map.root_at(10),
            Err(MptError::VersionOutOfRange { requested: 10, earliest: 11, latest: 12 })
        ));
    }
}
