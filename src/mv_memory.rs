use std::collections::HashMap;

use dashmap::DashMap;
// NOTE: Easy x2 performance gain over a naive `RwLock<HashMap>`!
use parking_lot::Mutex;

use crate::{MemoryEntry, MemoryLocation, MemoryValue, ReadOrigin, ReadSet, TxIdx, TxVersion, WriteSet};

pub(crate) enum ReadMemoryResult {
    NotFound,
    ReadError {
        blocking_tx_idx: TxIdx,
    },
    Ok {
        version: TxVersion,
        value: MemoryValue,
    },
}

/// Shared memory in the form of a multi-version data structure for values
/// written and read by different transactions. It is called multi-version
/// because it stores multiple writes for each memory location, along with
/// a value and the associated version of the writing transaction. Built
/// directly against the `state_db` location/value shapes (account basic
/// info, storage slots, contract code) rather than a generic KV pair, so
/// the same structure backs the block-beneficiary's lazily-evaluated
/// balance as well as ordinary account and storage writes.
pub(crate) struct MvMemory {
    data: DashMap<MemoryLocation, DashMap<TxIdx, MemoryEntry, ahash::RandomState>, ahash::RandomState>,
    last_written_locations: Vec<Mutex<Vec<MemoryLocation>>>,
    last_read_set: Vec<Mutex<ReadSet>>,
}

impl MvMemory {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            data: DashMap::with_hasher(ahash::RandomState::new()),
            last_written_locations: (0..block_size).map(|_| Mutex::new(Vec::new())).collect(),
            last_read_set: (0..block_size).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// The value written by the highest transaction for every location
    /// written to by some transaction in the block. Used to build the
    /// `BlockState` write set once the whole block has committed.
    pub(crate) fn snapshot(&self) -> HashMap<MemoryLocation, MemoryValue> {
        let mut ret = HashMap::new();
        for entry in self.data.iter() {
            let location = entry.key();
            if let ReadMemoryResult::Ok { value, .. } = self.read(location, usize::MAX) {
                ret.insert(location.clone(), value);
            }
        }
        ret
    }

    /// Apply a new read & write set to the multi-version data structure.
    /// Returns whether a write occurred to a memory location not written
    /// to by the previous incarnation of the same transaction. This
    /// determines whether already-executed higher transactions require
    /// further validation.
    pub(crate) fn record(&self, tx_version: &TxVersion, read_set: ReadSet, write_set: WriteSet) -> bool {
        *self.last_read_set[tx_version.tx_idx].lock() = read_set;

        for (location, value) in write_set.iter() {
            let entry = MemoryEntry::Data(tx_version.tx_incarnation, value.clone());
            match self.data.get_mut(location) {
                Some(location_map) => {
                    location_map.insert(tx_version.tx_idx, entry);
                }
                None => {
                    let location_map = DashMap::with_hasher_and_shard_amount(ahash::RandomState::new(), 2);
                    location_map.insert(tx_version.tx_idx, entry);
                    self.data.insert(location.clone(), location_map);
                }
            }
        }

        let mut last_written_locations = self.last_written_locations[tx_version.tx_idx].lock();
        let prev_locations = std::mem::take(&mut *last_written_locations);

        let new_locations: Vec<MemoryLocation> = write_set.into_iter().map(|(l, _)| l).collect();
        *last_written_locations = new_locations.clone();

        for prev_location in prev_locations.iter() {
            if !new_locations.contains(prev_location) {
                if let Some(location_map) = self.data.get_mut(prev_location) {
                    location_map.remove(&tx_version.tx_idx);
                }
            }
        }

        new_locations.iter().any(|l| !prev_locations.contains(l))
    }

    /// Obtain the last read set recorded by an execution of `tx_idx` and
    /// check that re-reading each memory location in the read set still
    /// yields the same value. For every value that was read, the read
    /// set stores a read origin: the version of the transaction that
    /// wrote the value, or `Storage` if it was read from the pre-block
    /// state. Incarnation numbers are monotonically increasing, so it is
    /// sufficient to compare origins directly.
    ///
    /// This runs during validation, after the incarnation under test has
    /// already executed and recorded its read set. If the thread
    /// performing validation for incarnation `i` is slow, it may observe
    /// a read set recorded by a later incarnation instead; in that case
    /// incarnation `i` is guaranteed to already be aborted, so the
    /// validation's outcome has no effect on the system regardless.
    pub(crate) fn validate_read_set(&self, tx_idx: TxIdx) -> bool {
        for (location, prior_origin) in self.last_read_set[tx_idx].lock().iter() {
            match self.read(location, tx_idx) {
                ReadMemoryResult::ReadError { .. } => return false,
                ReadMemoryResult::NotFound => {
                    if *prior_origin != ReadOrigin::Storage {
                        return false;
                    }
                }
                ReadMemoryResult::Ok { version, .. } => match prior_origin {
                    ReadOrigin::Storage => return false,
                    ReadOrigin::MvMemory(v) => {
                        if v != &version {
                            return false;
                        }
                    }
                },
            }
        }
        true
    }

    /// Replace the write set of an aborted incarnation with ESTIMATE
    /// markers. Ensures validations fail for higher transactions that
    /// read the data written by the aborted transaction, and serves as
    /// a "write estimate" for the next incarnation of this transaction:
    /// any transaction that observes one of these markers waits for the
    /// dependency to re-execute rather than ignoring it and likely
    /// aborting once its next incarnation writes to the same location
    /// again.
    pub(crate) fn convert_writes_to_estimates(&self, tx_idx: TxIdx) {
        for location in self.last_written_locations[tx_idx].lock().iter() {
            if let Some(location_map) = self.data.get_mut(location) {
                location_map.insert(tx_idx, MemoryEntry::Estimate);
            }
        }
    }

    /// Find the highest transaction index below `tx_idx` that has
    /// written to `location`. This is the best guess for speculative
    /// reads: we assume no transaction between the highest writer found
    /// and `tx_idx` writes to the same location. If that writer's entry
    /// is an ESTIMATE marker, a read error is returned so the caller
    /// postpones execution of `tx_idx` until the blocking transaction
    /// completes its next incarnation. When no lower transaction has
    /// written to the location, `NotFound` tells the caller to fall back
    /// to the state DB.
    pub(crate) fn read(&self, location: &MemoryLocation, tx_idx: TxIdx) -> ReadMemoryResult {
        let Some(location_map) = self.data.get(location) else {
            return ReadMemoryResult::NotFound;
        };
        let closest = location_map.iter().filter(|e| *e.key() < tx_idx).max_by_key(|e| *e.key());
        match closest {
            None => ReadMemoryResult::NotFound,
            Some(entry) => match entry.value() {
                MemoryEntry::Estimate => ReadMemoryResult::ReadError { blocking_tx_idx: *entry.key() },
                MemoryEntry::Data(tx_incarnation, value) => ReadMemoryResult::Ok {
                    version: TxVersion { tx_idx: *entry.key(), tx_incarnation: *tx_incarnation },
                    value: value.clone(),
                },
            },
        }
    }
}
