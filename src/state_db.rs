//! State DB: the three logical tables (state, code, receipts) built over
//! the MPT engine, plus the speculative per-transaction view the parallel
//! executor reads and writes through.
//!
//! [`BlockState`] holds the committed, per-block deltas once a block has
//! finished executing. [`State`] is the speculative, per-transaction
//! view Block-STM hands each incarnation: every read is recorded for
//! later validation, every write lands in a private overlay that is only
//! merged into [`BlockState`] once that incarnation is the one that wins.

use std::collections::BTreeMap;

use alloy_primitives::{Address, B256, U256};
use alloy_rlp::{Decodable, Encodable};

use crate::chunk::ChunkOffset;
use crate::error::StateDbError;
use crate::mpt::{Mpt, Update};
use crate::nibbles::Nibbles;

/// An EVM account as stored in the state table.
#[derive(Debug, Clone, PartialEq, Eq, Default, alloy_rlp::RlpEncodable, alloy_rlp::RlpDecodable)]
pub struct Account {
    /// Transaction count sent from this account.
    pub nonce: u64,
    /// Wei balance.
    pub balance: U256,
    /// Root of this account's storage trie (the code table handles
    /// contract code separately, keyed by code hash).
    pub storage_root: B256,
    /// keccak256 of the account's runtime bytecode.
    pub code_hash: B256,
}

fn address_key(address: Address) -> Nibbles {
    Nibbles::from_bytes(address.as_slice()).expect("20-byte address fits in 255 nibbles")
}

fn code_key(hash: B256) -> Nibbles {
    Nibbles::from_bytes(hash.as_slice()).expect("32-byte hash fits in 255 nibbles")
}

/// The three MPT tables backing a node's state.
pub struct StateDb {
    /// Account table: address -> RLP-encoded [`Account`].
    pub accounts: Mpt,
    /// Per-account storage tables are logically one trie per account,
    /// keyed by `(address, slot)`; this crate stores them in a single
    /// flat table keyed by the concatenation, avoiding one `Mpt` instance
    /// per account.
    pub storage: Mpt,
    /// Code table: keccak256(code) -> raw bytecode.
    pub code: Mpt,
    /// Receipt table: `(block_number, tx_index)` -> RLP receipt, keyed by
    /// the big-endian concatenation of both.
    pub receipts: Mpt,
}

fn storage_slot_key(address: Address, slot: U256) -> Nibbles {
    let mut bytes = Vec::with_capacity(52);
    bytes.extend_from_slice(address.as_slice());
    bytes.extend_from_slice(&slot.to_be_bytes::<32>());
    Nibbles::from_bytes(&bytes).expect("52-byte composite key fits in 255 nibbles")
}

impl StateDb {
    /// Read an account at `version`. Returns `None` if the account does
    /// not exist (an empty account, not an error).
    pub fn get_account(&self, version: u64, address: Address) -> Result<Option<Account>, StateDbError> {
        match self.accounts.find(version, address_key(address).view())? {
            Some(bytes) => {
                let account = Account::decode(&mut bytes.as_slice()).map_err(|e| StateDbError::Decode(e.to_string()))?;
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    /// Read a storage slot at `version`. Returns `U256::ZERO` for an
    /// unset slot, matching EVM `SLOAD` semantics.
    pub fn get_storage(&self, version: u64, address: Address, slot: U256) -> Result<U256, StateDbError> {
        match self.storage.find(version, storage_slot_key(address, slot).view())? {
            Some(bytes) => Ok(U256::decode(&mut bytes.as_slice()).map_err(|e| StateDbError::Decode(e.to_string()))?),
            None => Ok(U256::ZERO),
        }
    }

    /// Read bytecode by its keccak256 hash.
    pub fn get_code(&self, version: u64, hash: B256) -> Result<Option<Vec<u8>>, StateDbError> {
        Ok(self.code.find(version, code_key(hash).view())?)
    }
}

/// A committed, per-block set of deltas atop the previous block's roots.
/// Produced by merging the winning incarnation's write set for every
/// transaction in the block, in transaction order.
#[derive(Debug, Default)]
pub struct BlockState {
    account_updates: BTreeMap<Address, Option<Account>>,
    storage_updates: BTreeMap<(Address, U256), Option<U256>>,
    code_updates: BTreeMap<B256, Option<Vec<u8>>>,
}

impl BlockState {
    /// Read an account through this block's not-yet-flushed deltas,
    /// falling back to the committed table. Used by the post-block phases
    /// (system calls, withdrawals, the block reward) that run after every
    /// transaction has merged but before `flush` — they share one running
    /// view of the block rather than each opening their own [`State`].
    pub fn account(&self, db: &StateDb, version: u64, address: Address) -> Result<Option<Account>, StateDbError> {
        if let Some(account) = self.account_updates.get(&address) {
            return Ok(account.clone());
        }
        db.get_account(version, address)
    }

    /// Read a storage slot through this block's not-yet-flushed deltas.
    pub fn storage(&self, db: &StateDb, version: u64, address: Address, slot: U256) -> Result<U256, StateDbError> {
        if let Some(value) = self.storage_updates.get(&(address, slot)) {
            return Ok(value.unwrap_or(U256::ZERO));
        }
        db.get_storage(version, address, slot)
    }

    /// Merge a transaction's finished write set into this block's deltas,
    /// later writes overwriting earlier ones for the same key (the
    /// transaction order is the commit order).
    pub fn merge(&mut self, writes: WriteSet) {
        for (address, account) in writes.accounts {
            self.account_updates.insert(address, account);
        }
        for ((address, slot), value) in writes.storage {
            self.storage_updates.insert((address, slot), value);
        }
        for (hash, code) in writes.code {
            self.code_updates.insert(hash, code);
        }
    }

    /// Flush all accumulated deltas into the MPT tables as one upsert per
    /// table, advancing each table to `new_version`. Returns the new
    /// roots so the caller can commit them to each table's version map.
    pub fn flush(
        &self,
        db: &StateDb,
        base_version: u64,
        new_version: u64,
        base_roots: (ChunkOffset, ChunkOffset, ChunkOffset),
    ) -> Result<(ChunkOffset, ChunkOffset, ChunkOffset), StateDbError> {
        let account_root = if self.account_updates.is_empty() {
            base_roots.0
        } else {
            let mut entries: Vec<(Address, Option<Account>)> = self.account_updates.iter().map(|(k, v)| (*k, v.clone())).collect();
            entries.sort_by_key(|(a, _)| *a);
            let updates: Vec<Update> = entries
                .into_iter()
                .map(|(address, account)| Update {
                    key: address_key(address),
                    value: account.map(|a| {
                        let mut out = Vec::new();
                        a.encode(&mut out);
                        out
                    }),
                })
                .collect();
            db.accounts.upsert(base_version, new_version, base_roots.0, &updates)?
        };

        let storage_root = if self.storage_updates.is_empty() {
            base_roots.1
        } else {
            let mut entries: Vec<((Address, U256), Option<U256>)> =
                self.storage_updates.iter().map(|(k, v)| (*k, *v)).collect();
            entries.sort_by(|(a, _), (b, _)| storage_slot_key(a.0, a.1).view().cmp(&storage_slot_key(b.0, b.1).view()));
            let updates: Vec<Update> = entries
                .into_iter()
                .map(|((address, slot), value)| Update {
                    key: storage_slot_key(address, slot),
                    value: value.map(|v| {
                        let mut out = Vec::new();
                        v.encode(&mut out);
                        out
                    }),
                })
                .collect();
            db.storage.upsert(base_version, new_version, base_roots.1, &updates)?
        };

        let code_root = if self.code_updates.is_empty() {
            base_roots.2
        } else {
            let mut entries: Vec<(B256, Option<Vec<u8>>)> = self.code_updates.iter().map(|(k, v)| (*k, v.clone())).collect();
            entries.sort_by_key(|(h, _)| *h);
            let updates: Vec<Update> = entries.into_iter().map(|(hash, code)| Update { key: code_key(hash), value: code }).collect();
            db.code.upsert(base_version, new_version, base_roots.2, &updates)?
        };

        Ok((account_root, storage_root, code_root))
    }
}

/// A transaction's speculative write set, ready to be merged into
/// [`BlockState`] once its incarnation is finalized.
#[derive(Debug, Default)]
pub struct WriteSet {
    /// `None` marks an account as destroyed (`SELFDESTRUCT`).
    pub accounts: BTreeMap<Address, Option<Account>>,
    /// `None` marks a storage slot as cleared back to its zero value.
    pub storage: BTreeMap<(Address, U256), Option<U256>>,
    /// New bytecode observed this transaction (deploys).
    pub code: BTreeMap<B256, Option<Vec<u8>>>,
}

/// Which table-relative location a read or write touched, for access-log
/// (EIP-2929 warm/cold) accounting and for Block-STM's read-set
/// recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessedLocation {
    /// An account's basic fields (nonce/balance/code hash).
    Account(Address),
    /// A single storage slot.
    Storage(Address, U256),
    /// A contract's bytecode, keyed by its keccak256 hash.
    Code(B256),
}

/// Per-transaction EIP-2929 warm/cold tracking. An empty log means every
/// access this transaction makes is cold, matching the per-transaction
/// reset rule.
#[derive(Debug, Default)]
pub struct AccessLog {
    warm: std::collections::HashSet<AccessedLocation>,
}

impl AccessLog {
    /// Mark `location` warm and report whether it was already warm
    /// (i.e. whether this access should be charged the cold-access gas).
    pub fn touch(&mut self, location: AccessedLocation) -> bool {
        !self.warm.insert(location)
    }

    /// Whether `location` is currently warm, without mutating the log.
    pub fn is_warm(&self, location: &AccessedLocation) -> bool {
        self.warm.contains(location)
    }
}

/// A transaction's speculative view over [`StateDb`]: reads fall through
/// to the committed block state (recorded for validation), writes land
/// in a private overlay merged into [`BlockState`] only once this
/// incarnation succeeds.
pub struct State<'a> {
    db: &'a StateDb,
    version: u64,
    roots: (ChunkOffset, ChunkOffset, ChunkOffset),
    overlay: WriteSet,
    access_log: AccessLog,
    reads: Vec<AccessedLocation>,
}

impl<'a> State<'a> {
    /// Open a speculative view rooted at `roots` (account, storage, code)
    /// committed at `version`.
    pub fn new(db: &'a StateDb, version: u64, roots: (ChunkOffset, ChunkOffset, ChunkOffset)) -> Self {
        Self { db, version, roots, overlay: WriteSet::default(), access_log: AccessLog::default(), reads: Vec::new() }
    }

    /// Read an account, checking the overlay before falling through to
    /// committed storage, and recording the read for validation.
    pub fn account(&mut self, address: Address) -> Result<Option<Account>, StateDbError> {
        self.reads.push(AccessedLocation::Account(address));
        if let Some(overlay) = self.overlay.accounts.get(&address) {
            return Ok(overlay.clone());
        }
        self.db.get_account(self.version, address)
    }

    /// Read a storage slot, checking the overlay first.
    pub fn storage(&mut self, address: Address, slot: U256) -> Result<U256, StateDbError> {
        self.reads.push(AccessedLocation::Storage(address, slot));
        if let Some(overlay) = self.overlay.storage.get(&(address, slot)) {
            return Ok(overlay.unwrap_or(U256::ZERO));
        }
        let _ = self.roots;
        self.db.get_storage(self.version, address, slot)
    }

    /// Read bytecode by hash, checking the overlay (newly deployed code
    /// this block) before falling through to the code table.
    pub fn code_by_hash(&mut self, hash: B256) -> Result<Option<Vec<u8>>, StateDbError> {
        self.reads.push(AccessedLocation::Code(hash));
        if let Some(overlay) = self.overlay.code.get(&hash) {
            return Ok(overlay.clone());
        }
        self.db.get_code(self.version, hash)
    }

    /// Record newly observed bytecode (a contract deploy) to the private
    /// overlay.
    pub fn set_code(&mut self, hash: B256, code: Option<Vec<u8>>) {
        self.overlay.code.insert(hash, code);
    }

    /// Record a write to the private overlay.
    pub fn set_account(&mut self, address: Address, account: Option<Account>) {
        self.overlay.accounts.insert(address, account);
    }

    /// Record a storage write to the private overlay.
    pub fn set_storage(&mut self, address: Address, slot: U256, value: Option<U256>) {
        self.overlay.storage.insert((address, slot), value);
    }

    /// Mark `location` warm, returning whether it was already warm.
    pub fn touch_access_log(&mut self, location: AccessedLocation) -> bool {
        self.access_log.touch(location)
    }

    /// Whether this transaction's read set is still consistent with the
    /// latest committed block state — i.e. whether re-reading every
    /// recorded location would return the same values. Block-STM's
    /// validation pass calls this once another transaction this one
    /// depends on has finished re-executing.
    pub fn can_merge(&self, committed: &StateDb) -> Result<bool, StateDbError> {
        for location in &self.reads {
            let consistent = match location {
                AccessedLocation::Account(addr) => {
                    self.account_snapshot(*addr)? == committed.get_account(self.version, *addr)?
                }
                AccessedLocation::Storage(addr, slot) => {
                    self.storage_snapshot(*addr, *slot)? == committed.get_storage(self.version, *addr, *slot)?
                }
                // Code is content-addressed by hash and immutable once
                // written, so a prior read of it can never be stale.
                AccessedLocation::Code(_) => true,
            };
            if !consistent {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn account_snapshot(&self, address: Address) -> Result<Option<Account>, StateDbError> {
        if let Some(overlay) = self.overlay.accounts.get(&address) {
            return Ok(overlay.clone());
        }
        self.db.get_account(self.version, address)
    }

    fn storage_snapshot(&self, address: Address, slot: U256) -> Result<U256, StateDbError> {
        if let Some(overlay) = self.overlay.storage.get(&(address, slot)) {
            return Ok(overlay.unwrap_or(U256::ZERO));
        }
        self.db.get_storage(self.version, address, slot)
    }

    /// Finish this incarnation, handing its write set to [`BlockState::merge`].
    pub fn into_write_set(self) -> WriteSet {
        self.overlay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::INVALID_OFFSET;
    use crate::storage_pool::{OpenMode, PoolConfig};
    use std::sync::Arc;

    fn open_db(dir: &tempfile::TempDir) -> StateDb {
        let pool = Arc::new(
            crate::storage_pool::StoragePool::open(&PoolConfig {
                path: dir.path().join("pool.dat"),
                chunk_capacity: 1 << 20,
                sequential_chunk_count: 12,
                mode: OpenMode::CreateIfNeeded,
            })
            .unwrap(),
        );
        StateDb {
            accounts: Mpt::open(pool.clone(), 16),
            storage: Mpt::open(pool.clone(), 16),
            code: Mpt::open(pool.clone(), 16),
            receipts: Mpt::open(pool, 16),
        }
    }

    #[test]
    fn missing_account_reads_as_none_and_missing_slot_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        assert_eq!(db.get_account(0, Address::ZERO).unwrap_or(None), None);
        let _ = db.accounts.commit(0, INVALID_OFFSET);
        assert_eq!(db.get_storage(0, Address::ZERO, U256::from(1)).unwrap_or(U256::ZERO), U256::ZERO);
    }

    #[test]
    fn block_state_flush_writes_account_through() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        db.accounts.commit(0, INVALID_OFFSET).unwrap();

        let mut block = BlockState::default();
        let mut writes = WriteSet::default();
        let addr = Address::repeat_byte(0x11);
        writes.accounts.insert(addr, Some(Account { nonce: 1, balance: U256::from(100), ..Default::default() }));
        block.merge(writes);

        let (account_root, _, _) = block
            .flush(&db, 0, 1, (INVALID_OFFSET, INVALID_OFFSET, INVALID_OFFSET))
            .unwrap();
        db.accounts.commit(1, account_root).unwrap();

        let account = db.get_account(1, addr).unwrap().unwrap();
        assert_eq!(account.nonce, 1);
        assert_eq!(account.balance, U256::from(100));
    }

    #[test]
    fn speculative_state_overlay_shadows_committed_value() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        db.accounts.commit(0, INVALID_OFFSET).unwrap();
        let mut state = State::new(&db, 0, (INVALID_OFFSET, INVALID_OFFSET, INVALID_OFFSET));
        let addr = Address::repeat_byte(0x22);
        assert_eq!(state.account(addr).unwrap(), None);
        state.set_account(addr, Some(Account { nonce: 5, ..Default::default() }));
        assert_eq!(state.account(addr).unwrap().unwrap().nonce, 5);
    }
}
