//! Ambient configuration: the on-disk layout of a [`StateDb`] and the
//! tunables for one `execute_block` call, both `serde::Deserialize` so a
//! host process can load them from a config file the way it loads any
//! other service configuration.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::chunk::DEFAULT_CHUNK_CAPACITY;
use crate::error::PoolError;
use crate::mpt::version::DEFAULT_HISTORY_LENGTH;
use crate::mpt::Mpt;
use crate::state_db::StateDb;
use crate::storage_pool::{OpenMode, PoolConfig, StoragePool};

/// On-disk layout for the four MPT tables a [`StateDb`] is built from.
/// All four tables share one [`StoragePool`].
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// Path to the pool's backing file.
    pub path: PathBuf,
    /// Byte capacity of each chunk.
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: u64,
    /// Number of sequential (append-only) chunks to provision.
    pub sequential_chunk_count: u32,
    /// How many versions of history each table retains before evicting
    /// its oldest root.
    #[serde(default = "default_history_length")]
    pub history_length: u64,
    /// How to treat an existing file at `path`.
    #[serde(default = "default_open_mode")]
    pub mode: OpenMode,
}

fn default_chunk_capacity() -> u64 {
    DEFAULT_CHUNK_CAPACITY
}

fn default_history_length() -> u64 {
    DEFAULT_HISTORY_LENGTH
}

fn default_open_mode() -> OpenMode {
    OpenMode::CreateIfNeeded
}

impl DbConfig {
    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            path: self.path.clone(),
            chunk_capacity: self.chunk_capacity,
            sequential_chunk_count: self.sequential_chunk_count,
            mode: self.mode,
        }
    }

    /// Open the backing pool and build the four MPT tables
    /// (accounts/storage/code/receipts) that make up a [`StateDb`].
    pub fn open(&self) -> Result<StateDb, PoolError> {
        if self.history_length == 0 {
            return Err(PoolError::InvalidConfig("history_length must be > 0"));
        }
        let pool = Arc::new(StoragePool::open(&self.pool_config())?);
        Ok(StateDb {
            accounts: Mpt::open(pool.clone(), self.history_length),
            storage: Mpt::open(pool.clone(), self.history_length),
            code: Mpt::open(pool.clone(), self.history_length),
            receipts: Mpt::open(pool, self.history_length),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_a_state_db_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbConfig {
            path: dir.path().join("pool.dat"),
            chunk_capacity: 1 << 20,
            sequential_chunk_count: 12,
            history_length: 16,
            mode: OpenMode::CreateIfNeeded,
        };
        let db = config.open().unwrap();
        db.accounts.commit(0, crate::chunk::INVALID_OFFSET).unwrap();
        assert_eq!(db.get_account(0, alloy_primitives::Address::ZERO).unwrap(), None);
    }
}
