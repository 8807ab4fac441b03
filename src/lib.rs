//! Core storage and execution engine for an EVM-compatible node.
//!
//! Two tightly coupled subsystems live here: a versioned, append-only
//! Merkle-Patricia trie over a custom chunked block device, written and
//! read back through plain blocking positioned I/O ([`chunk`],
//! [`storage_pool`], [`node_writer`], [`node_cache`], [`mpt`]), and a
//! Block-STM style parallel block executor built on top of the
//! [`state_db`] it exposes (`mv_memory`, `vm`, `scheduler`, `primitives`,
//! `executor`). [`event_recorder`] is the opaque telemetry-ring handle
//! threaded through both halves.

// TODO: Better types & API please

use ahash::AHashMap;
use revm::primitives::{AccountInfo, Address, Bytecode, U256};

pub mod chunk;
pub mod config;
pub mod error;
pub mod event_recorder;
mod executor;
pub mod metrics;
pub mod mpt;
mod mv_memory;
pub mod nibbles;
pub mod node_cache;
pub mod node_writer;
mod primitives;
mod scheduler;
pub mod state_db;
pub mod storage_pool;
mod vm;

pub use config::DbConfig;
pub use executor::{execute_block, BlockExecutionResult, ExecutorConfig, PevmError, PevmResult, Receipt, ReceiptLog};
pub use metrics::{MetricsRecorder, NoopMetrics};
pub use primitives::{get_block_env, get_block_spec, get_tx_envs, Revision};
pub use vm::{ExecutionError, PevmTxExecutionResult};

// TODO: More granularity here, for instance, to separate an account's
// balance, nonce, etc. instead of marking conflict at the whole account.
// That way we may also generalize beneficiary balance's lazy update
// behaviour into `MemoryValue` for more use cases.
// TODO: It would be nice if we could tie the different cases of
// memory locations & values at the type level, to prevent lots of
// matches & potentially dangerous mismatch mistakes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum MemoryLocation {
    Basic(Address),
    Storage(Address, U256),
    Code(Address),
}

impl MemoryLocation {
    pub(crate) fn address(&self) -> &Address {
        match self {
            MemoryLocation::Basic(address) => address,
            MemoryLocation::Storage(address, _) => address,
            MemoryLocation::Code(address) => address,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum MemoryValue {
    Basic(Box<AccountInfo>),
    // We lazily update the beneficiary balance to avoid continuous
    // dependencies as all transactions read and write to it. We
    // either evaluate all these beneficiary account states at the
    // end of BlockSTM, or when there is an explicit read.
    // Important: The value of this lazy (update) balance is the gas
    // it receives in the transaction, to be added to the absolute
    // balance at the end of the previous transaction.
    LazyBeneficiaryBalance(U256),
    Storage(U256),
    Code(Bytecode),
}

pub(crate) enum MemoryEntry {
    Data(TxIncarnation, MemoryValue),
    // When an incarnation is aborted due to a validation failure, the
    // entries in the multi-version data structure corresponding to its
    // write set are replaced with this special ESTIMATE marker.
    // This signifies that the next incarnation is estimated to write to the
    // same memory locations. An incarnation stops and is immediately aborted
    // whenever it reads a value marked as an ESTIMATE written by a lower
    // transaction, instead of potentially wasting a full execution and aborting
    // during validation.
    // The ESTIMATE markers that are not overwritten are removed by the next
    // incarnation.
    Estimate,
}

// The index of the transaction in the block.
pub(crate) type TxIdx = usize;

// The i-th time a transaction is re-executed, counting from 0.
pub(crate) type TxIncarnation = usize;

// - ReadyToExecute(i) --try_incarnate--> Executing(i)
// Non-blocked execution:
//   - Executing(i) --finish_execution--> Executed(i)
//   - Executed(i) --finish_validation--> Validated(i)
//   - Executed/Validated(i) --try_validation_abort--> Aborting(i)
//   - Aborted(i) --finish_validation(w.aborted=true)--> ReadyToExecute(i+1)
// Blocked execution:
//   - Executing(i) --add_dependency--> Aborting(i)
//   - Aborting(i) --resume--> ReadyToExecute(i+1)
#[derive(PartialEq, Debug, Clone, Copy)]
pub(crate) enum IncarnationStatus {
    ReadyToExecute,
    Executing,
    Executed,
    Validated,
    Aborting,
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub(crate) struct TxStatus {
    pub(crate) incarnation: TxIncarnation,
    pub(crate) status: IncarnationStatus,
}

pub(crate) type TransactionsStatus = Vec<TxStatus>;
// We use `Vec` for dependents to simplify runtime update code.
// We use `HashMap` for dependencies as we're only adding
// them during preprocessing and removing them during processing.
// The underlying `HashSet` is to simplify index deduplication logic
// while adding new dependencies.
pub(crate) type TransactionsDependents = Vec<Vec<TxIdx>>;
pub(crate) type TransactionsDependencies = AHashMap<TxIdx, Vec<TxIdx>>;

// BlockSTM maintains an in-memory multi-version data structure that
// stores for each memory location the latest value written per
// transaction, along with the associated transaction version. When a
// transaction reads a memory location, it obtains from the
// multi-version data structure the value written to this location by
// the highest transaction that appears before it in the block, along
// with the associated version. For instance, tx5 would read the value
// written by tx3 even when tx6 has also written to it. If no previous
// transactions have written to a location, the value would be read
// from the storage state before block execution.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TxVersion {
    pub(crate) tx_idx: TxIdx,
    pub(crate) tx_incarnation: TxIncarnation,
}

// The origin of a memory read. It could be from the live multi-version
// data structure or from storage (chain state before block execution).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadOrigin {
    // The previous transaction version that wrote the value.
    MvMemory(TxVersion),
    Storage,
}

/// Errors when reading a memory location while executing BlockSTM.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadError {
    /// The underlying state DB returned an error.
    StorageError(String),
    /// This memory location has been written (or is estimated to be
    /// written) by a lower, not-yet-finished transaction; retry after it
    /// completes its next incarnation.
    BlockingIndex(TxIdx),
    /// The stored memory value's kind doesn't match the location's kind.
    InvalidMemoryLocationType,
}

// The memory locations needed to execute an incarnation. While a hash
// map is cleaner and reduces duplication chances, vectors are
// noticeably faster in the mainnet benchmark. The beneficiary is just
// another `MemoryLocation::Basic` here; lazy balance additions chain
// through the same multi-version read path as any other location.
pub(crate) type ReadSet = Vec<(MemoryLocation, ReadOrigin)>;

// The updates made by this transaction incarnation, which is applied
// to the multi-version data structure at the end of execution.
pub(crate) type WriteSet = Vec<(MemoryLocation, MemoryValue)>;

pub(crate) type ExecutionTask = TxVersion;
pub(crate) type ValidationTask = TxVersion;

#[derive(Debug)]
pub(crate) enum Task {
    Execution(ExecutionTask),
    Validation(ValidationTask),
}

// This optimization is desired as we constantly index into many
// vectors of the block-size size. It can yield up to 5% improvement.
macro_rules! index_mutex {
    ( $vec:expr, $index:expr) => {
        // SAFETY: A correct scheduler would not leak indexes larger
        // than the block size, which is the size of all vectors we
        // index via this macro. Otherwise, DO NOT USE!
        unsafe { $vec.get_unchecked($index).lock() }
    };
}
pub(crate) use index_mutex;
