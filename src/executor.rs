//! Block execution: recovers senders, runs the pre-block system calls,
//! drives transactions through the Block-STM scheduler/`mv_memory`/`Vm`
//! machinery built in the sibling modules, then applies withdrawals, the
//! block reward, and the beneficiary's lazily-accumulated balance before
//! flushing the block's deltas into the [`StateDb`]. Adapted from the
//! teacher's `pevm.rs` (`execute_revm`/`try_execute`/`try_validate`/
//! `preprocess_dependencies`/`post_process_beneficiary`), generalized
//! from a generic `Storage` trait to read/write directly through
//! [`StateDb`] and to produce [`Receipt`]s instead of raw REVM
//! `ResultAndState`s.

use std::num::NonZeroUsize;
use std::sync::OnceLock;
use std::thread;

use ahash::{AHashMap, AHashSet};
use alloy_primitives::{address, Address, Bytes, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use alloy_rpc_types::{Block, Transaction, Withdrawal};
use parking_lot::Mutex;
use revm::primitives::{AccountInfo, SpecId, TransactTo, TxEnv};

use crate::chunk::ChunkOffset;
use crate::error::StateDbError;
use crate::metrics::MetricsRecorder;
use crate::mv_memory::{MvMemory, ReadMemoryResult};
use crate::primitives::{get_block_env, get_block_spec, get_tx_envs, Revision};
use crate::scheduler::Scheduler;
use crate::state_db::{Account, BlockState, StateDb, WriteSet as StateWriteSet};
use crate::vm::{ExecutionError, PevmTxExecutionResult, Vm, VmExecutionResult};
use crate::{
    index_mutex, ExecutionTask, IncarnationStatus, MemoryLocation, MemoryValue, Task, TransactionsDependencies,
    TransactionsDependents, TransactionsStatus, TxIdx, TxStatus, TxVersion, ValidationTask,
};

// EIP-4788: parent beacon block root, written into a ring-buffered
// storage layout at two slots keyed by `timestamp % HISTORY_BUFFER_LENGTH`.
const BEACON_ROOTS_ADDRESS: Address = address!("000F3df6D732807Ef1319fB7B8bB8522d0Beac02");
const HISTORY_BUFFER_LENGTH: u64 = 8191;

// EIP-2935: ancestor block hashes, ring-buffered the same way.
const HISTORY_STORAGE_ADDRESS: Address = address!("0000F90827F1C53A10CB7A02335B175320002935");
const BLOCKHASH_HISTORY_SERVE_WINDOW: u64 = 8192;

// The DAO fork only ever applies to one historical mainnet block; the
// exact drained-account list is chain data, not something this core
// crate hardcodes, so it is supplied through `ExecutorConfig`.
const DAO_FORK_BLOCK_NUMBER: u64 = 1_920_000;

/// Tunables for one `execute_block` call.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on worker threads spawned for one block. The scheduler
    /// may use fewer if the block is small or mostly sequential.
    pub concurrency_level: NonZeroUsize,
    /// Skip the dependency analysis and Block-STM scheduler entirely,
    /// executing transactions one at a time in order. Used for small
    /// blocks and as the fallback when dependency analysis gives up.
    pub force_sequential: bool,
    /// Accounts whose balance the DAO fork moves to `dao_fork_beneficiary`
    /// at block 1,920,000 under Homestead. Empty unless the caller is
    /// replaying that specific chain and block.
    pub dao_fork_drained_accounts: Vec<Address>,
    /// Where the DAO fork's drained balance is credited.
    pub dao_fork_beneficiary: Address,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_level: NonZeroUsize::new(thread::available_parallelism().map(|n| n.get()).unwrap_or(1)).unwrap(),
            force_sequential: false,
            dao_fork_drained_accounts: Vec::new(),
            dao_fork_beneficiary: Address::ZERO,
        }
    }
}

/// Errors executing a block.
#[derive(Debug, thiserror::Error)]
pub enum PevmError {
    /// Cannot derive the chain spec from the block header.
    #[error("cannot resolve a revision for this block header")]
    UnknownBlockSpec,
    /// Block header lacks information for execution.
    #[error("block header is missing fields required to build the environment")]
    MissingHeaderData,
    /// Transactions lack information for execution (e.g. only hashes).
    #[error("block was not fetched with full transaction objects")]
    MissingTransactionData,
    /// A transaction's signature did not recover to a valid sender.
    #[error("transaction {0} has an invalid signature")]
    InvalidSignature(TxIdx),
    /// The underlying EVM returned an unrecoverable error.
    #[error("transaction {index} failed to execute: {source}")]
    ExecutionError {
        /// The failing transaction's index in the block.
        index: TxIdx,
        /// The underlying error.
        #[source]
        source: ExecutionError,
    },
    /// Failure writing the block's deltas into the state DB.
    #[error(transparent)]
    StateDb(#[from] StateDbError),
}

/// Result type for [`execute_block`].
pub type PevmResult<T> = Result<T, PevmError>;

/// An RLP-encodable log entry, independent of any particular REVM version.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ReceiptLog {
    /// The contract that emitted this log.
    pub address: Address,
    /// Indexed topics (0 to 4 entries).
    pub topics: Vec<B256>,
    /// Non-indexed log data.
    pub data: Bytes,
}

/// A transaction receipt, persisted in `StateDb::receipts` keyed by
/// `(block_number, tx_index)`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Receipt {
    /// Whether the transaction succeeded.
    pub success: bool,
    /// Gas used by this transaction alone (not cumulative).
    pub gas_used: u64,
    /// Gas used by this transaction plus every transaction before it in
    /// the block.
    pub cumulative_gas_used: u64,
    /// Logs emitted by this transaction.
    pub logs: Vec<ReceiptLog>,
}

/// The outcome of executing one block: its receipts, in transaction
/// order, and the new roots for the account/storage/code tables.
#[derive(Debug)]
pub struct BlockExecutionResult {
    /// One receipt per transaction, in block order.
    pub receipts: Vec<Receipt>,
    /// Total gas used across every transaction in the block.
    pub gas_used: u64,
    /// The account, storage, and code table roots after this block's
    /// deltas have been flushed. Not yet committed to the version map;
    /// the caller decides when (and whether) to call `Mpt::commit` on
    /// each table, e.g. after the block is judged final.
    pub roots: (ChunkOffset, ChunkOffset, ChunkOffset),
}

/// Execute an Alloy block against `state_db` at `base_version`/`base_roots`,
/// producing receipts and new table roots without committing them.
#[tracing::instrument(level = "info", skip_all, fields(block_number = block.header.number))]
pub fn execute_block(
    state_db: &StateDb,
    base_version: u64,
    base_roots: (ChunkOffset, ChunkOffset, ChunkOffset),
    new_version: u64,
    block: &Block<Transaction>,
    config: &ExecutorConfig,
    metrics: &dyn MetricsRecorder,
) -> PevmResult<BlockExecutionResult> {
    let revision = get_block_spec(&block.header).ok_or(PevmError::UnknownBlockSpec)?;
    let block_env = get_block_env(&block.header).ok_or(PevmError::MissingHeaderData)?;
    let tx_envs = get_tx_envs(&block.transactions).ok_or(PevmError::MissingTransactionData)?;

    let mut block_state = BlockState::default();

    run_pre_block_system_calls(state_db, base_version, &mut block_state, revision, block)?;
    apply_dao_fork(&mut block_state, base_version, state_db, revision, block.header.number, config)?;

    let (execution_results, mv_memory) = if tx_envs.is_empty() {
        (Vec::new(), None)
    } else if config.force_sequential || tx_envs.len() < 4 || block.header.gas_used <= 650_000 {
        let (results, mv_memory) = execute_sequential(state_db, base_version, revision.spec_id(), block_env.clone(), tx_envs)?;
        (results, Some(mv_memory))
    } else {
        match preprocess_dependencies(&block_env.coinbase, &tx_envs) {
            Some((scheduler, max_concurrency)) => {
                let (results, mv_memory) = execute_parallel(
                    state_db,
                    base_version,
                    revision.spec_id(),
                    block_env.clone(),
                    tx_envs,
                    scheduler,
                    config.concurrency_level.min(max_concurrency),
                    metrics,
                )?;
                (results, Some(mv_memory))
            }
            None => {
                let (results, mv_memory) = execute_sequential(state_db, base_version, revision.spec_id(), block_env.clone(), tx_envs)?;
                (results, Some(mv_memory))
            }
        }
    };

    let block_size = execution_results.len();
    let mut cumulative_gas_used: u64 = 0;
    let mut receipts = Vec::with_capacity(block_size);
    for result in &execution_results {
        cumulative_gas_used += result.gas_used;
        receipts.push(Receipt {
            success: result.success,
            gas_used: result.gas_used,
            cumulative_gas_used,
            logs: result.logs.iter().map(receipt_log).collect(),
        });
    }

    for result in execution_results.into_iter() {
        block_state.merge(state_delta_from_tx(result));
    }

    // The beneficiary's final balance is only fully resolved in
    // `mv_memory` (the parallel path lazily accumulates gas tips there to
    // avoid a false conflict on every transaction touching the same
    // address); the sequential path never defers it, so only override
    // when a `mv_memory` instance actually ran.
    if let Some(mv_memory) = &mv_memory {
        if block_size > 0 {
            let beneficiary = block_env.coinbase;
            let info = resolve_account(state_db, base_version, &block_state, mv_memory, beneficiary, block_size)?;
            block_state.merge(single_account_update(beneficiary, info));
        }
    }

    apply_withdrawals(&mut block_state, state_db, base_version, block);
    apply_block_reward(&mut block_state, state_db, base_version, revision, block_env.coinbase);

    let roots = block_state.flush(state_db, base_version, new_version, base_roots)?;
    metrics.record_block_executed(block.header.number, block_size, cumulative_gas_used);
    tracing::debug!(new_version, gas_used = cumulative_gas_used, "block executed");

    Ok(BlockExecutionResult { receipts, gas_used: cumulative_gas_used, roots })
}

fn receipt_log(log: &revm::primitives::Log) -> ReceiptLog {
    ReceiptLog { address: log.address, topics: log.topics().to_vec(), data: log.data.data().clone() }
}

/// Convert one transaction's EVM-shaped state delta into the `StateDb`'s
/// account/storage/code write set. `storage_root` is left zeroed: storage
/// is kept in one flat table keyed by `(address, slot)` rather than a
/// per-account subtrie, so the field is unused by this crate's own reads.
fn state_delta_from_tx(result: PevmTxExecutionResult) -> StateWriteSet {
    let mut writes = StateWriteSet::default();
    for (address, delta) in result.state {
        match delta {
            None => {
                writes.accounts.insert(address, None);
            }
            Some(delta) => {
                writes.accounts.insert(
                    address,
                    Some(Account {
                        nonce: delta.info.nonce,
                        balance: delta.info.balance,
                        storage_root: B256::ZERO,
                        code_hash: delta.info.code_hash,
                    }),
                );
                for (slot, value) in delta.changed_storage {
                    writes.storage.insert((address, slot), if value.is_zero() { None } else { Some(value) });
                }
                if let Some(code) = delta.info.code {
                    if delta.info.code_hash != revm::primitives::KECCAK_EMPTY {
                        writes.code.insert(delta.info.code_hash, Some(code.original_bytes().to_vec()));
                    }
                }
            }
        }
    }
    writes
}

fn single_account_update(address: Address, info: Option<AccountInfo>) -> StateWriteSet {
    let mut writes = StateWriteSet::default();
    let account = info.map(|info| Account { nonce: info.nonce, balance: info.balance, storage_root: B256::ZERO, code_hash: info.code_hash });
    writes.accounts.insert(address, account);
    writes
}

/// Walk the lazily-accumulated balance chain for `address` back to a
/// concrete account value, the same way `VmDb::basic` does mid-execution,
/// except starting from the very end of the block where every
/// incarnation has already been validated (so no blocking reads remain).
fn resolve_account(
    state_db: &StateDb,
    base_version: u64,
    block_state: &BlockState,
    mv_memory: &MvMemory,
    address: Address,
    block_size: usize,
) -> PevmResult<Option<AccountInfo>> {
    let location = MemoryLocation::Basic(address);
    let mut addition = U256::ZERO;
    let mut current_idx = block_size;
    loop {
        match mv_memory.read(&location, current_idx) {
            ReadMemoryResult::NotFound => {
                let base = block_state.account(state_db, base_version, address)?;
                return Ok(match base {
                    Some(account) => Some(AccountInfo {
                        nonce: account.nonce,
                        balance: account.balance + addition,
                        code_hash: account.code_hash,
                        code: None,
                    }),
                    None if addition > U256::ZERO => Some(AccountInfo { balance: addition, ..Default::default() }),
                    None => None,
                });
            }
            ReadMemoryResult::ReadError { .. } => {
                unreachable!("every incarnation has finished and validated by the time the block is finalized")
            }
            ReadMemoryResult::Ok { version, value } => match value {
                MemoryValue::Basic(info) => {
                    let mut info = *info;
                    info.balance += addition;
                    return Ok(Some(info));
                }
                MemoryValue::LazyBeneficiaryBalance(amount) => {
                    addition += amount;
                    current_idx = version.tx_idx;
                }
                _ => unreachable!("MemoryLocation::Basic never stores a non-account value"),
            },
        }
    }
}

fn run_pre_block_system_calls(
    state_db: &StateDb,
    base_version: u64,
    block_state: &mut BlockState,
    revision: Revision,
    block: &Block<Transaction>,
) -> PevmResult<()> {
    if revision.spec_id().is_enabled_in(SpecId::CANCUN) {
        if let Some(parent_beacon_root) = block.header.parent_beacon_block_root {
            let timestamp = U256::from(block.header.timestamp);
            let timestamp_slot = timestamp % U256::from(HISTORY_BUFFER_LENGTH);
            let root_slot = timestamp_slot + U256::from(HISTORY_BUFFER_LENGTH);
            let root = U256::from_be_bytes(parent_beacon_root.0);
            write_system_slot(block_state, state_db, base_version, BEACON_ROOTS_ADDRESS, timestamp_slot, timestamp)?;
            write_system_slot(block_state, state_db, base_version, BEACON_ROOTS_ADDRESS, root_slot, root)?;
        }
    }

    if revision.spec_id().is_enabled_in(SpecId::PRAGUE) && block.header.number > 0 {
        let slot = U256::from(block.header.number.wrapping_sub(1) % BLOCKHASH_HISTORY_SERVE_WINDOW);
        let value = U256::from_be_bytes(block.header.parent_hash.0);
        write_system_slot(block_state, state_db, base_version, HISTORY_STORAGE_ADDRESS, slot, value)?;
    }

    Ok(())
}

fn write_system_slot(
    block_state: &mut BlockState,
    state_db: &StateDb,
    base_version: u64,
    address: Address,
    slot: U256,
    value: U256,
) -> PevmResult<()> {
    let mut writes = StateWriteSet::default();
    writes.storage.insert((address, slot), if value.is_zero() { None } else { Some(value) });
    // A system-call target is implicitly touched; make sure it exists as
    // an (empty-code) account so later reads see a real account rather
    // than treating the slot as belonging to nothing.
    if block_state.account(state_db, base_version, address)?.is_none() {
        writes.accounts.insert(address, Some(Account::default()));
    }
    block_state.merge(writes);
    Ok(())
}

fn apply_dao_fork(
    block_state: &mut BlockState,
    base_version: u64,
    state_db: &StateDb,
    revision: Revision,
    block_number: u64,
    config: &ExecutorConfig,
) -> PevmResult<()> {
    if block_number != DAO_FORK_BLOCK_NUMBER || revision.spec_id() != SpecId::HOMESTEAD || config.dao_fork_drained_accounts.is_empty() {
        return Ok(());
    }
    let mut drained_total = U256::ZERO;
    let mut writes = StateWriteSet::default();
    for &address in &config.dao_fork_drained_accounts {
        if let Some(account) = block_state.account(state_db, base_version, address)? {
            drained_total += account.balance;
            writes.accounts.insert(address, Some(Account { balance: U256::ZERO, ..account }));
        }
    }
    let beneficiary = block_state.account(state_db, base_version, config.dao_fork_beneficiary)?.unwrap_or_default();
    writes.accounts.insert(config.dao_fork_beneficiary, Some(Account { balance: beneficiary.balance + drained_total, ..beneficiary }));
    block_state.merge(writes);
    Ok(())
}

fn apply_withdrawals(block_state: &mut BlockState, state_db: &StateDb, base_version: u64, block: &Block<Transaction>) {
    let Some(withdrawals) = block.withdrawals.as_deref() else { return };
    for withdrawal in withdrawals {
        apply_withdrawal(block_state, state_db, base_version, withdrawal);
    }
}

fn apply_withdrawal(block_state: &mut BlockState, state_db: &StateDb, base_version: u64, withdrawal: &Withdrawal) {
    if withdrawal.amount == 0 {
        return;
    }
    let amount_wei = U256::from(withdrawal.amount) * U256::from(1_000_000_000u64);
    let account = block_state.account(state_db, base_version, withdrawal.address).ok().flatten().unwrap_or_default();
    let mut writes = StateWriteSet::default();
    writes.accounts.insert(withdrawal.address, Some(Account { balance: account.balance + amount_wei, ..account }));
    block_state.merge(writes);
}

fn apply_block_reward(block_state: &mut BlockState, state_db: &StateDb, base_version: u64, revision: Revision, beneficiary: Address) {
    let Some(reward) = block_reward_wei(revision.spec_id()) else { return };
    let account = block_state.account(state_db, base_version, beneficiary).ok().flatten().unwrap_or_default();
    let mut writes = StateWriteSet::default();
    writes.accounts.insert(beneficiary, Some(Account { balance: account.balance + reward, ..account }));
    block_state.merge(writes);
}

/// The static per-block miner reward, or `None` once the chain has moved
/// to proof of stake (rewards come from withdrawals instead). Uncle
/// rewards are not modeled; this crate doesn't carry ommer data.
fn block_reward_wei(spec_id: SpecId) -> Option<U256> {
    if spec_id.is_enabled_in(SpecId::MERGE) {
        None
    } else if spec_id.is_enabled_in(SpecId::CONSTANTINOPLE) {
        Some(U256::from(2_000_000_000_000_000_000u128))
    } else if spec_id.is_enabled_in(SpecId::BYZANTIUM) {
        Some(U256::from(3_000_000_000_000_000_000u128))
    } else {
        Some(U256::from(5_000_000_000_000_000_000u128))
    }
}

/// Execute every transaction in order on one thread, still routing writes
/// through `mv_memory` so the beneficiary's lazily-accumulated balance
/// resolves through the same `resolve_account` path the parallel
/// executor uses (there's only ever one writer, so no read ever blocks).
fn execute_sequential(
    state_db: &StateDb,
    base_version: u64,
    spec_id: SpecId,
    block_env: revm::primitives::BlockEnv,
    txs: Vec<TxEnv>,
) -> PevmResult<(Vec<PevmTxExecutionResult>, MvMemory)> {
    let block_size = txs.len();
    let mv_memory = MvMemory::new(block_size);
    let vm = Vm::new(state_db, base_version, &mv_memory, spec_id, block_env, txs);
    let mut results = Vec::with_capacity(block_size);
    for tx_idx in 0..block_size {
        match vm.execute(tx_idx) {
            VmExecutionResult::Ok { execution_result, read_set, write_set, .. } => {
                mv_memory.record(&TxVersion { tx_idx, tx_incarnation: 0 }, read_set, write_set);
                results.push(execution_result);
            }
            VmExecutionResult::ReadError { .. } => {
                unreachable!("sequential execution never defers a read to a later incarnation")
            }
            VmExecutionResult::ExecutionError(source) => return Err(PevmError::ExecutionError { index: tx_idx, source }),
        }
    }
    Ok((results, mv_memory))
}

#[allow(clippy::too_many_arguments)]
fn execute_parallel(
    state_db: &StateDb,
    base_version: u64,
    spec_id: SpecId,
    block_env: revm::primitives::BlockEnv,
    txs: Vec<TxEnv>,
    scheduler: Scheduler,
    concurrency_level: NonZeroUsize,
    metrics: &dyn MetricsRecorder,
) -> PevmResult<(Vec<PevmTxExecutionResult>, MvMemory)> {
    let block_size = txs.len();
    let mv_memory = MvMemory::new(block_size);
    let vm = Vm::new(state_db, base_version, &mv_memory, spec_id, block_env, txs);

    let execution_error: OnceLock<(TxIdx, ExecutionError)> = OnceLock::new();
    let execution_results: Vec<Mutex<Option<PevmTxExecutionResult>>> = (0..block_size).map(|_| Mutex::new(None)).collect();

    thread::scope(|scope| {
        for _ in 0..concurrency_level.get() {
            scope.spawn(|| {
                let mut task = None;
                let mut consecutive_empty_tasks: u8 = 0;
                while !scheduler.done() {
                    if execution_error.get().is_some() {
                        break;
                    }
                    task = match task {
                        Some(Task::Execution(tx_version)) => {
                            try_execute(&mv_memory, &vm, &scheduler, &execution_error, &execution_results, metrics, tx_version)
                                .map(Task::Validation)
                        }
                        Some(Task::Validation(tx_version)) => try_validate(&mv_memory, &scheduler, &tx_version).map(Task::Execution),
                        None => scheduler.next_task(),
                    };
                    if task.is_none() {
                        consecutive_empty_tasks += 1;
                    } else {
                        consecutive_empty_tasks = 0;
                    }
                    if consecutive_empty_tasks == 3 {
                        break;
                    }
                }
            });
        }
    });

    if let Some((index, source)) = execution_error.into_inner() {
        return Err(PevmError::ExecutionError { index, source });
    }

    let results = execution_results.into_iter().map(|mutex| mutex.into_inner().expect("every transaction finished")).collect();
    Ok((results, mv_memory))
}

fn try_execute(
    mv_memory: &MvMemory,
    vm: &Vm,
    scheduler: &Scheduler,
    execution_error: &OnceLock<(TxIdx, ExecutionError)>,
    execution_results: &[Mutex<Option<PevmTxExecutionResult>>],
    metrics: &dyn MetricsRecorder,
    tx_version: TxVersion,
) -> Option<ValidationTask> {
    match vm.execute(tx_version.tx_idx) {
        VmExecutionResult::ReadError { blocking_tx_idx } => {
            if !scheduler.add_dependency(tx_version.tx_idx, blocking_tx_idx) {
                return try_execute(mv_memory, vm, scheduler, execution_error, execution_results, metrics, tx_version);
            }
            None
        }
        VmExecutionResult::ExecutionError(source) => {
            let _ = execution_error.set((tx_version.tx_idx, source));
            None
        }
        VmExecutionResult::Ok { execution_result, read_set, write_set, .. } => {
            *index_mutex!(execution_results, tx_version.tx_idx) = Some(execution_result);
            let wrote_new_location = mv_memory.record(&tx_version, read_set, write_set);
            if tx_version.tx_incarnation > 0 {
                metrics.record_retry(tx_version.tx_idx);
            }
            scheduler.finish_execution(tx_version, wrote_new_location)
        }
    }
}

fn try_validate(mv_memory: &MvMemory, scheduler: &Scheduler, tx_version: &TxVersion) -> Option<ExecutionTask> {
    let read_set_valid = mv_memory.validate_read_set(tx_version.tx_idx);
    let aborted = !read_set_valid && scheduler.try_validation_abort(tx_version);
    if aborted {
        mv_memory.convert_writes_to_estimates(tx_version.tx_idx);
    }
    scheduler.finish_validation(tx_version, aborted)
}

/// Build the dependency graph and initial scheduler state for a block,
/// or `None` to signal the caller should fall back to sequential
/// execution because too many transactions would conflict anyway.
fn preprocess_dependencies(beneficiary: &Address, txs: &[TxEnv]) -> Option<(Scheduler, NonZeroUsize)> {
    let block_size = txs.len();
    let mut transactions_status: TransactionsStatus =
        (0..block_size).map(|_| TxStatus { incarnation: 0, status: IncarnationStatus::ReadyToExecute }).collect();
    let mut transactions_dependents: TransactionsDependents = (0..block_size).map(|_| Vec::new()).collect();
    let mut transactions_dependencies: TransactionsDependencies = AHashMap::new();
    let mut seen_dependents: Vec<AHashSet<TxIdx>> = (0..block_size).map(|_| AHashSet::new()).collect();

    let mut tx_idxs_by_address: AHashMap<Address, Vec<TxIdx>> = AHashMap::new();
    let mut starting_validation_idx = block_size;

    for (tx_idx, tx) in txs.iter().enumerate() {
        if starting_validation_idx == block_size && tx_idx > 0 && !tx.data.is_empty() {
            starting_validation_idx = tx_idx;
        }

        let mut recipient_with_changed_balance = None;
        if let TransactTo::Call(to) = tx.transact_to {
            if tx.value != U256::ZERO {
                recipient_with_changed_balance = Some(to);
            }
        }

        if tx_idx > 0 {
            let mut register_dependency = |dependency_idx: usize| {
                if seen_dependents[dependency_idx].insert(tx_idx) {
                    transactions_status[tx_idx].status = IncarnationStatus::Aborting;
                    transactions_dependents[dependency_idx].push(tx_idx);
                    transactions_dependencies.entry(tx_idx).or_default().push(dependency_idx);
                }
            };

            if &tx.caller == beneficiary || recipient_with_changed_balance.is_some_and(|to| &to == beneficiary) {
                register_dependency(tx_idx - 1);
            } else {
                if let Some(prev_idx) = tx_idxs_by_address.get(&tx.caller).and_then(|idxs| idxs.last()) {
                    register_dependency(*prev_idx);
                }
                if let Some(to) = recipient_with_changed_balance {
                    if let Some(prev_idx) = tx_idxs_by_address.get(&to).and_then(|idxs| idxs.last()) {
                        register_dependency(*prev_idx);
                    }
                }
            }

            if transactions_dependencies.len() as f64 / block_size as f64 > 0.9 {
                return None;
            }
        }

        tx_idxs_by_address.entry(tx.caller).or_default().push(tx_idx);
        if let Some(to) = recipient_with_changed_balance {
            tx_idxs_by_address.entry(to).or_default().push(tx_idx);
        }
    }

    let min_concurrency = NonZeroUsize::new(2).unwrap();
    let max_concurrency = NonZeroUsize::new(block_size / 2).unwrap_or(min_concurrency).max(min_concurrency);

    Some((
        Scheduler::new(block_size, transactions_status, transactions_dependents, transactions_dependencies, starting_validation_idx),
        max_concurrency,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_reward_is_gated_by_revision() {
        assert_eq!(block_reward_wei(SpecId::FRONTIER), Some(U256::from(5_000_000_000_000_000_000u128)));
        assert_eq!(block_reward_wei(SpecId::BYZANTIUM), Some(U256::from(3_000_000_000_000_000_000u128)));
        assert_eq!(block_reward_wei(SpecId::CONSTANTINOPLE), Some(U256::from(2_000_000_000_000_000_000u128)));
        assert_eq!(block_reward_wei(SpecId::MERGE), None);
    }

    #[test]
    fn empty_block_produces_no_receipts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(
            crate::storage_pool::StoragePool::open(&crate::storage_pool::PoolConfig {
                path: dir.path().join("pool.dat"),
                chunk_capacity: 1 << 20,
                sequential_chunk_count: 12,
                mode: crate::storage_pool::OpenMode::CreateIfNeeded,
            })
            .unwrap(),
        );
        let state_db = StateDb {
            accounts: crate::mpt::Mpt::open(pool.clone(), 16),
            storage: crate::mpt::Mpt::open(pool.clone(), 16),
            code: crate::mpt::Mpt::open(pool.clone(), 16),
            receipts: crate::mpt::Mpt::open(pool, 16),
        };
        state_db.accounts.commit(0, crate::chunk::INVALID_OFFSET).unwrap();
        state_db.storage.commit(0, crate::chunk::INVALID_OFFSET).unwrap();
        state_db.code.commit(0, crate::chunk::INVALID_OFFSET).unwrap();

        let mut header = alloy_rpc_types::Header::default();
        header.number = 20_000_000;
        header.gas_limit = 30_000_000;
        let block = Block::<Transaction> { header, transactions: alloy_rpc_types::BlockTransactions::Full(Vec::new()), ..Default::default() };

        let config = ExecutorConfig::default();
        let metrics = crate::metrics::NoopMetrics;
        let result = execute_block(
            &state_db,
            0,
            (crate::chunk::INVALID_OFFSET, crate::chunk::INVALID_OFFSET, crate::chunk::INVALID_OFFSET),
            1,
            &block,
            &config,
            &metrics,
        )
        .unwrap();
        assert!(result.receipts.is_empty());
        assert_eq!(result.gas_used, 0);
    }
}
