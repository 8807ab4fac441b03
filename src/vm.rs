//! EVM host glue: a `revm::Database` implementation that intercepts reads
//! through the multi-version memory map before falling back to the
//! committed [`StateDb`] at the block's base version, plus the
//! transaction-level wrapper ([`Vm`]) that turns one `TxEnv` into a
//! [`VmExecutionResult`] the scheduler's worker loop can act on. Adapted
//! from the teacher's own `vm.rs`, generalized from a generic
//! `Storage`/`MemoryLocationHash` pair to read directly through
//! [`StateDb`], and extended to track EIP-2929 access-log warmth
//! alongside the Block-STM read set.

use std::sync::atomic::{AtomicU8, Ordering};

use alloy_primitives::{Address, B256, U256};
use revm::{
    primitives::{
        AccountInfo, Bytecode, CfgEnv, EVMError, Env, ExecutionResult, InvalidTransaction, ResultAndState, SpecId,
        TransactTo, TxEnv,
    },
    Context, Database, Evm, EvmContext, Handler,
};

use crate::mv_memory::{MvMemory, ReadMemoryResult};
use crate::state_db::{AccessLog, AccessedLocation, StateDb};
use crate::{MemoryLocation, MemoryValue, ReadError, ReadOrigin, ReadSet, TxIdx, WriteSet};

/// The execution error surfaced from the underlying EVM executor.
pub type ExecutionError = EVMError<ReadError>;

/// The state transitions of one transaction's execution: `None` marks an
/// account for removal (`SELFDESTRUCT`, or emptied post-Spurious-Dragon).
pub(crate) type EvmStateTransitions = ahash::AHashMap<Address, Option<EvmAccountDelta>>;

/// A touched account's post-execution basic fields plus changed storage
/// slots, independent of any particular state-DB representation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvmAccountDelta {
    /// Updated nonce/balance/code hash.
    pub info: AccountInfo,
    /// Slots this transaction changed, by final value.
    pub changed_storage: Vec<(U256, U256)>,
}

/// Execution result of one transaction, independent of any particular
/// receipt encoding — `executor.rs` folds this into an RLP receipt and a
/// `StateDb` write set.
#[derive(Debug, Clone, PartialEq)]
pub struct PevmTxExecutionResult {
    /// Whether the transaction succeeded.
    pub success: bool,
    /// Gas used by this transaction alone (not cumulative).
    pub gas_used: u64,
    /// Logs emitted.
    pub logs: Vec<revm::primitives::Log>,
    /// Per-account state deltas.
    pub state: EvmStateTransitions,
}

impl PevmTxExecutionResult {
    /// Build a result from a raw REVM `ResultAndState`, dropping
    /// untouched accounts and mapping selfdestructed/EIP-161-emptied
    /// accounts to removal.
    pub fn from_revm(spec_id: SpecId, ResultAndState { result, state }: ResultAndState) -> Self {
        Self {
            success: result.is_success(),
            gas_used: result.gas_used(),
            logs: result.logs().to_vec(),
            state: state
                .into_iter()
                .filter(|(_, account)| account.is_touched())
                .map(|(address, account)| {
                    if account.is_selfdestructed() || (account.is_empty() && spec_id.is_enabled_in(SpecId::SPURIOUS_DRAGON)) {
                        (address, None)
                    } else {
                        let changed_storage =
                            account.changed_storage_slots().map(|(slot, value)| (*slot, value.present_value)).collect();
                        (address, Some(EvmAccountDelta { info: account.info.clone(), changed_storage }))
                    }
                })
                .collect(),
        }
    }
}

pub(crate) enum VmExecutionResult {
    ReadError { blocking_tx_idx: TxIdx },
    ExecutionError(ExecutionError),
    Ok {
        execution_result: PevmTxExecutionResult,
        read_set: ReadSet,
        write_set: WriteSet,
        // Whether this incarnation read only its own sender/recipient
        // accounts; lets the scheduler's dependency preprocessing treat
        // it as self-contained instead of conservatively chaining it to
        // every other transaction touching the same accounts.
        read_only_from_and_to: bool,
    },
}

// Different chains may have varying reward policies; only the Ethereum
// mainnet one is implemented, matching spec.md's scope.
enum RewardPolicy {
    Ethereum,
}

/// A `revm::Database` that intercepts reads while executing one
/// transaction: values come from the multi-version data structure first,
/// the committed [`StateDb`] (at the block's base version) otherwise. It
/// records every location it reads into a Block-STM read set and tracks
/// EIP-2929 warm/cold state as a side effect, matching ordinary EVM gas
/// accounting even though the gas itself is computed by `revm`.
struct VmDb<'a> {
    vm: &'a Vm<'a>,
    tx_idx: TxIdx,
    from: Address,
    to: Option<Address>,
    is_maybe_lazy: bool,
    read_set: ReadSet,
    access_log: AccessLog,
    // Whether this transaction has read anything other than its sender
    // and recipient accounts; if so every higher transaction must
    // re-validate from here.
    only_read_from_and_to: bool,
}

impl<'a> VmDb<'a> {
    fn new(vm: &'a Vm<'a>, tx_idx: TxIdx, from: Address, to: Option<Address>, is_maybe_lazy: bool) -> Self {
        Self { vm, tx_idx, from, to, is_maybe_lazy, only_read_from_and_to: true, read_set: ReadSet::new(), access_log: AccessLog::default() }
    }
}

impl<'a> Database for VmDb<'a> {
    type Error = ReadError;

    // The pinned REVM fork adds `is_preload` so the host can skip
    // unnecessary account materialization during REVM's internal warm-up
    // pass; we only return full accounts on explicit usage.
    fn basic(&mut self, address: Address, is_preload: bool) -> Result<Option<AccountInfo>, Self::Error> {
        if is_preload {
            return Ok(None);
        }

        // Skip full evaluation for a plain-transfer recipient with no
        // code until lazy sender/recipient balance updates land; a mock
        // non-empty account avoids misclassifying it for destruction.
        if self.is_maybe_lazy && Some(address) == self.to && !self.vm.is_contract(address)? {
            return Ok(Some(AccountInfo { nonce: 1, ..Default::default() }));
        }

        if address != self.from && Some(address) != self.to {
            self.only_read_from_and_to = false;
        }
        self.access_log.touch(AccessedLocation::Account(address));

        let location = MemoryLocation::Basic(address);
        let mut final_account = None;
        let mut balance_addition = U256::ZERO;

        if self.tx_idx > 0 {
            let need_consecutive = address == self.vm.beneficiary;
            let reschedule = Err(ReadError::BlockingIndex(self.tx_idx - 1));
            let mut current_idx = self.tx_idx;
            loop {
                match self.vm.mv_memory.read(&location, current_idx) {
                    ReadMemoryResult::ReadError { blocking_tx_idx } => {
                        return if need_consecutive { reschedule } else { Err(ReadError::BlockingIndex(blocking_tx_idx)) };
                    }
                    ReadMemoryResult::Ok { version, value } => {
                        if need_consecutive && version.tx_idx != current_idx - 1 {
                            return reschedule;
                        }
                        self.read_set.push((location.clone(), ReadOrigin::MvMemory(version.clone())));
                        match value {
                            MemoryValue::Basic(info) => {
                                let mut info = *info;
                                info.balance += balance_addition;
                                final_account = Some(info);
                                break;
                            }
                            MemoryValue::LazyBeneficiaryBalance(addition) => {
                                balance_addition += addition;
                                current_idx = version.tx_idx;
                            }
                            _ => return Err(ReadError::InvalidMemoryLocationType),
                        }
                    }
                    ReadMemoryResult::NotFound => {
                        if need_consecutive && current_idx > 0 {
                            return reschedule;
                        }
                        break;
                    }
                }
            }
        }

        if final_account.is_none() {
            self.read_set.push((location, ReadOrigin::Storage));
            final_account = self
                .vm
                .base_db
                .get_account(self.vm.base_version, address)
                .map_err(|e| ReadError::StorageError(format!("{e:?}")))?
                .map(|account| {
                    let mut info =
                        AccountInfo { nonce: account.nonce, balance: account.balance, code_hash: account.code_hash, code: None };
                    info.balance += balance_addition;
                    info
                })
                .or_else(|| (balance_addition > U256::ZERO).then(|| AccountInfo { balance: balance_addition, ..Default::default() }));
        }

        Ok(final_account)
    }

    fn code_by_hash(&mut self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        self.access_log.touch(AccessedLocation::Code(code_hash));
        self.vm
            .base_db
            .get_code(self.vm.base_version, code_hash)
            .map(|code| code.map(Bytecode::new_raw).unwrap_or_default())
            .map_err(|e| ReadError::StorageError(format!("{e:?}")))
    }

    fn has_storage(&mut self, _address: Address) -> Result<bool, Self::Error> {
        // The state DB doesn't maintain a per-account "has any storage"
        // flag independent of the per-slot table itself.
        Ok(true)
    }

    fn storage(&mut self, address: Address, index: U256) -> Result<U256, Self::Error> {
        self.only_read_from_and_to = false;
        self.access_log.touch(AccessedLocation::Storage(address, index));
        let location = MemoryLocation::Storage(address, index);

        if self.tx_idx > 0 {
            match self.vm.mv_memory.read(&location, self.tx_idx) {
                ReadMemoryResult::Ok { version, value: MemoryValue::Storage(value) } => {
                    self.read_set.push((location, ReadOrigin::MvMemory(version)));
                    return Ok(value);
                }
                ReadMemoryResult::Ok { .. } => return Err(ReadError::InvalidMemoryLocationType),
                ReadMemoryResult::ReadError { blocking_tx_idx } => return Err(ReadError::BlockingIndex(blocking_tx_idx)),
                ReadMemoryResult::NotFound => {}
            }
        }

        self.read_set.push((location, ReadOrigin::Storage));
        self.vm
            .base_db
            .get_storage(self.vm.base_version, address, index)
            .map_err(|e| ReadError::StorageError(format!("{e:?}")))
    }

    fn block_hash(&mut self, number: U256) -> Result<B256, Self::Error> {
        // BLOCKHASH reaches back into already-finalized history, which
        // lives in the MPT's version map rather than this block's
        // speculative state; cross-block history beyond the revision
        // enum is out of scope for the core executor per spec.md, so an
        // unavailable ancestor reads as the zero hash like REVM's own
        // "older than 256 blocks" fallback.
        let _ = number;
        Ok(B256::ZERO)
    }
}

/// One block's worth of shared, read-only execution context: the
/// multi-version memory map, the block env, and the transactions
/// themselves. `Vm::execute` runs one transaction's incarnation against
/// this context without mutating anything outside `mv_memory`.
pub(crate) struct Vm<'a> {
    base_db: &'a StateDb,
    base_version: u64,
    mv_memory: &'a MvMemory,
    spec_id: SpecId,
    block_env: revm::primitives::BlockEnv,
    beneficiary: Address,
    reward_policy: RewardPolicy,
    txs: Vec<TxEnv>,
    // Fatal-but-retryable errors (e.g. a sender temporarily
    // underfunded because an earlier internal transfer hasn't landed
    // yet) get one retry before being surfaced for real.
    retried_tx: Vec<AtomicU8>,
}

impl<'a> Vm<'a> {
    pub(crate) fn new(
        base_db: &'a StateDb,
        base_version: u64,
        mv_memory: &'a MvMemory,
        spec_id: SpecId,
        block_env: revm::primitives::BlockEnv,
        txs: Vec<TxEnv>,
    ) -> Self {
        let beneficiary = block_env.coinbase;
        Self {
            base_db,
            base_version,
            mv_memory,
            spec_id,
            block_env,
            beneficiary,
            reward_policy: RewardPolicy::Ethereum,
            retried_tx: (0..txs.len().saturating_sub(1)).map(|_| AtomicU8::new(0)).collect(),
            txs,
        }
    }

    fn is_contract(&self, address: Address) -> Result<bool, ReadError> {
        Ok(self
            .base_db
            .get_account(self.base_version, address)
            .map_err(|e| ReadError::StorageError(format!("{e:?}")))?
            .is_some_and(|a| a.code_hash != revm::primitives::KECCAK_EMPTY))
    }

    /// Execute the next incarnation of transaction `tx_idx`. This may
    /// only read from `mv_memory`/`base_db`, never mutate either; the
    /// caller applies the returned write set on success.
    pub(crate) fn execute(&self, tx_idx: TxIdx) -> VmExecutionResult {
        let tx = &self.txs[tx_idx];
        let from = tx.caller;
        let (is_create_tx, to) = match tx.transact_to {
            TransactTo::Call(address) => (false, Some(address)),
            TransactTo::Create => (true, None),
        };
        let is_maybe_lazy = !is_create_tx && tx.data.is_empty() && Some(from) != to;

        let mut db = VmDb::new(self, tx_idx, from, to, is_maybe_lazy);
        match execute_tx(&mut db, self.spec_id, self.block_env.clone(), tx.clone(), false) {
            Ok(result_and_state) => {
                if matches!(result_and_state.result, ExecutionResult::Revert { .. })
                    && tx_idx > 0
                    && unsafe { self.retried_tx.get_unchecked(tx_idx - 1) }.fetch_add(1, Ordering::Relaxed) < 1
                {
                    return VmExecutionResult::ReadError { blocking_tx_idx: tx_idx - 1 };
                }

                let mut write_set: WriteSet = Vec::with_capacity(3);
                for (address, account) in result_and_state.state.iter() {
                    if account.is_selfdestructed() {
                        write_set.push((MemoryLocation::Basic(*address), MemoryValue::Basic(Box::default())));
                        continue;
                    }
                    if account.is_touched() {
                        if is_maybe_lazy && Some(*address) == to && account.info.code_hash == revm::primitives::KECCAK_EMPTY {
                            write_set.push((MemoryLocation::Basic(*address), MemoryValue::LazyBeneficiaryBalance(tx.value)));
                        } else {
                            write_set.push((MemoryLocation::Basic(*address), MemoryValue::Basic(Box::new(account.info.clone()))));
                        }
                        if let Some(code) = account.info.code.clone() {
                            write_set.push((MemoryLocation::Code(*address), MemoryValue::Code(code)));
                        }
                    }
                    for (slot, value) in account.changed_storage_slots() {
                        write_set.push((MemoryLocation::Storage(*address, *slot), MemoryValue::Storage(value.present_value)));
                    }
                }

                self.apply_rewards(&mut write_set, tx, U256::from(result_and_state.result.gas_used()));

                VmExecutionResult::Ok {
                    execution_result: PevmTxExecutionResult::from_revm(self.spec_id, result_and_state),
                    read_set: db.read_set,
                    write_set,
                    read_only_from_and_to: db.only_read_from_and_to,
                }
            }
            Err(EVMError::Database(ReadError::BlockingIndex(blocking_tx_idx))) => VmExecutionResult::ReadError { blocking_tx_idx },
            Err(err) => {
                if matches!(err, EVMError::Transaction(InvalidTransaction::LackOfFundForMaxFee { .. }))
                    && tx_idx > 0
                    && unsafe { self.retried_tx.get_unchecked(tx_idx - 1) }.fetch_add(1, Ordering::Relaxed) < 1
                {
                    VmExecutionResult::ReadError { blocking_tx_idx: tx_idx - 1 }
                } else {
                    VmExecutionResult::ExecutionError(err)
                }
            }
        }
    }

    // Apply rewards (balance increments) to beneficiary accounts.
    fn apply_rewards(&self, write_set: &mut WriteSet, tx: &TxEnv, gas_used: U256) {
        let amount = match self.reward_policy {
            RewardPolicy::Ethereum => {
                let mut gas_price = match tx.gas_priority_fee {
                    Some(priority_fee) => std::cmp::min(tx.gas_price, priority_fee + self.block_env.basefee),
                    None => tx.gas_price,
                };
                if self.spec_id.is_enabled_in(SpecId::LONDON) {
                    gas_price = gas_price.saturating_sub(self.block_env.basefee);
                }
                gas_price * gas_used
            }
        };

        let location = MemoryLocation::Basic(self.beneficiary);
        if let Some((_, value)) = write_set.iter_mut().find(|(l, _)| l == &location) {
            match value {
                MemoryValue::Basic(info) => info.balance += amount,
                MemoryValue::LazyBeneficiaryBalance(addition) => *addition += amount,
                _ => unreachable!("beneficiary write set entries are always account-shaped"),
            }
        } else {
            write_set.push((location, MemoryValue::LazyBeneficiaryBalance(amount)));
        }
    }
}

pub(crate) fn execute_tx<DB: Database>(
    db: DB,
    spec_id: SpecId,
    block_env: revm::primitives::BlockEnv,
    tx: TxEnv,
    with_reward_beneficiary: bool,
) -> Result<ResultAndState, EVMError<DB::Error>> {
    // Builds the context by hand rather than through REVM's builder,
    // which is noticeably slower due to extra indirection.
    let context = Context { evm: EvmContext::new_with_env(db, Env::boxed(CfgEnv::default(), block_env, tx)), external: () };
    let handler = Handler::mainnet_with_spec(spec_id, with_reward_beneficiary);
    Evm::new(context, handler).transact()
}
