//! The Block-STM scheduler: hands out execution and validation tasks to
//! worker threads in roughly transaction order, tracks per-transaction
//! incarnation state, and propagates aborts to dependents. Not present in
//! the retrieved sources (the crate this was learned from references it
//! from `executor.rs` without shipping the file); rebuilt here against the
//! BlockSTM paper's state machine and the task-result contract that
//! `executor.rs`'s worker loop expects.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{
    ExecutionTask, IncarnationStatus, Task, TransactionsDependencies, TransactionsDependents, TransactionsStatus,
    TxIdx, TxStatus, TxVersion, ValidationTask,
};

/// Coordinates execution and validation tasks across worker threads for
/// one block. A transaction progresses through incarnations:
/// `ReadyToExecute(i) -> Executing(i) -> Executed(i) -> Validated(i)`, or
/// `Executed/Validated(i) -> Aborting(i) -> ReadyToExecute(i+1)` when a
/// validation fails or a dependency blocks it mid-execution.
pub(crate) struct Scheduler {
    block_size: usize,
    // Guards the whole status vector: `finish_execution`,
    // `try_validation_abort`, and `finish_validation` each need to
    // observe and mutate a status entry as one atomic step relative to
    // concurrent validators of the same incarnation.
    transactions_status: Mutex<TransactionsStatus>,
    transactions_dependents: Vec<Mutex<Vec<TxIdx>>>,
    transactions_dependencies: Mutex<TransactionsDependencies>,
    // The next transaction index to hand out for execution.
    execution_idx: AtomicUsize,
    // The next transaction index to hand out for validation.
    validation_idx: AtomicUsize,
    // Once a dependency is satisfied, a re-execution (or first-time
    // validation) may be needed starting at this transaction index. Set
    // once by the caller via `preprocess_dependencies`, then decreases
    // monotonically as aborts push it down.
    num_finished: AtomicUsize,
}

impl Scheduler {
    pub(crate) fn new(
        block_size: usize,
        transactions_status: TransactionsStatus,
        transactions_dependents: TransactionsDependents,
        transactions_dependencies: TransactionsDependencies,
        starting_validation_idx: TxIdx,
    ) -> Self {
        Self {
            block_size,
            transactions_status: Mutex::new(transactions_status),
            transactions_dependents: transactions_dependents.into_iter().map(Mutex::new).collect(),
            transactions_dependencies: Mutex::new(transactions_dependencies),
            execution_idx: AtomicUsize::new(0),
            validation_idx: AtomicUsize::new(starting_validation_idx.min(block_size)),
            num_finished: AtomicUsize::new(0),
        }
    }

    /// Whether every transaction in the block has reached `Validated`.
    pub(crate) fn done(&self) -> bool {
        self.num_finished.load(Ordering::Acquire) >= self.block_size
    }

    /// Hand out the next execution or validation task, preferring
    /// whichever index is lower (BlockSTM commits in order, so progress
    /// on low-indexed transactions unblocks the most dependents).
    pub(crate) fn next_task(&self) -> Option<Task> {
        let exec_idx = self.execution_idx.load(Ordering::Acquire);
        let val_idx = self.validation_idx.load(Ordering::Acquire);
        if exec_idx < self.block_size && exec_idx <= val_idx {
            if let Some(task) = self.try_incarnate(exec_idx) {
                self.execution_idx.fetch_add(1, Ordering::AcqRel);
                return Some(Task::Execution(task));
            }
        }
        if val_idx < self.block_size {
            let status = self.transactions_status.lock();
            let entry = &status[val_idx];
            if matches!(entry.status, IncarnationStatus::Executed) {
                let task = TxVersion { tx_idx: val_idx, tx_incarnation: entry.incarnation };
                drop(status);
                self.validation_idx.fetch_add(1, Ordering::AcqRel);
                return Some(Task::Validation(task));
            }
        }
        None
    }

    fn try_incarnate(&self, tx_idx: TxIdx) -> Option<ExecutionTask> {
        let mut status = self.transactions_status.lock();
        let entry = &mut status[tx_idx];
        if matches!(entry.status, IncarnationStatus::ReadyToExecute) {
            entry.status = IncarnationStatus::Executing;
            Some(TxVersion { tx_idx, tx_incarnation: entry.incarnation })
        } else {
            None
        }
    }

    /// Record that `tx_idx` is blocked on `blocking_idx` mid-execution.
    /// Returns `false` (and leaves the transaction ready to retry
    /// immediately) if the blocking transaction already finished its
    /// next incarnation by the time we try to register the dependency.
    pub(crate) fn add_dependency(&self, tx_idx: TxIdx, blocking_idx: TxIdx) -> bool {
        let mut status = self.transactions_status.lock();
        let mut dependents = self.transactions_dependents[blocking_idx].lock();
        // The blocking transaction may have finished and cleared its
        // dependents between us reading its status and acquiring this
        // lock; re-check under the lock.
        if matches!(status[blocking_idx].status, IncarnationStatus::Executed | IncarnationStatus::Validated) {
            return false;
        }
        status[tx_idx].status = IncarnationStatus::Aborting;
        dependents.push(tx_idx);
        true
    }

    /// Finish an execution, recording whether it wrote to any memory
    /// location the previous incarnation of the same transaction did
    /// not. Returns a validation task for this transaction when one is
    /// needed: always when this is the first incarnation's completion,
    /// and again whenever the rewritten location changed.
    pub(crate) fn finish_execution(&self, tx_version: TxVersion, wrote_new_location: bool) -> Option<ValidationTask> {
        {
            let mut status = self.transactions_status.lock();
            status[tx_version.tx_idx].status = IncarnationStatus::Executed;
        }
        if wrote_new_location {
            // A write landed on a location this incarnation did not
            // previously own: every higher transaction may have read a
            // stale value, so re-validate from here on.
            self.validation_idx.fetch_min(tx_version.tx_idx, Ordering::AcqRel);
        }
        Some(tx_version)
    }

    /// Attempt to abort `tx_version` for a failed validation. Only the
    /// first caller to observe this exact incarnation still in
    /// `Executed`/`Validated` succeeds; concurrent validators of the
    /// same (already-superseded) incarnation are no-ops.
    pub(crate) fn try_validation_abort(&self, tx_version: &TxVersion) -> bool {
        let mut status = self.transactions_status.lock();
        let entry = &mut status[tx_version.tx_idx];
        if entry.incarnation == tx_version.tx_incarnation
            && matches!(entry.status, IncarnationStatus::Executed | IncarnationStatus::Validated)
        {
            entry.status = IncarnationStatus::Aborting;
            true
        } else {
            false
        }
    }

    /// Resolve an aborted or successfully validated incarnation. If
    /// `aborted`, bump the incarnation and requeue for execution once
    /// any threads racing on the old incarnation have observed the
    /// abort; otherwise mark it validated and, if it's the last
    /// transaction to reach that state, advance `num_finished`.
    pub(crate) fn finish_validation(&self, tx_version: &TxVersion, aborted: bool) -> Option<ExecutionTask> {
        if aborted {
            let next = {
                let mut status = self.transactions_status.lock();
                let entry = &mut status[tx_version.tx_idx];
                entry.incarnation += 1;
                entry.status = IncarnationStatus::ReadyToExecute;
                TxVersion { tx_idx: tx_version.tx_idx, tx_incarnation: entry.incarnation }
            };
            self.execution_idx.fetch_min(tx_version.tx_idx, Ordering::AcqRel);
            self.resume_dependents(tx_version.tx_idx);
            Some(next)
        } else {
            let became_validated = {
                let mut status = self.transactions_status.lock();
                let entry = &mut status[tx_version.tx_idx];
                if entry.incarnation == tx_version.tx_incarnation && matches!(entry.status, IncarnationStatus::Executed)
                {
                    entry.status = IncarnationStatus::Validated;
                    true
                } else {
                    false
                }
            };
            if became_validated {
                self.num_finished.fetch_add(1, Ordering::AcqRel);
            }
            None
        }
    }

    /// Wake every transaction blocked on `tx_idx`, resetting them to
    /// `ReadyToExecute` and re-lowering the execution cursor so their
    /// retry is actually picked up.
    fn resume_dependents(&self, tx_idx: TxIdx) {
        let dependents: Vec<TxIdx> = std::mem::take(&mut *self.transactions_dependents[tx_idx].lock());
        if dependents.is_empty() {
            return;
        }
        let mut status = self.transactions_status.lock();
        let mut min_idx = self.block_size;
        for dependent in dependents {
            status[dependent].status = IncarnationStatus::ReadyToExecute;
            min_idx = min_idx.min(dependent);
        }
        drop(status);
        self.execution_idx.fetch_min(min_idx, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;

    fn fresh(block_size: usize) -> Scheduler {
        let status = (0..block_size).map(|_| TxStatus { incarnation: 0, status: IncarnationStatus::ReadyToExecute }).collect();
        let dependents = (0..block_size).map(|_| Vec::new()).collect();
        Scheduler::new(block_size, status, dependents, AHashMap::new(), block_size)
    }

    #[test]
    fn hands_out_all_executions_once() {
        let scheduler = fresh(4);
        let mut seen = Vec::new();
        while let Some(Task::Execution(v)) = scheduler.next_task() {
            seen.push(v.tx_idx);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn dependency_blocks_then_resumes() {
        let scheduler = fresh(2);
        assert!(scheduler.add_dependency(1, 0));
        let tx0 = TxVersion { tx_idx: 0, tx_incarnation: 0 };
        scheduler.finish_execution(tx0.clone(), true);
        assert!(scheduler.finish_validation(&tx0, false).is_none());
        // tx 1 should now be ready again since its dependency finished.
        let status = scheduler.transactions_status.lock();
        assert_eq!(status[1].status, IncarnationStatus::ReadyToExecute);
    }

    #[test]
    fn failed_validation_bumps_incarnation() {
        let scheduler = fresh(1);
        let tx0 = TxVersion { tx_idx: 0, tx_incarnation: 0 };
        scheduler.finish_execution(tx0.clone(), true);
        assert!(scheduler.try_validation_abort(&tx0));
        let next = scheduler.finish_validation(&tx0, true).unwrap();
        assert_eq!(next.tx_incarnation, 1);
    }
}
