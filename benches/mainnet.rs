//! Benchmark a synthetic block of plain-transfer transactions through
//! `execute_block`, sequential vs. parallel.

#![allow(missing_docs)]

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use alloy_primitives::{Address, U256};
use alloy_rpc_types::{Block, BlockTransactions, Header, Transaction};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use evm_core::metrics::NoopMetrics;
use evm_core::state_db::StateDb;
use evm_core::storage_pool::{OpenMode, PoolConfig, StoragePool};
use evm_core::{chunk::INVALID_OFFSET, execute_block, ExecutorConfig};

fn state_db(dir: &tempfile::TempDir) -> StateDb {
    let pool = Arc::new(
        StoragePool::open(&PoolConfig {
            path: dir.path().join("pool.dat"),
            chunk_capacity: 1 << 20,
            sequential_chunk_count: 16,
            mode: OpenMode::CreateIfNeeded,
        })
        .unwrap(),
    );
    let db = StateDb {
        accounts: evm_core::mpt::Mpt::open(pool.clone(), 16),
        storage: evm_core::mpt::Mpt::open(pool.clone(), 16),
        code: evm_core::mpt::Mpt::open(pool.clone(), 16),
        receipts: evm_core::mpt::Mpt::open(pool, 16),
    };
    db.accounts.commit(0, INVALID_OFFSET).unwrap();
    db.storage.commit(0, INVALID_OFFSET).unwrap();
    db.code.commit(0, INVALID_OFFSET).unwrap();
    db
}

fn transfer_block(tx_count: u64) -> Block<Transaction> {
    let recipient = Address::left_padding_from(&[0xFFu8]);
    let transactions: Vec<Transaction> = (0..tx_count)
        .map(|i| Transaction {
            from: Address::left_padding_from(&i.to_be_bytes()),
            to: Some(recipient),
            value: U256::from(1u64),
            gas: 21_000,
            gas_price: Some(1_000_000_000),
            nonce: 0,
            ..Default::default()
        })
        .collect();

    let mut header = Header::default();
    header.number = 20_000_000;
    header.gas_limit = 30_000_000;
    header.gas_used = 21_000 * tx_count;
    Block { header, transactions: BlockTransactions::Full(transactions), ..Default::default() }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let concurrency_level = thread::available_parallelism().unwrap_or(NonZeroUsize::MIN).min(NonZeroUsize::new(8).unwrap());

    let mut group = c.benchmark_group("execute_block (independent transfers)");
    for tx_count in [64u64, 512] {
        let block = transfer_block(tx_count);
        group.bench_function(format!("{tx_count} txs sequential"), |b| {
            let dir = tempfile::tempdir().unwrap();
            let db = state_db(&dir);
            let config = ExecutorConfig { concurrency_level, force_sequential: true, ..Default::default() };
            let mut version = 1u64;
            b.iter(|| {
                // Never commit the new roots, so every iteration upserts
                // from the same genesis state (version 0) rather than
                // growing the trie across iterations.
                let result =
                    execute_block(&db, 0, (INVALID_OFFSET, INVALID_OFFSET, INVALID_OFFSET), version, black_box(&block), &config, &NoopMetrics).unwrap();
                version += 1;
                black_box(result)
            });
        });
        group.bench_function(format!("{tx_count} txs parallel"), |b| {
            let dir = tempfile::tempdir().unwrap();
            let db = state_db(&dir);
            let config = ExecutorConfig { concurrency_level, force_sequential: false, ..Default::default() };
            let mut version = 1u64;
            b.iter(|| {
                let result =
                    execute_block(&db, 0, (INVALID_OFFSET, INVALID_OFFSET, INVALID_OFFSET), version, black_box(&block), &config, &NoopMetrics).unwrap();
                version += 1;
                black_box(result)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
