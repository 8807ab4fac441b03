//! Throughput of the node writer's append path and its underlying pool.

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use evm_core::chunk::ChunkList;
use evm_core::node_writer::NodeWriter;
use evm_core::storage_pool::{OpenMode, PoolConfig, StoragePool};

fn pool(dir: &tempfile::TempDir) -> Arc<StoragePool> {
    Arc::new(
        StoragePool::open(&PoolConfig {
            path: dir.path().join("pool.dat"),
            chunk_capacity: 1 << 20,
            sequential_chunk_count: 16,
            mode: OpenMode::CreateIfNeeded,
        })
        .unwrap(),
    )
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("NodeWriter::write_record");
    for record_len in [32usize, 256, 4096] {
        group.bench_function(format!("{record_len} bytes"), |b| {
            let dir = tempfile::tempdir().unwrap();
            let writer = NodeWriter::new(ChunkList::Fast, pool(&dir));
            let record = vec![0xABu8; record_len];
            b.iter(|| black_box(writer.write_record(black_box(record.clone())).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
