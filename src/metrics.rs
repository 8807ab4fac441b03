//! An injected metrics sink. Kept as a plain trait object rather than a
//! concrete dependency on any particular metrics crate, so embedders can
//! wire this into Prometheus, StatsD, or their own in-process counters
//! without this crate taking an opinion.

use std::fmt::Debug;

use crate::chunk::ChunkList;

/// Observability hook for the executor and storage engine. Every method
/// has a no-op default so callers only need to override what they care
/// about.
pub trait MetricsRecorder: Send + Sync + Debug {
    /// A block finished executing and its deltas were flushed.
    fn record_block_executed(&self, block_number: u64, tx_count: usize, gas_used: u64) {
        let _ = (block_number, tx_count, gas_used);
    }

    /// A transaction incarnation above 0 finished, i.e. it was re-executed
    /// at least once due to a dependency abort.
    fn record_retry(&self, tx_idx: usize) {
        let _ = tx_idx;
    }

    /// A node writer rotated onto a fresh chunk from `list`.
    fn record_chunk_rotation(&self, list: ChunkList) {
        let _ = list;
    }
}

/// A [`MetricsRecorder`] that discards everything, for callers that don't
/// want observability wired up (tests, one-off tools).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {}
