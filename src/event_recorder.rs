//! Event Recorder (interface only): a lock-free single-producer ring that
//! the executor emits structured events (block start/end, transaction
//! start/end) through. Not present in the retrieved sources — rebuilt
//! here against the reserve/copy/publish protocol: reserve a sequence
//! number atomically, reserve payload bytes from a monotonically
//! advancing cursor, copy the payload, then publish the sequence number
//! via a release store. A consumer attaches by mapping the same backing
//! file and validates freshness against the `buffer_window_start`
//! watermark; this crate only implements the producer side, matching the
//! "consumers attach by mmap" framing — out-of-process attachment is
//! outside this crate's scope.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// One fixed-size (cacheline) descriptor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDescriptor {
    /// Monotonic sequence number, unique per recorder.
    pub sequence: u64,
    /// Caller-defined event kind (block start/end, tx start/end, ...).
    pub event_type: u16,
    /// Length in bytes of this event's payload.
    pub payload_len: u32,
    /// Record timestamp, nanoseconds since the epoch, supplied by the
    /// caller (this crate never reads the system clock itself).
    pub timestamp_ns: u64,
    /// Unwrapped offset into the payload ring at which this event's
    /// bytes begin; "unwrapped" means it only ever increases, the
    /// consumer wraps it by payload buffer length itself.
    pub payload_offset: u64,
    /// Four caller-defined words, e.g. a block number and tx index.
    pub user_words: [u64; 4],
}

/// `EventRecorder::open`'s parameters. The descriptor and payload ring
/// sizes are powers of two so wraparound is a cheap mask.
#[derive(Debug, Clone, Copy)]
pub struct EventRecorderConfig {
    /// `log2` of the descriptor ring's entry count. Must be in `[8, 32]`.
    pub descriptors_shift: u32,
    /// `log2` of the payload ring's byte capacity. Must be in `[16, 40]`.
    pub payload_buf_shift: u32,
}

impl Default for EventRecorderConfig {
    fn default() -> Self {
        Self { descriptors_shift: 16, payload_buf_shift: 27 }
    }
}

/// Errors opening or writing to an [`EventRecorder`].
#[derive(Debug, thiserror::Error)]
pub enum EventRecorderError {
    /// `descriptors_shift` fell outside `[8, 32]`.
    #[error("descriptors_shift {0} is out of range [8, 32]")]
    InvalidDescriptorsShift(u32),
    /// `payload_buf_shift` fell outside `[16, 40]`.
    #[error("payload_buf_shift {0} is out of range [16, 40]")]
    InvalidPayloadShift(u32),
    /// A single event's payload is larger than the whole ring, so it
    /// could never be read back even immediately after publishing.
    #[error("payload of {0} bytes exceeds the ring's capacity of {1} bytes")]
    PayloadTooLarge(usize, u64),
}

/// A single-producer event ring. The payload ring is logically doubled
/// (spec.md §6.1's "mapped twice consecutively") so a read spanning the
/// wrap boundary is contiguous; this in-process implementation instead
/// masks the write cursor and lets callers read via [`EventRecorder::read`],
/// which copies out a payload without ever observing a torn wrap.
#[derive(Debug)]
pub struct EventRecorder {
    descriptors: Vec<Mutex<Option<EventDescriptor>>>,
    descriptors_mask: u64,
    payload: Mutex<Vec<u8>>,
    payload_capacity: u64,
    next_sequence: AtomicU64,
    payload_cursor: AtomicU64,
    published_through: AtomicU64,
    buffer_window_start: AtomicU64,
}

impl EventRecorder {
    /// Allocate a fresh in-process recorder.
    pub fn open(config: EventRecorderConfig) -> Result<Self, EventRecorderError> {
        if !(8..=32).contains(&config.descriptors_shift) {
            return Err(EventRecorderError::InvalidDescriptorsShift(config.descriptors_shift));
        }
        if !(16..=40).contains(&config.payload_buf_shift) {
            return Err(EventRecorderError::InvalidPayloadShift(config.payload_buf_shift));
        }
        let descriptor_count = 1u64 << config.descriptors_shift;
        let payload_capacity = 1u64 << config.payload_buf_shift;
        Ok(Self {
            descriptors: (0..descriptor_count).map(|_| Mutex::new(None)).collect(),
            descriptors_mask: descriptor_count - 1,
            payload: Mutex::new(vec![0u8; payload_capacity as usize]),
            payload_capacity,
            next_sequence: AtomicU64::new(0),
            payload_cursor: AtomicU64::new(0),
            published_through: AtomicU64::new(0),
            buffer_window_start: AtomicU64::new(0),
        })
    }

    /// Reserve a sequence number and payload bytes, copy `payload` in,
    /// and publish. Returns the assigned sequence number.
    pub fn record(&self, event_type: u16, timestamp_ns: u64, user_words: [u64; 4], payload: &[u8]) -> Result<u64, EventRecorderError> {
        if payload.len() as u64 > self.payload_capacity {
            return Err(EventRecorderError::PayloadTooLarge(payload.len(), self.payload_capacity));
        }

        // Single producer: relaxed fetch-add is enough, there is no
        // concurrent writer to race with.
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let offset = self.payload_cursor.fetch_add(payload.len() as u64, Ordering::Relaxed);

        {
            let mut buffer = self.payload.lock();
            let start = (offset % self.payload_capacity) as usize;
            let end = start + payload.len();
            if end <= buffer.len() {
                buffer[start..end].copy_from_slice(payload);
            } else {
                let first = buffer.len() - start;
                buffer[start..].copy_from_slice(&payload[..first]);
                buffer[..payload.len() - first].copy_from_slice(&payload[first..]);
            }
        }

        let slot = (sequence & self.descriptors_mask) as usize;
        *self.descriptors[slot].lock() = Some(EventDescriptor {
            sequence,
            event_type,
            payload_len: payload.len() as u32,
            timestamp_ns,
            payload_offset: offset,
            user_words,
        });

        // Evict the descriptor ring's oldest live entry once this write
        // has wrapped onto it, advancing the watermark consumers use to
        // detect an overwritten payload.
        let descriptor_count = self.descriptors_mask + 1;
        if sequence >= descriptor_count {
            self.buffer_window_start.store(sequence - descriptor_count + 1, Ordering::Relaxed);
        }

        // Release store: any consumer that observes `sequence` via an
        // acquire load on `published_through` is guaranteed to see the
        // descriptor and payload bytes written above.
        self.published_through.store(sequence + 1, Ordering::Release);
        Ok(sequence)
    }

    /// Read back a published event by sequence number. Returns `None` if
    /// `sequence` was never published, or has since been evicted from the
    /// descriptor ring (its payload bytes may already be overwritten).
    pub fn read(&self, sequence: u64) -> Option<(EventDescriptor, Vec<u8>)> {
        if sequence >= self.published_through.load(Ordering::Acquire) {
            return None;
        }
        if sequence < self.buffer_window_start.load(Ordering::Relaxed) {
            return None;
        }
        let slot = (sequence & self.descriptors_mask) as usize;
        let descriptor = (*self.descriptors[slot].lock())?;
        if descriptor.sequence != sequence {
            return None;
        }
        let buffer = self.payload.lock();
        let start = (descriptor.payload_offset % self.payload_capacity) as usize;
        let len = descriptor.payload_len as usize;
        let mut payload = vec![0u8; len];
        let end = start + len;
        if end <= buffer.len() {
            payload.copy_from_slice(&buffer[start..end]);
        } else {
            let first = buffer.len() - start;
            payload[..first].copy_from_slice(&buffer[start..]);
            payload[first..].copy_from_slice(&buffer[..len - first]);
        }
        Some((descriptor, payload))
    }

    /// The earliest sequence number still guaranteed readable.
    pub fn buffer_window_start(&self) -> u64 {
        self.buffer_window_start.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_read_round_trips() {
        let recorder = EventRecorder::open(EventRecorderConfig { descriptors_shift: 8, payload_buf_shift: 16 }).unwrap();
        let seq = recorder.record(1, 42, [1, 2, 3, 4], b"block-start").unwrap();
        let (descriptor, payload) = recorder.read(seq).unwrap();
        assert_eq!(descriptor.event_type, 1);
        assert_eq!(descriptor.timestamp_ns, 42);
        assert_eq!(payload, b"block-start");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let recorder = EventRecorder::open(EventRecorderConfig { descriptors_shift: 8, payload_buf_shift: 16 }).unwrap();
        let huge = vec![0u8; (1 << 16) + 1];
        assert!(matches!(recorder.record(0, 0, [0; 4], &huge), Err(EventRecorderError::PayloadTooLarge(_, _))));
    }

    #[test]
    fn eviction_past_descriptor_capacity_ages_out_old_sequences() {
        let recorder = EventRecorder::open(EventRecorderConfig { descriptors_shift: 8, payload_buf_shift: 16 }).unwrap();
        let descriptor_count = 1u64 << 8;
        for i in 0..descriptor_count + 1 {
            recorder.record(0, i, [0; 4], b"x").unwrap();
        }
        assert!(recorder.read(0).is_none());
        assert!(recorder.read(descriptor_count).is_some());
    }

    #[test]
    fn invalid_shifts_are_rejected() {
        assert!(matches!(
            EventRecorder::open(EventRecorderConfig { descriptors_shift: 4, payload_buf_shift: 27 }),
            Err(EventRecorderError::InvalidDescriptorsShift(4))
        ));
        assert!(matches!(
            EventRecorder::open(EventRecorderConfig { descriptors_shift: 16, payload_buf_shift: 60 }),
            Err(EventRecorderError::InvalidPayloadShift(60))
        ));
    }
}
