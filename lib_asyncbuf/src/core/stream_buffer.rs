//! # Stream Buffer
//!
//! One bounded FIFO queue of records per stream. The buffer never holds more
//! bytes than the quota it was granted by the
//! [`GlobalMemoryManager`](super::memory_manager::GlobalMemoryManager);
//! growing the quota is the enqueue gateway's job, shrinking it happens here
//! when a batch is taken.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;

use super::state_manager::TokenRange;
use super::stream::StreamDescriptor;

/// A record as handed over by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRecord {
    /// Opaque payload.
    pub payload: Value,
    /// Serialized size, used for all memory accounting.
    pub size_bytes: u64,
}

impl IncomingRecord {
    pub fn new(payload: Value, size_bytes: u64) -> Self {
        Self {
            payload,
            size_bytes,
        }
    }
}

/// A record owned by a buffer or a flush task.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub payload: Value,
    pub size_bytes: u64,
    /// Correlation token: position of the record within its stream, starting at 1.
    pub token: u64,
}

/// A FIFO prefix removed from one buffer for a single flush.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub stream: StreamDescriptor,
    pub records: Vec<BufferedRecord>,
    /// Sum of the records' sizes; released to the memory manager once the batch is done.
    pub size_bytes: u64,
    /// Tokens covered by the batch, contiguous.
    pub tokens: TokenRange,
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
struct BufferState {
    records: VecDeque<BufferedRecord>,
    current_bytes: u64,
    quota: u64,
    next_token: u64,
    last_flush: Option<Instant>,
}

/// # Stream Buffer
///
/// Invariant: `current_bytes() <= allocated_quota()`.
#[derive(Debug)]
pub struct StreamBuffer {
    descriptor: StreamDescriptor,
    state: Mutex<BufferState>,
}

impl StreamBuffer {
    /// Creates an empty buffer that already owns `initial_quota` bytes of the global budget.
    pub fn new(descriptor: StreamDescriptor, initial_quota: u64) -> Self {
        Self {
            descriptor,
            state: Mutex::new(BufferState {
                records: VecDeque::new(),
                current_bytes: 0,
                quota: initial_quota,
                next_token: 1,
                last_flush: None,
            }),
        }
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// Appends the record if it fits in the current quota.
    ///
    /// Returns the record's correlation token, or gives the record back when
    /// the quota must grow first.
    pub fn try_push(&self, record: IncomingRecord) -> Result<u64, IncomingRecord> {
        let mut state = self.state.lock();
        if state.current_bytes + record.size_bytes > state.quota {
            return Err(record);
        }
        let token = state.next_token;
        state.next_token += 1;
        state.current_bytes += record.size_bytes;
        state.records.push_back(BufferedRecord {
            payload: record.payload,
            size_bytes: record.size_bytes,
            token,
        });
        Ok(token)
    }

    /// Bytes the quota lacks to accept a record of `size_bytes`.
    pub fn shortfall(&self, size_bytes: u64) -> u64 {
        let state = self.state.lock();
        (state.current_bytes + size_bytes).saturating_sub(state.quota)
    }

    /// Adds memory granted by the memory manager to this buffer's quota.
    pub fn add_quota(&self, bytes: u64) {
        self.state.lock().quota += bytes;
    }

    /// Gives back the unused part of the quota. Returns the bytes removed.
    pub fn trim_quota(&self) -> u64 {
        let mut state = self.state.lock();
        let unused = state.quota - state.current_bytes;
        state.quota = state.current_bytes;
        unused
    }

    /// # Take
    ///
    /// Removes the oldest records, stopping before `max_bytes` or
    /// `max_records` would be exceeded. The first record is always taken so an
    /// oversized record cannot wedge the queue. The quota shrinks by the bytes
    /// removed.
    pub fn take(&self, max_bytes: u64, max_records: usize) -> Option<RecordBatch> {
        let mut state = self.state.lock();
        let first_token = state.records.front()?.token;

        let mut records = Vec::new();
        let mut size_bytes = 0u64;
        while let Some(front) = state.records.front() {
            let full = records.len() >= max_records || size_bytes + front.size_bytes > max_bytes;
            if !records.is_empty() && full {
                break;
            }
            size_bytes += front.size_bytes;
            if let Some(record) = state.records.pop_front() {
                records.push(record);
            }
        }

        state.current_bytes -= size_bytes;
        state.quota -= size_bytes;
        let last_token = first_token + records.len() as u64 - 1;

        Some(RecordBatch {
            stream: self.descriptor.clone(),
            records,
            size_bytes,
            tokens: TokenRange::new(first_token, last_token),
        })
    }

    pub fn current_bytes(&self) -> u64 {
        self.state.lock().current_bytes
    }

    pub fn allocated_quota(&self) -> u64 {
        self.state.lock().quota
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Token of the most recently appended record, `0` if none yet.
    pub fn last_token(&self) -> u64 {
        self.state.lock().next_token - 1
    }

    /// Time of the last successful flush, `None` if never flushed.
    pub fn last_flush(&self) -> Option<Instant> {
        self.state.lock().last_flush
    }

    /// Records a successful flush. Never moves the timestamp backwards.
    pub fn mark_flushed(&self, at: Instant) {
        let mut state = self.state.lock();
        if state.last_flush.map_or(true, |previous| previous < at) {
            state.last_flush = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(n: u64, size: u64) -> IncomingRecord {
        IncomingRecord::new(json!({ "n": n }), size)
    }

    #[test]
    fn rejects_records_beyond_quota() {
        let buffer = StreamBuffer::new(StreamDescriptor::new("s"), 250);
        assert_eq!(buffer.try_push(record(1, 100)).unwrap(), 1);
        assert_eq!(buffer.try_push(record(2, 100)).unwrap(), 2);
        let rejected = buffer.try_push(record(3, 100)).unwrap_err();
        assert_eq!(rejected.payload, json!({ "n": 3 }));
        assert_eq!(buffer.shortfall(100), 50);

        buffer.add_quota(50);
        assert_eq!(buffer.try_push(rejected).unwrap(), 3);
        assert_eq!(buffer.current_bytes(), 300);
        assert_eq!(buffer.last_token(), 3);
    }

    #[test]
    fn take_respects_both_limits_and_shrinks_quota() {
        let buffer = StreamBuffer::new(StreamDescriptor::new("s"), 1000);
        for n in 1..=5 {
            buffer.try_push(record(n, 100)).unwrap();
        }

        let batch = buffer.take(250, 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_bytes, 200);
        assert_eq!(batch.tokens, TokenRange::new(1, 2));

        let batch = buffer.take(10_000, 1).unwrap();
        assert_eq!(batch.tokens, TokenRange::new(3, 3));

        assert_eq!(buffer.current_bytes(), 200);
        assert_eq!(buffer.allocated_quota(), 700);
        assert_eq!(buffer.trim_quota(), 500);
        assert_eq!(buffer.allocated_quota(), 200);
    }

    #[test]
    fn oversized_head_is_still_taken() {
        let buffer = StreamBuffer::new(StreamDescriptor::new("s"), 1000);
        buffer.try_push(record(1, 600)).unwrap();
        buffer.try_push(record(2, 10)).unwrap();
        let batch = buffer.take(100, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.size_bytes, 600);
        assert!(buffer.take(0, 0).is_some());
        assert!(buffer.take(100, 10).is_none());
    }

    #[test]
    fn last_flush_only_moves_forward() {
        let buffer = StreamBuffer::new(StreamDescriptor::new("s"), 10);
        let now = Instant::now();
        buffer.mark_flushed(now + std::time::Duration::from_secs(2));
        buffer.mark_flushed(now);
        assert_eq!(
            buffer.last_flush(),
            Some(now + std::time::Duration::from_secs(2))
        );
    }

    proptest! {
        #[test]
        fn dequeued_order_matches_enqueued_order(
            sizes in proptest::collection::vec(1u64..200, 1..80),
            limits in proptest::collection::vec((1u64..600, 1usize..8), 1..20),
        ) {
            let buffer = StreamBuffer::new(StreamDescriptor::new("fifo"), u64::MAX / 2);
            for (n, size) in sizes.iter().enumerate() {
                buffer.try_push(record(n as u64, *size)).unwrap();
            }

            let mut seen = Vec::new();
            let mut round = 0;
            while let Some(batch) = buffer.take(limits[round % limits.len()].0, limits[round % limits.len()].1) {
                prop_assert_eq!(batch.tokens.first, batch.records[0].token);
                prop_assert_eq!(batch.tokens.last, batch.records[batch.len() - 1].token);
                seen.extend(batch.records.into_iter().map(|r| r.payload));
                round += 1;
            }

            let expected: Vec<Value> = (0..sizes.len()).map(|n| json!({ "n": n as u64 })).collect();
            prop_assert_eq!(seen, expected);
            prop_assert_eq!(buffer.current_bytes(), 0);
        }
    }
}
