//! # Global State Manager
//!
//! Ties upstream checkpoints to flush completion. Every buffered record
//! carries a per-stream correlation token; a stream's watermark is the
//! highest token `w` such that every token in `1..=w` belongs to a batch the
//! flush function confirmed. A checkpoint received from upstream is bound to
//! the last token issued for its stream at that moment and is only released
//! for emission once the watermark reaches that token.
//!
//! Batches may complete out of order when a stream allows more than one
//! flush in flight. Acknowledged ranges above the watermark are parked until
//! the gap below them closes, so the watermark never moves backwards and
//! never claims durability for a record that is still in flight.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use super::stream::StreamDescriptor;

/// Inclusive range of correlation tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TokenRange {
    pub first: u64,
    pub last: u64,
}

impl TokenRange {
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last, "token range {first}..={last} is inverted");
        Self { first, last }
    }

    /// Number of tokens covered.
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn contains(&self, token: u64) -> bool {
        self.first <= token && token <= self.last
    }
}

/// An upstream state message waiting for (or released by) the watermark.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub stream: StreamDescriptor,
    /// Last token issued for the stream when the state arrived.
    pub bound_token: u64,
    /// Opaque state payload, emitted verbatim.
    pub state: Value,
    /// Global arrival order.
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct StreamState {
    watermark: u64,
    /// Acknowledged ranges above the watermark, keyed by first token.
    acked: BTreeMap<u64, u64>,
    lost: Vec<TokenRange>,
    pending: VecDeque<Checkpoint>,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<StreamDescriptor, StreamState>,
    next_sequence: u64,
}

/// # Global State Manager
///
/// Per-stream watermarks and pending checkpoints behind one mutex.
#[derive(Debug, Default)]
pub struct GlobalStateManager {
    inner: Mutex<Inner>,
}

impl GlobalStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Advance Watermark
    ///
    /// Records that every token in `range` is durably flushed and returns the
    /// stream's (possibly unchanged) watermark. Must only be called after the
    /// flush function confirmed success.
    pub fn advance_watermark(&self, stream: &StreamDescriptor, range: TokenRange) -> u64 {
        let mut inner = self.inner.lock();
        let state = inner.streams.entry(stream.clone()).or_default();
        if range.last <= state.watermark {
            return state.watermark;
        }

        let last = state.acked.entry(range.first).or_insert(range.last);
        *last = (*last).max(range.last);

        while let Some((&first, &last)) = state.acked.first_key_value() {
            if first > state.watermark + 1 {
                break;
            }
            state.acked.pop_first();
            state.watermark = state.watermark.max(last);
        }
        debug!(stream = %stream, watermark = state.watermark, "watermark advanced");
        state.watermark
    }

    /// Current watermark; `0` when nothing has been flushed.
    pub fn query_watermark(&self, stream: &StreamDescriptor) -> u64 {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map_or(0, |state| state.watermark)
    }

    /// Records tokens whose batch failed terminally. The watermark will never
    /// pass them, so checkpoints bound at or after them are never emitted.
    pub fn mark_lost(&self, stream: &StreamDescriptor, range: TokenRange) {
        let mut inner = self.inner.lock();
        let state = inner.streams.entry(stream.clone()).or_default();
        error!(
            stream = %stream,
            first = range.first,
            last = range.last,
            "records lost; checkpoints beyond them will not be emitted"
        );
        state.lost.push(range);
    }

    /// Ranges reported through [`mark_lost`](Self::mark_lost).
    pub fn lost_ranges(&self, stream: &StreamDescriptor) -> Vec<TokenRange> {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|state| state.lost.clone())
            .unwrap_or_default()
    }

    /// Queues an upstream checkpoint behind `bound_token`.
    pub fn register_checkpoint(&self, stream: &StreamDescriptor, bound_token: u64, state: Value) {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner
            .streams
            .entry(stream.clone())
            .or_default()
            .pending
            .push_back(Checkpoint {
                stream: stream.clone(),
                bound_token,
                state,
                sequence,
            });
    }

    /// Removes and returns every checkpoint now covered by its stream's
    /// watermark, in arrival order.
    pub fn take_committed(&self) -> Vec<Checkpoint> {
        let mut inner = self.inner.lock();
        let mut committed = Vec::new();
        for state in inner.streams.values_mut() {
            while state
                .pending
                .front()
                .is_some_and(|checkpoint| checkpoint.bound_token <= state.watermark)
            {
                if let Some(checkpoint) = state.pending.pop_front() {
                    committed.push(checkpoint);
                }
            }
        }
        committed.sort_by_key(|checkpoint| checkpoint.sequence);
        committed
    }

    /// Checkpoints not yet covered by a watermark.
    pub fn pending_checkpoints(&self) -> usize {
        self.inner
            .lock()
            .streams
            .values()
            .map(|state| state.pending.len())
            .sum()
    }

    /// One-line summary for the queue report.
    pub fn memory_usage_message(&self) -> String {
        let inner = self.inner.lock();
        let pending: usize = inner.streams.values().map(|s| s.pending.len()).sum();
        let parked: usize = inner.streams.values().map(|s| s.acked.len()).sum();
        format!(
            "State Manager: pending checkpoints: {}, out-of-order acks: {}",
            pending, parked
        )
    }
}
