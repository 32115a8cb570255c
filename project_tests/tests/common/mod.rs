#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use lib_asyncbuf::{BufferedRecord, FlushError, FlushFunction, IncomingMessage, IncomingRecord, StreamDescriptor};
use parking_lot::Mutex;
use serde_json::json;

/// Flusher that remembers every persisted token per stream.
#[derive(Default)]
pub struct RecordingFlusher {
    pub persisted: Mutex<HashMap<StreamDescriptor, BTreeSet<u64>>>,
    pub batches: Mutex<Vec<(StreamDescriptor, usize, u64)>>,
    /// Streams whose flushes always fail fatally.
    pub poisoned: Mutex<Vec<StreamDescriptor>>,
    /// Base latency of one flush.
    pub delay: Duration,
    /// Extra latency for batches whose first token is odd, so that batches of
    /// one stream complete out of order when the stream allows it.
    pub odd_batch_delay: Duration,
}

impl RecordingFlusher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn persisted_tokens(&self, stream: &StreamDescriptor) -> BTreeSet<u64> {
        self.persisted.lock().get(stream).cloned().unwrap_or_default()
    }

    pub fn total_records(&self) -> usize {
        self.batches.lock().iter().map(|(_, n, _)| n).sum()
    }
}

impl FlushFunction for RecordingFlusher {
    fn flush(
        &self,
        stream: &StreamDescriptor,
        records: &[BufferedRecord],
    ) -> impl Future<Output = Result<(), FlushError>> + Send {
        let stream = stream.clone();
        let tokens: Vec<u64> = records.iter().map(|r| r.token).collect();
        let bytes: u64 = records.iter().map(|r| r.size_bytes).sum();
        async move {
            let mut delay = self.delay;
            if tokens.first().is_some_and(|t| t % 2 == 1) {
                delay += self.odd_batch_delay;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.poisoned.lock().contains(&stream) {
                return Err(FlushError::Fatal(format!("{stream} is poisoned")));
            }
            self.batches.lock().push((stream.clone(), tokens.len(), bytes));
            self.persisted.lock().entry(stream).or_default().extend(tokens);
            Ok(())
        }
    }
}

pub fn record(stream: &StreamDescriptor, n: u64, size_bytes: u64) -> IncomingMessage {
    IncomingMessage::Record {
        stream: stream.clone(),
        record: IncomingRecord::new(json!({ "n": n }), size_bytes),
    }
}

pub fn state(stream: &StreamDescriptor, cursor: u64) -> IncomingMessage {
    IncomingMessage::State {
        stream: stream.clone(),
        state: json!({ "cursor": cursor }),
    }
}

/// Polls `condition` every few milliseconds, panicking after `limit`.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
