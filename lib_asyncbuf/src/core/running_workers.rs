//! # Running Flush Workers
//!
//! Bounds how many flushes are in flight, per stream and overall. Each
//! stream has its own counting semaphore and all streams share one global
//! semaphore. Acquisition never waits: a stream that cannot get a slot is
//! simply skipped until the next evaluation cycle.
//!
//! A [`WorkerSlot`] returns both permits when dropped, so a slot is released
//! exactly once on every path out of a flush task, failures included.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::stream::StreamDescriptor;

pub struct RunningFlushWorkers {
    per_stream_ceiling: usize,
    global_ceiling: usize,
    global: Arc<Semaphore>,
    streams: Mutex<HashMap<StreamDescriptor, Arc<Semaphore>>>,
}

impl RunningFlushWorkers {
    pub fn new(per_stream_ceiling: usize, global_ceiling: usize) -> Self {
        Self {
            per_stream_ceiling,
            global_ceiling,
            global: Arc::new(Semaphore::new(global_ceiling)),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn stream_semaphore(&self, stream: &StreamDescriptor) -> Arc<Semaphore> {
        let mut streams = self.streams.lock();
        Arc::clone(
            streams
                .entry(stream.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_stream_ceiling))),
        )
    }

    /// Takes one per-stream and one global permit, or neither.
    pub fn try_acquire(&self, stream: &StreamDescriptor) -> Option<WorkerSlot> {
        let stream_permit = self.stream_semaphore(stream).try_acquire_owned().ok()?;
        let global_permit = Arc::clone(&self.global).try_acquire_owned().ok()?;
        Some(WorkerSlot {
            stream: stream.clone(),
            _stream_permit: stream_permit,
            _global_permit: global_permit,
        })
    }

    /// Flushes in flight for `stream`.
    pub fn in_flight(&self, stream: &StreamDescriptor) -> usize {
        self.streams.lock().get(stream).map_or(0, |semaphore| {
            self.per_stream_ceiling - semaphore.available_permits()
        })
    }

    /// Flushes in flight across all streams.
    pub fn total_in_flight(&self) -> usize {
        self.global_ceiling - self.global.available_permits()
    }

    /// `true` when a new flush for `stream` could not start right now.
    pub fn is_saturated(&self, stream: &StreamDescriptor) -> bool {
        self.in_flight(stream) >= self.per_stream_ceiling || self.global.available_permits() == 0
    }

    pub fn per_stream_ceiling(&self) -> usize {
        self.per_stream_ceiling
    }

    pub fn global_ceiling(&self) -> usize {
        self.global_ceiling
    }
}

/// Permission to run one flush of one stream.
#[derive(Debug)]
pub struct WorkerSlot {
    stream: StreamDescriptor,
    _stream_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    /// Gives the slot back. Dropping the slot has the same effect.
    pub fn release(self) {}
}
