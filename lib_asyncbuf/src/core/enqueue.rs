//! # Enqueue Gateway
//!
//! The only way producers put data into the subsystem. A record is appended
//! to its stream's buffer; when the buffer's quota is too small the gateway
//! asks the memory manager for more, which is where producers feel
//! backpressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::memory_manager::GlobalMemoryManager;
use super::registry::BufferRegistry;
use super::state_manager::GlobalStateManager;
use super::stream::StreamDescriptor;
use super::stream_buffer::IncomingRecord;
use crate::error::{BufferError, Result};

pub struct BufferEnqueue {
    registry: Arc<BufferRegistry>,
    memory: Arc<GlobalMemoryManager>,
    states: Arc<GlobalStateManager>,
    block_size: u64,
    /// Wakes the flush supervisor so triggers are evaluated right after a write.
    wake: Arc<Notify>,
    closed: AtomicBool,
}

impl BufferEnqueue {
    pub fn new(
        registry: Arc<BufferRegistry>,
        memory: Arc<GlobalMemoryManager>,
        states: Arc<GlobalStateManager>,
        block_size: u64,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            registry,
            memory,
            states,
            block_size,
            wake,
            closed: AtomicBool::new(false),
        }
    }

    /// # Enqueue
    ///
    /// Appends `record` to the stream's buffer and returns its correlation
    /// token. Blocks while the global budget is exhausted.
    ///
    /// # Errors
    /// - [`BufferError::Closed`] after [`close`](Self::close).
    /// - [`BufferError::QuotaExceeded`] if the record alone exceeds the budget.
    /// - [`BufferError::CapacityExceeded`] if the buffer could not grow in time.
    pub async fn enqueue(&self, stream: &StreamDescriptor, record: IncomingRecord) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }
        if record.size_bytes > self.memory.max_bytes() {
            return Err(BufferError::QuotaExceeded {
                requested: record.size_bytes,
                max: self.memory.max_bytes(),
            });
        }

        let buffer = self.registry.get_or_create(stream).await?;
        let started = Instant::now();
        let mut record = record;
        let token = loop {
            match buffer.try_push(record) {
                Ok(token) => break token,
                Err(rejected) => {
                    record = rejected;
                    let request = self
                        .block_size
                        .max(buffer.shortfall(record.size_bytes))
                        .min(self.memory.max_bytes());
                    match self.memory.allocate(request).await {
                        Ok(granted) => {
                            debug!(stream = %stream, granted, "stream buffer quota grown");
                            buffer.add_quota(granted);
                        }
                        Err(BufferError::AllocationTimeout { .. }) => {
                            return Err(BufferError::CapacityExceeded {
                                stream: stream.clone(),
                                waited: started.elapsed(),
                            });
                        }
                        Err(other) => return Err(other),
                    }
                }
            }
        };

        trace!(stream = %stream, token, "record enqueued");
        self.wake.notify_one();
        Ok(token)
    }

    /// Registers an upstream checkpoint for `stream`, bound to the last record
    /// enqueued for it. Producers send a state after the records it covers.
    pub fn enqueue_state(&self, stream: &StreamDescriptor, state: Value) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }
        let bound = self
            .registry
            .get(stream)
            .map_or(0, |buffer| buffer.last_token());
        self.states.register_checkpoint(stream, bound, state);
        self.wake.notify_one();
        Ok(())
    }

    /// Stops accepting records and states.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
