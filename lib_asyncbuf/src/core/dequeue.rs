//! # Dequeue Gateway
//!
//! The flush side's view of the buffers: it drains batches, returns their
//! memory once they are done with, and exposes the read-only figures the
//! trigger detector and the diagnostics need.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::memory_manager::GlobalMemoryManager;
use super::registry::BufferRegistry;
use super::stream::StreamDescriptor;
use super::stream_buffer::RecordBatch;

pub struct BufferDequeue {
    registry: Arc<BufferRegistry>,
    memory: Arc<GlobalMemoryManager>,
}

impl BufferDequeue {
    pub fn new(registry: Arc<BufferRegistry>, memory: Arc<GlobalMemoryManager>) -> Self {
        Self { registry, memory }
    }

    /// Removes the oldest records of `stream`, bounded by `max_bytes` and
    /// `max_records`. The batch's bytes stay allocated until
    /// [`release_batch`](Self::release_batch).
    pub fn take(
        &self,
        stream: &StreamDescriptor,
        max_bytes: u64,
        max_records: usize,
    ) -> Option<RecordBatch> {
        let batch = self.registry.get(stream)?.take(max_bytes, max_records)?;
        debug!(
            stream = %stream,
            records = batch.len(),
            bytes = batch.size_bytes,
            first = batch.tokens.first,
            last = batch.tokens.last,
            "batch dequeued"
        );
        Some(batch)
    }

    /// Returns a finished batch's bytes to the memory manager.
    pub fn release_batch(&self, batch: &RecordBatch) {
        self.memory.release(batch.size_bytes);
    }

    /// Records a successful flush of `stream` at `at`.
    pub fn mark_flushed(&self, stream: &StreamDescriptor, at: Instant) {
        if let Some(buffer) = self.registry.get(stream) {
            buffer.mark_flushed(at);
        }
    }

    /// Gives unused quota of every buffer back to the memory manager so that
    /// parked producers of other streams can proceed.
    pub fn reclaim_idle_quota(&self) -> u64 {
        let reclaimed: u64 = self
            .registry
            .buffers()
            .iter()
            .map(|buffer| buffer.trim_quota())
            .sum();
        if reclaimed > 0 {
            debug!(reclaimed, "idle buffer quota reclaimed");
            self.memory.release(reclaimed);
        }
        reclaimed
    }

    pub fn queue_size_bytes(&self, stream: &StreamDescriptor) -> Option<u64> {
        self.registry.get(stream).map(|b| b.current_bytes())
    }

    pub fn queue_size_records(&self, stream: &StreamDescriptor) -> Option<usize> {
        self.registry.get(stream).map(|b| b.len())
    }

    pub fn allocated_quota(&self, stream: &StreamDescriptor) -> Option<u64> {
        self.registry.get(stream).map(|b| b.allocated_quota())
    }

    pub fn last_flush(&self, stream: &StreamDescriptor) -> Option<Instant> {
        self.registry.get(stream).and_then(|b| b.last_flush())
    }

    pub fn total_buffered_bytes(&self) -> u64 {
        self.registry.total_buffered_bytes()
    }

    /// Streams that currently hold at least one record.
    pub fn buffered_streams(&self) -> Vec<StreamDescriptor> {
        self.registry
            .buffers()
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.descriptor().clone())
            .collect()
    }

    /// All registered streams.
    pub fn streams(&self) -> Vec<StreamDescriptor> {
        self.registry.streams()
    }

    /// Share of the global budget currently allocated.
    pub fn global_usage_ratio(&self) -> f64 {
        self.memory.usage_ratio()
    }

    /// Number of producers parked on the memory manager.
    pub fn waiting_producers(&self) -> usize {
        self.memory.waiting()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream_buffer::IncomingRecord;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn take_and_release_round_trip_memory() {
        let memory = Arc::new(GlobalMemoryManager::new(10_000, Duration::from_secs(5)));
        let registry = Arc::new(BufferRegistry::new(Arc::clone(&memory), 1_000));
        let dequeue = BufferDequeue::new(Arc::clone(&registry), Arc::clone(&memory));
        let stream = StreamDescriptor::new("users");

        assert!(dequeue.take(&stream, 100, 10).is_none());

        let buffer = registry.get_or_create(&stream).await.unwrap();
        for _ in 0..4 {
            buffer.try_push(IncomingRecord::new(json!(1), 100)).unwrap();
        }
        assert_eq!(dequeue.buffered_streams(), vec![stream.clone()]);
        assert_eq!(dequeue.queue_size_records(&stream), Some(4));

        let batch = dequeue.take(&stream, 250, 10).unwrap();
        assert_eq!(batch.size_bytes, 200);
        assert_eq!(dequeue.allocated_quota(&stream), Some(800));
        assert_eq!(memory.allocated_bytes(), 1_000);

        dequeue.release_batch(&batch);
        assert_eq!(memory.allocated_bytes(), 800);

        assert_eq!(dequeue.reclaim_idle_quota(), 600);
        assert_eq!(memory.allocated_bytes(), 200);
        assert_eq!(dequeue.queue_size_bytes(&stream), Some(200));
    }
}
