//! # Buffer Registry
//!
//! Maps each stream to its [`StreamBuffer`]. Buffers are created lazily on
//! the first write to a stream and live until the subsystem shuts down.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::memory_manager::GlobalMemoryManager;
use super::stream::StreamDescriptor;
use super::stream_buffer::StreamBuffer;
use crate::error::Result;

pub struct BufferRegistry {
    buffers: Mutex<HashMap<StreamDescriptor, Arc<StreamBuffer>>>,
    memory: Arc<GlobalMemoryManager>,
    initial_quota: u64,
}

impl BufferRegistry {
    pub fn new(memory: Arc<GlobalMemoryManager>, initial_quota: u64) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            memory,
            initial_quota,
        }
    }

    /// Returns the stream's buffer, creating it on first use.
    ///
    /// The initial quota is requested before the map is locked, so a slow
    /// allocation never blocks lookups for other streams. When two callers
    /// race to create the same buffer, the loser hands its quota back.
    pub async fn get_or_create(&self, stream: &StreamDescriptor) -> Result<Arc<StreamBuffer>> {
        if let Some(buffer) = self.get(stream) {
            return Ok(buffer);
        }

        let quota = self.memory.allocate(self.initial_quota).await?;

        let existing = {
            let mut buffers = self.buffers.lock();
            match buffers.entry(stream.clone()) {
                Entry::Occupied(existing) => Arc::clone(existing.get()),
                Entry::Vacant(slot) => {
                    info!(stream = %stream, quota, "created stream buffer");
                    let buffer = Arc::new(StreamBuffer::new(stream.clone(), quota));
                    slot.insert(Arc::clone(&buffer));
                    return Ok(buffer);
                }
            }
        };
        debug!(stream = %stream, quota, "lost buffer creation race; returning quota");
        self.memory.release(quota);
        Ok(existing)
    }

    pub fn get(&self, stream: &StreamDescriptor) -> Option<Arc<StreamBuffer>> {
        self.buffers.lock().get(stream).cloned()
    }

    /// Registered streams in descriptor order.
    pub fn streams(&self) -> Vec<StreamDescriptor> {
        let mut streams: Vec<_> = self.buffers.lock().keys().cloned().collect();
        streams.sort();
        streams
    }

    /// Snapshot of all buffers in descriptor order.
    pub fn buffers(&self) -> Vec<Arc<StreamBuffer>> {
        let mut buffers: Vec<_> = self.buffers.lock().values().cloned().collect();
        buffers.sort_by(|a, b| a.descriptor().cmp(b.descriptor()));
        buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }

    /// Bytes buffered across all streams.
    pub fn total_buffered_bytes(&self) -> u64 {
        self.buffers().iter().map(|b| b.current_bytes()).sum()
    }

    /// Drops every buffer and returns their unused quota to the memory
    /// manager. Records still buffered keep their bytes accounted; callers
    /// flush before shutting down.
    pub fn shutdown(&self) -> u64 {
        let drained: Vec<_> = self.buffers.lock().drain().map(|(_, b)| b).collect();
        let mut released = 0;
        for buffer in drained {
            released += buffer.trim_quota();
        }
        self.memory.release(released);
        info!(released, "buffer registry shut down");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(max: u64, initial: u64) -> (Arc<GlobalMemoryManager>, Arc<BufferRegistry>) {
        let memory = Arc::new(GlobalMemoryManager::new(max, Duration::from_secs(5)));
        let registry = Arc::new(BufferRegistry::new(Arc::clone(&memory), initial));
        (memory, registry)
    }

    #[tokio::test]
    async fn creation_is_idempotent_and_allocates_once() {
        let (memory, registry) = registry(10_000, 1_000);
        let stream = StreamDescriptor::new("users");

        let first = registry.get_or_create(&stream).await.unwrap();
        let second = registry.get_or_create(&stream).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.allocated_quota(), 1_000);
        assert_eq!(memory.allocated_bytes(), 1_000);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_yields_one_buffer() {
        let (memory, registry) = registry(100_000, 1_000);
        let stream = StreamDescriptor::with_namespace("public", "orders");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let stream = stream.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create(&stream).await.unwrap()
            }));
        }
        let mut buffers = Vec::new();
        for handle in handles {
            buffers.push(handle.await.unwrap());
        }

        assert!(buffers.iter().all(|b| Arc::ptr_eq(b, &buffers[0])));
        assert_eq!(registry.len(), 1);
        assert_eq!(memory.allocated_bytes(), 1_000);
    }

    #[tokio::test]
    async fn shutdown_returns_unused_quota() {
        let (memory, registry) = registry(10_000, 1_000);
        registry.get_or_create(&StreamDescriptor::new("a")).await.unwrap();
        registry.get_or_create(&StreamDescriptor::new("b")).await.unwrap();
        assert_eq!(
            registry.streams(),
            vec![StreamDescriptor::new("a"), StreamDescriptor::new("b")]
        );
        assert_eq!(registry.shutdown(), 2_000);
        assert_eq!(memory.allocated_bytes(), 0);
        assert!(registry.is_empty());
    }
}
