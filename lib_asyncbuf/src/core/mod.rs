//! # Core Buffering Module
//!
//! This module is the heart of `lib_asyncbuf`: it holds records between the
//! producers of a sync and the destination, decides when each stream is
//! written out and ties flush completion back to upstream checkpoints.
//!
//! ## Core Components:
//!
//! - **`memory_manager`**: The global byte budget. Stream buffers borrow
//!   quota from it in blocks; producers wait here (FIFO, bounded) when the
//!   budget is exhausted.
//!
//! - **`stream_buffer`** / **`registry`**: One bounded FIFO queue per
//!   stream, created lazily on the first write.
//!
//! - **`enqueue`** / **`dequeue`**: The producer and flush sides of the
//!   buffers. Enqueue grows quota and stamps correlation tokens; dequeue
//!   drains batches and returns memory.
//!
//! - **`detect_flush`**: Size, memory-pressure, time and closing triggers.
//!
//! - **`running_workers`**: Per-stream and global flush concurrency limits.
//!
//! - **`state_manager`**: Watermarks over confirmed tokens and the
//!   checkpoints they release.
//!
//! - **`flush_workers`**: The supervisor loop and the flush tasks, with
//!   timeouts and retries.
//!
//! - **`consumer`**: Wires everything together behind `accept` / `close`.

#![forbid(unsafe_code)]

/// Stream identity.
pub mod stream;
/// Injected time source.
pub mod clock;
/// Global memory budget with FIFO waiters.
pub mod memory_manager;
/// Per-stream bounded FIFO queue.
pub mod stream_buffer;
/// Lazily populated stream → buffer map.
pub mod registry;
/// Producer gateway.
pub mod enqueue;
/// Flush-side gateway.
pub mod dequeue;
/// Flush trigger decisions.
pub mod detect_flush;
/// Flush concurrency slots.
pub mod running_workers;
/// Watermarks and checkpoints.
pub mod state_manager;
/// Flush supervisor and tasks.
pub mod flush_workers;
/// Queue snapshots and the periodic report.
pub mod diagnostics;
/// Orchestration of all of the above.
pub mod consumer;

// --- Public API Re-exports ---
pub use clock::{Clock, ManualClock, SystemClock};
pub use consumer::{AsyncStreamConsumer, ConsumerPhase, IncomingMessage};
pub use dequeue::BufferDequeue;
pub use detect_flush::{DetectStreamToFlush, FlushDecision, TriggerReason};
pub use diagnostics::{display_bytes, QueueInfo, QueueReporter, StreamQueueInfo};
pub use enqueue::BufferEnqueue;
pub use flush_workers::{FlushContext, FlushFunction, FlushWorkers};
pub use memory_manager::GlobalMemoryManager;
pub use registry::BufferRegistry;
pub use running_workers::{RunningFlushWorkers, WorkerSlot};
pub use state_manager::{Checkpoint, GlobalStateManager, TokenRange};
pub use stream::StreamDescriptor;
pub use stream_buffer::{BufferedRecord, IncomingRecord, RecordBatch, StreamBuffer};
