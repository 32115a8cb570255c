//! # Async Stream Consumer
//!
//! The front door of the subsystem. It wires one memory manager, one buffer
//! registry, one state manager and one clock into the enqueue gateway, the
//! flush workers and the queue reporter, and walks them through their
//! lifecycle:
//!
//! - **Created**: components exist, nothing runs. Records may already be
//!   accepted; they simply wait in their buffers.
//! - **Running**: the flush supervisor and the queue reporter are spawned.
//! - **Closed**: input is rejected, every buffer has been flushed and the
//!   final checkpoints emitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::clock::{Clock, SystemClock};
use super::dequeue::BufferDequeue;
use super::diagnostics::{QueueInfo, QueueReporter};
use super::enqueue::BufferEnqueue;
use super::flush_workers::{FlushContext, FlushFunction, FlushWorkers};
use super::memory_manager::GlobalMemoryManager;
use super::registry::BufferRegistry;
use super::running_workers::RunningFlushWorkers;
use super::state_manager::{Checkpoint, GlobalStateManager};
use super::stream::StreamDescriptor;
use super::stream_buffer::IncomingRecord;
use crate::configs::BufferConfig;
use crate::error::{BufferError, Result};

/// One unit of producer input.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Record {
        stream: StreamDescriptor,
        record: IncomingRecord,
    },
    /// Upstream checkpoint covering every record of `stream` sent before it.
    State {
        stream: StreamDescriptor,
        state: Value,
    },
}

/// Lifecycle phase of an [`AsyncStreamConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    Created,
    Running,
    Closed,
}

pub struct AsyncStreamConsumer<F: FlushFunction> {
    config: BufferConfig,
    memory: Arc<GlobalMemoryManager>,
    registry: Arc<BufferRegistry>,
    states: Arc<GlobalStateManager>,
    enqueue: BufferEnqueue,
    flush: Arc<FlushWorkers<F>>,
    reporter: Arc<QueueReporter>,
    phase: Mutex<ConsumerPhase>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<Result<()>>>>,
    report_task: Mutex<Option<JoinHandle<()>>>,
    records_accepted: AtomicU64,
    states_accepted: AtomicU64,
}

impl<F: FlushFunction> AsyncStreamConsumer<F> {
    /// Builds the subsystem on the wall clock. Committed checkpoints are sent
    /// on `checkpoints`, in arrival order within each stream.
    ///
    /// # Errors
    /// [`BufferError::Config`] when `config` does not validate.
    pub fn new(
        config: BufferConfig,
        flusher: F,
        checkpoints: mpsc::UnboundedSender<Checkpoint>,
    ) -> Result<Self> {
        Self::with_clock(config, flusher, Arc::new(SystemClock), checkpoints)
    }

    /// Same as [`new`](Self::new) with an explicit time source.
    pub fn with_clock(
        config: BufferConfig,
        flusher: F,
        clock: Arc<dyn Clock>,
        checkpoints: mpsc::UnboundedSender<Checkpoint>,
    ) -> Result<Self> {
        config.validate()?;

        let memory = Arc::new(GlobalMemoryManager::new(
            config.max_memory_bytes,
            config.allocate_timeout(),
        ));
        let registry = Arc::new(BufferRegistry::new(
            Arc::clone(&memory),
            config.initial_stream_quota_bytes,
        ));
        let states = Arc::new(GlobalStateManager::new());
        let workers = Arc::new(RunningFlushWorkers::new(
            config.per_stream_concurrency,
            config.global_concurrency,
        ));
        let wake = Arc::new(Notify::new());

        let enqueue = BufferEnqueue::new(
            Arc::clone(&registry),
            Arc::clone(&memory),
            Arc::clone(&states),
            config.block_size_bytes,
            Arc::clone(&wake),
        );
        let context = FlushContext {
            dequeue: Arc::new(BufferDequeue::new(Arc::clone(&registry), Arc::clone(&memory))),
            workers: Arc::clone(&workers),
            states: Arc::clone(&states),
            clock,
            wake,
        };
        let flush = Arc::new(FlushWorkers::new(
            Arc::new(flusher),
            context,
            &config,
            checkpoints,
        ));
        let reporter = Arc::new(QueueReporter::new(
            Arc::clone(&memory),
            Arc::clone(&registry),
            workers,
            Arc::clone(&states),
        ));

        Ok(Self {
            config,
            memory,
            registry,
            states,
            enqueue,
            flush,
            reporter,
            phase: Mutex::new(ConsumerPhase::Created),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
            report_task: Mutex::new(None),
            records_accepted: AtomicU64::new(0),
            states_accepted: AtomicU64::new(0),
        })
    }

    /// # Start
    ///
    /// Spawns the flush supervisor and the queue reporter. Calling it again
    /// while running is a no-op.
    ///
    /// # Errors
    /// [`BufferError::Closed`] after [`close`](Self::close).
    pub fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        match *phase {
            ConsumerPhase::Running => return Ok(()),
            ConsumerPhase::Closed => return Err(BufferError::Closed),
            ConsumerPhase::Created => {}
        }

        *self.supervisor.lock() = Some(self.flush.start(self.cancel.child_token()));
        *self.report_task.lock() = Some(
            Arc::clone(&self.reporter)
                .spawn(self.config.report_interval(), self.cancel.child_token()),
        );
        *phase = ConsumerPhase::Running;
        info!(
            max_memory_bytes = self.config.max_memory_bytes,
            global_concurrency = self.config.global_concurrency,
            "async stream consumer started"
        );
        Ok(())
    }

    /// # Accept
    ///
    /// Routes one message: records go through the enqueue gateway (and may
    /// wait for memory), states are bound to the stream's last record.
    ///
    /// # Errors
    /// - [`BufferError::Closed`] after [`close`](Self::close).
    /// - [`BufferError::FlushFailed`] once any flush has failed for good,
    ///   including for a call already waiting on memory when it happens.
    /// - Enqueue errors ([`BufferError::QuotaExceeded`],
    ///   [`BufferError::CapacityExceeded`]).
    pub async fn accept(&self, message: IncomingMessage) -> Result<()> {
        self.flush.check_failure()?;
        match message {
            IncomingMessage::Record { stream, record } => {
                // A producer parked on memory must not outlive a fatal flush.
                tokio::select! {
                    biased;
                    _ = self.flush.failed() => return self.flush.check_failure(),
                    pushed = self.enqueue.enqueue(&stream, record) => {
                        pushed?;
                    }
                }
                self.records_accepted.fetch_add(1, Ordering::Relaxed);
            }
            IncomingMessage::State { stream, state } => {
                self.enqueue.enqueue_state(&stream, state)?;
                self.states_accepted.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// # Close
    ///
    /// Stops taking input, flushes every buffer regardless of triggers,
    /// emits the final checkpoints and returns all memory. Returns the first
    /// terminal flush failure of the run, if any. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if *phase == ConsumerPhase::Closed {
                return Ok(());
            }
            *phase = ConsumerPhase::Closed;
        }
        self.enqueue.close();
        info!(
            records = self.records_accepted.load(Ordering::Relaxed),
            states = self.states_accepted.load(Ordering::Relaxed),
            "closing async stream consumer"
        );

        let outcome = self.flush.close().await;

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "flush supervisor ended with a failure"),
                Err(join) => error!(error = %join, "flush supervisor task panicked"),
            }
        }
        self.cancel.cancel();
        let report_task = self.report_task.lock().take();
        if let Some(handle) = report_task {
            if let Err(join) = handle.await {
                error!(error = %join, "queue reporter task panicked");
            }
        }

        info!("{}", self.queue_info());
        self.registry.shutdown();
        if let Err(err) = &outcome {
            error!(error = %err, "async stream consumer closed with a flush failure");
        } else {
            info!(
                allocated_bytes = self.memory.allocated_bytes(),
                "async stream consumer closed"
            );
        }
        outcome
    }

    pub fn phase(&self) -> ConsumerPhase {
        *self.phase.lock()
    }

    /// Current queue snapshot.
    pub fn queue_info(&self) -> QueueInfo {
        self.reporter.snapshot()
    }

    pub fn memory(&self) -> &Arc<GlobalMemoryManager> {
        &self.memory
    }

    pub fn states(&self) -> &Arc<GlobalStateManager> {
        &self.states
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
}
