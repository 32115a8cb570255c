//! # Flush Workers
//!
//! The supervisor that turns trigger decisions into flushes. It wakes on a
//! fixed interval or as soon as a producer enqueues, asks the
//! [`DetectStreamToFlush`] which streams are due, and spawns one flush task
//! per stream that can get a [`WorkerSlot`].
//!
//! ## Flush task lifecycle
//!
//! 1.  Drain one batch from the stream's buffer.
//! 2.  Hand it to the [`FlushFunction`] under a per-attempt timeout. Transient
//!     failures (and timeouts) are retried with exponential backoff while the
//!     task keeps its slot.
//! 3.  On success the batch's bytes go back to the memory manager, the
//!     stream's watermark advances, the stream is marked flushed and every
//!     checkpoint the new watermark covers is sent on the checkpoint channel.
//! 4.  On a fatal failure the batch's tokens are recorded as lost, the
//!     supervisor stops, producers parked on memory are failed and then the
//!     bytes are released. The first failure is what [`FlushWorkers::start`],
//!     [`FlushWorkers::close`] and [`FlushWorkers::failed`] report.
//!
//! The slot is released last, on every path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::dequeue::BufferDequeue;
use super::detect_flush::{DetectStreamToFlush, TriggerReason};
use super::running_workers::{RunningFlushWorkers, WorkerSlot};
use super::state_manager::{Checkpoint, GlobalStateManager};
use super::stream::StreamDescriptor;
use super::stream_buffer::{BufferedRecord, RecordBatch};
use crate::configs::BufferConfig;
use crate::error::{BufferError, FlushError, Result};

/// Batch size a flush function asks for when it does not say otherwise.
pub const DEFAULT_OPTIMAL_BATCH_SIZE_BYTES: u64 = 25 * 1024 * 1024;

/// How often [`FlushWorkers::close`] re-checks progress when nothing wakes it.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// # Flush Function
///
/// The destination side of the pipeline: persists one batch of one stream.
/// Implementations decide whether a failure is worth retrying by returning
/// [`FlushError::Transient`] or [`FlushError::Fatal`].
pub trait FlushFunction: Send + Sync + 'static {
    /// Persists `records`, all belonging to `stream`, oldest first.
    fn flush(
        &self,
        stream: &StreamDescriptor,
        records: &[BufferedRecord],
    ) -> impl Future<Output = std::result::Result<(), FlushError>> + Send;

    /// Largest batch the destination wants in one call.
    fn optimal_batch_size_bytes(&self) -> u64 {
        DEFAULT_OPTIMAL_BATCH_SIZE_BYTES
    }

    /// Buffered bytes at which a stream is flushed regardless of its quota.
    fn flush_threshold_bytes(&self) -> u64 {
        self.optimal_batch_size_bytes()
    }
}

impl<T: FlushFunction> FlushFunction for Arc<T> {
    fn flush(
        &self,
        stream: &StreamDescriptor,
        records: &[BufferedRecord],
    ) -> impl Future<Output = std::result::Result<(), FlushError>> + Send {
        (**self).flush(stream, records)
    }

    fn optimal_batch_size_bytes(&self) -> u64 {
        (**self).optimal_batch_size_bytes()
    }

    fn flush_threshold_bytes(&self) -> u64 {
        (**self).flush_threshold_bytes()
    }
}

/// Shared components the flush workers drive.
#[derive(Clone)]
pub struct FlushContext {
    pub dequeue: Arc<BufferDequeue>,
    pub workers: Arc<RunningFlushWorkers>,
    pub states: Arc<GlobalStateManager>,
    pub clock: Arc<dyn Clock>,
    /// Signalled by the enqueue gateway after each write.
    pub wake: Arc<Notify>,
}

#[derive(Debug, Clone)]
struct FlushFailure {
    stream: StreamDescriptor,
    attempts: u32,
    source: FlushError,
}

impl From<FlushFailure> for BufferError {
    fn from(failure: FlushFailure) -> Self {
        BufferError::FlushFailed {
            stream: failure.stream,
            attempts: failure.attempts,
            source: failure.source,
        }
    }
}

pub struct FlushWorkers<F: FlushFunction> {
    flusher: Arc<F>,
    context: FlushContext,
    detect: Arc<DetectStreamToFlush>,
    batch_bytes: u64,
    batch_records: usize,
    task_timeout: Duration,
    max_retries: u32,
    retry_policy: BufferConfig,
    evaluation_interval: Duration,
    checkpoints: mpsc::UnboundedSender<Checkpoint>,
    /// Serialises checkpoint emission so the channel sees arrival order.
    emit_lock: Mutex<()>,
    failure: Mutex<Option<FlushFailure>>,
    /// Cancelled once, on the first terminal flush failure.
    failed: CancellationToken,
    stop: CancellationToken,
    tasks: TaskTracker,
}

impl<F: FlushFunction> FlushWorkers<F> {
    pub fn new(
        flusher: Arc<F>,
        context: FlushContext,
        config: &BufferConfig,
        checkpoints: mpsc::UnboundedSender<Checkpoint>,
    ) -> Self {
        let detect = Arc::new(DetectStreamToFlush::new(
            Arc::clone(&context.dequeue),
            Arc::clone(&context.workers),
            Arc::clone(&context.clock),
            config,
            flusher.flush_threshold_bytes(),
        ));
        Self {
            batch_bytes: flusher.optimal_batch_size_bytes(),
            batch_records: config.max_batch_records.unwrap_or(usize::MAX),
            task_timeout: config.flush_task_timeout(),
            max_retries: config.flush_max_retries,
            retry_policy: config.clone(),
            evaluation_interval: config.evaluation_interval(),
            flusher,
            context,
            detect,
            checkpoints,
            emit_lock: Mutex::new(()),
            failure: Mutex::new(None),
            failed: CancellationToken::new(),
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn detector(&self) -> &Arc<DetectStreamToFlush> {
        &self.detect
    }

    /// # Start
    ///
    /// Spawns the supervisor loop. It runs until `cancel` fires, until
    /// [`close`](Self::close) is called or until a flush fails for good, and
    /// resolves to the first flush failure if there was one.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.evaluation_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval = ?this.evaluation_interval,
                global_ceiling = this.context.workers.global_ceiling(),
                "flush supervisor started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = this.stop.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = this.context.wake.notified() => {}
                }
                this.dispatch_ready();
            }

            info!("flush supervisor stopped");
            this.check_failure()
        })
    }

    /// # Dispatch Ready
    ///
    /// One evaluation cycle: spawns a flush task for every triggered stream
    /// that can get a worker slot. Returns how many tasks were spawned.
    ///
    /// States registered after their records were already flushed are
    /// emitted here as well.
    pub fn dispatch_ready(self: &Arc<Self>) -> usize {
        self.emit_checkpoints();
        if self.context.dequeue.waiting_producers() > 0 {
            self.context.dequeue.reclaim_idle_quota();
        }

        let mut dispatched = 0;
        for (stream, reason) in self.detect.streams_to_flush() {
            if self.failure.lock().is_some() {
                break;
            }
            let Some(slot) = self.context.workers.try_acquire(&stream) else {
                continue;
            };
            let Some(batch) = self
                .context
                .dequeue
                .take(&stream, self.batch_bytes, self.batch_records)
            else {
                continue;
            };
            self.spawn_flush(slot, batch, reason);
            dispatched += 1;
        }
        dispatched
    }

    fn spawn_flush(self: &Arc<Self>, slot: WorkerSlot, batch: RecordBatch, reason: TriggerReason) {
        debug!(
            stream = %batch.stream,
            %reason,
            records = batch.len(),
            bytes = batch.size_bytes,
            "dispatching flush"
        );
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.run_flush(slot, batch).await;
        });
    }

    async fn run_flush(&self, slot: WorkerSlot, batch: RecordBatch) {
        let outcome = self.flush_with_retries(&batch).await;

        match outcome {
            Ok(attempts) => {
                self.context.dequeue.release_batch(&batch);
                let watermark = self
                    .context
                    .states
                    .advance_watermark(&batch.stream, batch.tokens);
                self.context
                    .dequeue
                    .mark_flushed(&batch.stream, self.context.clock.now());
                info!(
                    stream = %batch.stream,
                    records = batch.len(),
                    bytes = batch.size_bytes,
                    attempts,
                    watermark,
                    "batch flushed"
                );
                self.emit_checkpoints();
            }
            Err(failure) => {
                error!(
                    stream = %failure.stream,
                    attempts = failure.attempts,
                    first_token = batch.tokens.first,
                    last_token = batch.tokens.last,
                    error = %failure.source,
                    "flush failed permanently"
                );
                self.context.states.mark_lost(&batch.stream, batch.tokens);
                self.failure.lock().get_or_insert(failure);
                self.failed.cancel();
                self.stop.cancel();
                // After the failure is visible, so woken producers see it.
                self.context.dequeue.release_batch(&batch);
            }
        }

        slot.release();
        self.context.wake.notify_one();
    }

    /// Calls the flush function until it succeeds, fails fatally or runs out
    /// of retries. Returns the number of attempts on success.
    async fn flush_with_retries(&self, batch: &RecordBatch) -> std::result::Result<u32, FlushFailure> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let attempt = self.flusher.flush(&batch.stream, &batch.records);
            let result = match tokio::time::timeout(self.task_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(FlushError::Transient(format!(
                    "flush did not complete within {:?}",
                    self.task_timeout
                ))),
            };

            match result {
                Ok(()) => return Ok(attempts),
                Err(err) if err.is_transient() && attempts <= self.max_retries => {
                    let delay = self.retry_policy.retry_delay(attempts);
                    warn!(
                        stream = %batch.stream,
                        attempt = attempts,
                        ?delay,
                        error = %err,
                        "flush attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(FlushFailure {
                        stream: batch.stream.clone(),
                        attempts,
                        source,
                    })
                }
            }
        }
    }

    /// Sends every checkpoint the current watermarks cover.
    fn emit_checkpoints(&self) {
        let _order = self.emit_lock.lock();
        for checkpoint in self.context.states.take_committed() {
            debug!(
                stream = %checkpoint.stream,
                bound_token = checkpoint.bound_token,
                "checkpoint committed"
            );
            if self.checkpoints.send(checkpoint).is_err() {
                debug!("checkpoint receiver dropped");
            }
        }
    }

    /// `Err` with the first terminal flush failure, if one happened.
    pub fn check_failure(&self) -> Result<()> {
        match self.failure.lock().clone() {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }

    /// Resolves once a flush has failed for good.
    pub async fn failed(&self) {
        self.failed.cancelled().await
    }

    /// # Close
    ///
    /// Stops the supervisor and flushes every buffered record, whatever its
    /// trigger state, then waits for all flush tasks. Returns the first
    /// flush failure of the whole run, if any.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.stop.cancel();
        self.detect.set_closing();
        info!(
            buffered_bytes = self.context.dequeue.total_buffered_bytes(),
            "flushing all streams before shutdown"
        );

        loop {
            if self.failure.lock().is_some() {
                break;
            }
            self.dispatch_ready();
            if self.context.dequeue.buffered_streams().is_empty()
                && self.context.workers.total_in_flight() == 0
            {
                break;
            }
            tokio::select! {
                _ = self.context.wake.notified() => {}
                _ = tokio::time::sleep(CLOSE_POLL_INTERVAL) => {}
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        self.emit_checkpoints();
        self.check_failure()
    }

    /// Flush tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.context.workers.total_in_flight()
    }
}
