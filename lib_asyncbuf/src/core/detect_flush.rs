//! # Flush Trigger Detector
//!
//! Decides, stream by stream, whether a flush should start now. A stream is
//! triggered when any of these hold:
//!
//! - **Size**: its buffered bytes reach `size_trigger_fraction` of its *own*
//!   quota, or the flush function's preferred threshold. Measuring against
//!   the stream's share rather than the global total keeps one busy stream
//!   from holding back the others.
//! - **Memory pressure**: the global ledger is at or above
//!   `eager_flush_memory_ratio`; every non-empty stream is flushed.
//! - **Time**: at least `time_trigger` has passed since its last successful
//!   flush (or since the detector started). The boundary is inclusive.
//! - **Closing**: the subsystem is shutting down.
//!
//! Empty streams are never triggered. A positive decision is downgraded to
//! [`TriggerReason::Saturated`] while the stream cannot get a worker slot,
//! which turns the level-triggered checks into one dispatch per stream at a
//! time.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use super::clock::Clock;
use super::dequeue::BufferDequeue;
use super::running_workers::RunningFlushWorkers;
use super::stream::StreamDescriptor;
use crate::configs::BufferConfig;

/// Why a stream was (or was not) selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TriggerReason {
    Size,
    MemoryPressure,
    Time,
    Closing,
    /// Nothing buffered.
    Empty,
    /// Triggered, but no worker slot is free.
    Saturated,
    NotTriggered,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            TriggerReason::Size => "size",
            TriggerReason::MemoryPressure => "memory-pressure",
            TriggerReason::Time => "time",
            TriggerReason::Closing => "closing",
            TriggerReason::Empty => "empty",
            TriggerReason::Saturated => "saturated",
            TriggerReason::NotTriggered => "not-triggered",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushDecision {
    pub triggered: bool,
    pub reason: TriggerReason,
}

impl FlushDecision {
    fn fire(reason: TriggerReason) -> Self {
        Self {
            triggered: true,
            reason,
        }
    }

    fn hold(reason: TriggerReason) -> Self {
        Self {
            triggered: false,
            reason,
        }
    }
}

pub struct DetectStreamToFlush {
    dequeue: Arc<BufferDequeue>,
    workers: Arc<RunningFlushWorkers>,
    clock: Arc<dyn Clock>,
    started_at: Instant,
    size_trigger_fraction: f64,
    flush_threshold_bytes: u64,
    eager_flush_memory_ratio: f64,
    time_trigger: Duration,
    closing: AtomicBool,
}

impl DetectStreamToFlush {
    pub fn new(
        dequeue: Arc<BufferDequeue>,
        workers: Arc<RunningFlushWorkers>,
        clock: Arc<dyn Clock>,
        config: &BufferConfig,
        flush_threshold_bytes: u64,
    ) -> Self {
        let started_at = clock.now();
        Self {
            dequeue,
            workers,
            clock,
            started_at,
            size_trigger_fraction: config.size_trigger_fraction,
            flush_threshold_bytes,
            eager_flush_memory_ratio: config.eager_flush_memory_ratio,
            time_trigger: config.time_trigger(),
            closing: AtomicBool::new(false),
        }
    }

    /// `true` once `now - last_flush >= time_trigger`.
    pub fn is_time_triggered(&self, last_flush: Instant) -> bool {
        self.clock.now().saturating_duration_since(last_flush) >= self.time_trigger
    }

    /// `true` once the stream is full enough relative to its own quota.
    pub fn is_size_triggered(&self, current_bytes: u64, allocated_quota: u64) -> bool {
        current_bytes > 0
            && (current_bytes as f64 >= self.size_trigger_fraction * allocated_quota as f64
                || current_bytes >= self.flush_threshold_bytes)
    }

    /// `true` while the global ledger is nearly full.
    pub fn is_under_memory_pressure(&self) -> bool {
        self.dequeue.global_usage_ratio() >= self.eager_flush_memory_ratio
    }

    /// Makes every non-empty stream eligible, for the final flush.
    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn last_flush_or_start(&self, stream: &StreamDescriptor) -> Instant {
        self.dequeue
            .last_flush(stream)
            .unwrap_or(self.started_at)
    }

    /// # Evaluate
    ///
    /// Trigger decision for one stream, including the saturation downgrade.
    pub fn evaluate(&self, stream: &StreamDescriptor) -> FlushDecision {
        if self.dequeue.queue_size_records(stream).unwrap_or(0) == 0 {
            return FlushDecision::hold(TriggerReason::Empty);
        }
        let bytes = self.dequeue.queue_size_bytes(stream).unwrap_or(0);
        let quota = self.dequeue.allocated_quota(stream).unwrap_or(0);

        let reason = if self.is_closing() {
            TriggerReason::Closing
        } else if self.is_size_triggered(bytes, quota) {
            TriggerReason::Size
        } else if self.is_under_memory_pressure() {
            TriggerReason::MemoryPressure
        } else if self.is_time_triggered(self.last_flush_or_start(stream)) {
            TriggerReason::Time
        } else {
            return FlushDecision::hold(TriggerReason::NotTriggered);
        };

        if self.workers.is_saturated(stream) {
            debug!(stream = %stream, %reason, "flush triggered but no worker slot is free");
            return FlushDecision::hold(TriggerReason::Saturated);
        }
        FlushDecision::fire(reason)
    }

    /// Non-empty streams, largest backlog first, then the longest unflushed,
    /// then by descriptor.
    pub fn streams_by_priority(&self) -> Vec<StreamDescriptor> {
        let mut candidates: Vec<_> = self
            .dequeue
            .buffered_streams()
            .into_iter()
            .map(|stream| {
                let bytes = self.dequeue.queue_size_bytes(&stream).unwrap_or(0);
                let last_flush = self.last_flush_or_start(&stream);
                (stream, bytes, last_flush)
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.cmp(&b.0))
        });
        candidates.into_iter().map(|(stream, _, _)| stream).collect()
    }

    /// Triggered streams in priority order with their reasons.
    pub fn streams_to_flush(&self) -> Vec<(StreamDescriptor, TriggerReason)> {
        self.streams_by_priority()
            .into_iter()
            .filter_map(|stream| {
                let decision = self.evaluate(&stream);
                decision.triggered.then_some((stream, decision.reason))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::memory_manager::GlobalMemoryManager;
    use crate::core::registry::BufferRegistry;
    use crate::core::stream_buffer::IncomingRecord;
    use serde_json::json;

    const FIVE_MIN: Duration = Duration::from_secs(5 * 60);
    const ONE_SEC: Duration = Duration::from_secs(1);

    struct Fixture {
        clock: Arc<ManualClock>,
        memory: Arc<GlobalMemoryManager>,
        registry: Arc<BufferRegistry>,
        workers: Arc<RunningFlushWorkers>,
        detect: DetectStreamToFlush,
    }

    fn fixture(max: u64, initial_quota: u64) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let memory = Arc::new(GlobalMemoryManager::new(max, Duration::from_secs(1)));
        let registry = Arc::new(BufferRegistry::new(Arc::clone(&memory), initial_quota));
        let dequeue = Arc::new(BufferDequeue::new(Arc::clone(&registry), Arc::clone(&memory)));
        let workers = Arc::new(RunningFlushWorkers::new(1, 4));
        let detect = DetectStreamToFlush::new(
            dequeue,
            Arc::clone(&workers),
            clock.clone(),
            &BufferConfig::default(),
            u64::MAX,
        );
        Fixture {
            clock,
            memory,
            registry,
            workers,
            detect,
        }
    }

    async fn fill(f: &Fixture, stream: &StreamDescriptor, records: usize, size: u64) {
        let buffer = f.registry.get_or_create(stream).await.unwrap();
        for _ in 0..records {
            buffer.try_push(IncomingRecord::new(json!({}), size)).unwrap();
        }
    }

    #[test]
    fn time_trigger_matches_reference_cases() {
        let f = fixture(1_000_000, 1_000);
        f.clock.advance(10 * FIVE_MIN);
        let now = f.clock.now();

        assert!(!f.detect.is_time_triggered(now));
        assert!(!f.detect.is_time_triggered(now - ONE_SEC));
        assert!(f.detect.is_time_triggered(now - FIVE_MIN));
    }

    #[test]
    fn time_trigger_boundary_is_inclusive() {
        let f = fixture(1_000_000, 1_000);
        let last_flush = f.clock.now();

        f.clock.advance(FIVE_MIN - Duration::from_millis(1));
        assert!(!f.detect.is_time_triggered(last_flush));
        f.clock.advance(Duration::from_millis(1));
        assert!(f.detect.is_time_triggered(last_flush));
    }

    #[tokio::test]
    async fn size_trigger_is_relative_to_own_quota() {
        let f = fixture(1_000_000, 1_200);
        let stream = StreamDescriptor::new("users");

        fill(&f, &stream, 9, 100).await;
        assert_eq!(
            f.detect.evaluate(&stream).reason,
            TriggerReason::NotTriggered
        );
        fill(&f, &stream, 1, 100).await;
        assert_eq!(f.detect.evaluate(&stream), FlushDecision::fire(TriggerReason::Size));
    }

    #[tokio::test]
    async fn empty_stream_never_triggers() {
        let f = fixture(1_000_000, 1_000);
        let stream = StreamDescriptor::new("idle");
        f.registry.get_or_create(&stream).await.unwrap();
        f.clock.advance(2 * FIVE_MIN);
        f.detect.set_closing();
        assert_eq!(f.detect.evaluate(&stream).reason, TriggerReason::Empty);
    }

    #[tokio::test]
    async fn time_trigger_counts_from_start_when_never_flushed() {
        let f = fixture(1_000_000, 10_000);
        let stream = StreamDescriptor::new("slow");
        fill(&f, &stream, 1, 10).await;

        assert!(!f.detect.evaluate(&stream).triggered);
        f.clock.advance(FIVE_MIN);
        assert_eq!(f.detect.evaluate(&stream), FlushDecision::fire(TriggerReason::Time));
    }

    #[tokio::test]
    async fn memory_pressure_flushes_small_streams() {
        let f = fixture(10_000, 1_000);
        let stream = StreamDescriptor::new("small");
        fill(&f, &stream, 1, 10).await;
        assert!(!f.detect.evaluate(&stream).triggered);

        f.memory.allocate(8_500).await.unwrap();
        assert!(f.detect.is_under_memory_pressure());
        assert_eq!(
            f.detect.evaluate(&stream),
            FlushDecision::fire(TriggerReason::MemoryPressure)
        );
    }

    #[tokio::test]
    async fn saturated_stream_is_not_dispatched() {
        let f = fixture(1_000_000, 1_000);
        let stream = StreamDescriptor::new("busy");
        fill(&f, &stream, 10, 100).await;
        assert!(f.detect.evaluate(&stream).triggered);

        let slot = f.workers.try_acquire(&stream).unwrap();
        let decision = f.detect.evaluate(&stream);
        assert!(!decision.triggered);
        assert_eq!(decision.reason, TriggerReason::Saturated);

        drop(slot);
        assert!(f.detect.evaluate(&stream).triggered);
    }

    #[tokio::test]
    async fn priority_prefers_larger_backlogs() {
        let f = fixture(1_000_000, 10_000);
        let small = StreamDescriptor::new("a_small");
        let large = StreamDescriptor::new("b_large");
        fill(&f, &small, 1, 10).await;
        fill(&f, &large, 5, 10).await;
        f.registry
            .get_or_create(&StreamDescriptor::new("c_empty"))
            .await
            .unwrap();

        assert_eq!(f.detect.streams_by_priority(), vec![large.clone(), small.clone()]);

        f.detect.set_closing();
        let selected = f.detect.streams_to_flush();
        assert_eq!(
            selected,
            vec![(large, TriggerReason::Closing), (small, TriggerReason::Closing)]
        );
    }
}
