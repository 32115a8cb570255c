//! # Queue Diagnostics
//!
//! Point-in-time snapshot of the buffering subsystem: the global ledger, one
//! line per stream buffer and the state manager's backlog. [`QueueReporter`]
//! logs the snapshot periodically so an operator can see which stream is
//! holding memory.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::memory_manager::GlobalMemoryManager;
use super::registry::BufferRegistry;
use super::running_workers::RunningFlushWorkers;
use super::state_manager::GlobalStateManager;
use super::stream::StreamDescriptor;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// Human readable byte count, rounded down to the largest whole unit.
pub fn display_bytes(bytes: u64) -> String {
    if bytes >= GB {
        format!("{} GB", bytes / GB)
    } else if bytes >= MB {
        format!("{} MB", bytes / MB)
    } else if bytes >= KB {
        format!("{} KB", bytes / KB)
    } else {
        format!("{bytes} B")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQueueInfo {
    pub stream: StreamDescriptor,
    pub records: usize,
    pub buffered_bytes: u64,
    pub allocated_quota: u64,
    pub in_flight: usize,
    pub watermark: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub max_bytes: u64,
    pub allocated_bytes: u64,
    pub percent_used: f64,
    pub streams: Vec<StreamQueueInfo>,
    pub pending_checkpoints: usize,
    pub state_summary: String,
}

impl QueueInfo {
    /// Reads every component once. Streams are listed in descriptor order.
    pub fn collect(
        memory: &GlobalMemoryManager,
        registry: &BufferRegistry,
        workers: &RunningFlushWorkers,
        states: &GlobalStateManager,
    ) -> Self {
        let streams = registry
            .buffers()
            .iter()
            .map(|buffer| {
                let stream = buffer.descriptor().clone();
                StreamQueueInfo {
                    records: buffer.len(),
                    buffered_bytes: buffer.current_bytes(),
                    allocated_quota: buffer.allocated_quota(),
                    in_flight: workers.in_flight(&stream),
                    watermark: states.query_watermark(&stream),
                    stream,
                }
            })
            .collect();

        Self {
            max_bytes: memory.max_bytes(),
            allocated_bytes: memory.allocated_bytes(),
            percent_used: memory.usage_percent(),
            streams,
            pending_checkpoints: states.pending_checkpoints(),
            state_summary: states.memory_usage_message(),
        }
    }
}

impl fmt::Display for QueueInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ASYNC QUEUE INFO] Global: max: {}, allocated: {} ({:.2} MB), % used: {:.2}",
            display_bytes(self.max_bytes),
            display_bytes(self.allocated_bytes),
            self.allocated_bytes as f64 / MB as f64,
            self.percent_used,
        )?;
        for stream in &self.streams {
            write!(
                f,
                " | Queue `{}`, num records: {}, num bytes: {}, allocated bytes: {}, in flight: {}, watermark: {}",
                stream.stream,
                stream.records,
                display_bytes(stream.buffered_bytes),
                display_bytes(stream.allocated_quota),
                stream.in_flight,
                stream.watermark,
            )?;
        }
        write!(f, " | {}", self.state_summary)
    }
}

/// Logs a [`QueueInfo`] snapshot on a fixed period.
pub struct QueueReporter {
    memory: Arc<GlobalMemoryManager>,
    registry: Arc<BufferRegistry>,
    workers: Arc<RunningFlushWorkers>,
    states: Arc<GlobalStateManager>,
}

impl QueueReporter {
    pub fn new(
        memory: Arc<GlobalMemoryManager>,
        registry: Arc<BufferRegistry>,
        workers: Arc<RunningFlushWorkers>,
        states: Arc<GlobalStateManager>,
    ) -> Self {
        Self {
            memory,
            registry,
            workers,
            states,
        }
    }

    pub fn snapshot(&self) -> QueueInfo {
        QueueInfo::collect(&self.memory, &self.registry, &self.workers, &self.states)
    }

    /// Logs a snapshot immediately and then every `period` until `cancel`.
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        info!("{}", self.snapshot());
                    }
                }
            }
        })
    }
}
