//! # Error Types
//!
//! Every fallible operation in the crate returns [`BufferError`]. The taxonomy
//! separates configuration-level failures (never retried), local backpressure
//! failures (the caller may back off and retry) and terminal flush failures
//! (escalated to the whole sync).

use std::time::Duration;

use thiserror::Error;

use crate::core::stream::StreamDescriptor;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BufferError>;

#[derive(Debug, Error)]
/// # Buffer Error
///
/// Failures surfaced by the memory manager, the gateways and the flush workers.
pub enum BufferError {
    /// A single allocation request can never fit in the global budget.
    #[error("requested {requested} bytes but the global memory maximum is {max} bytes")]
    QuotaExceeded {
        /// Bytes asked for.
        requested: u64,
        /// Configured global maximum.
        max: u64,
    },

    /// A blocked allocation was not served within its wait bound.
    #[error("timed out after {waited:?} waiting for {requested} bytes of buffer memory")]
    AllocationTimeout {
        /// Bytes asked for.
        requested: u64,
        /// How long the caller waited.
        waited: Duration,
    },

    /// An enqueue could not obtain more quota for its stream.
    #[error("stream {stream} could not grow its buffer within {waited:?}")]
    CapacityExceeded {
        /// Stream whose buffer is full.
        stream: StreamDescriptor,
        /// How long the producer was blocked.
        waited: Duration,
    },

    /// A batch could not be persisted; its records are reported as lost.
    #[error("flush of stream {stream} failed after {attempts} attempt(s): {source}")]
    FlushFailed {
        /// Stream whose batch failed.
        stream: StreamDescriptor,
        /// Number of flush attempts made, retries included.
        attempts: u32,
        /// Last error returned by the flush function.
        #[source]
        source: FlushError,
    },

    /// The subsystem is shutting down and no longer accepts input.
    #[error("the buffer subsystem is closed")]
    Closed,

    /// The configuration is not usable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BufferError {
    /// Whether the caller may back off and try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BufferError::AllocationTimeout { .. } | BufferError::CapacityExceeded { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// # Flush Error
///
/// Outcome reported by a [`FlushFunction`](crate::core::flush_workers::FlushFunction)
/// when a batch was not persisted.
pub enum FlushError {
    /// Temporary failure; the same batch is retried.
    #[error("transient flush error: {0}")]
    Transient(String),
    /// Unrecoverable failure; the batch is abandoned and the sync fails.
    #[error("fatal flush error: {0}")]
    Fatal(String),
}

impl FlushError {
    /// `true` for [`FlushError::Transient`].
    pub fn is_transient(&self) -> bool {
        matches!(self, FlushError::Transient(_))
    }
}

#[derive(Debug, Error)]
/// # Config Error
///
/// Rejected or unreadable [`BufferConfig`](crate::configs::BufferConfig) values.
pub enum ConfigError {
    /// A field holds a value outside its accepted range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field (camelCase, as written in config files).
        field: &'static str,
        /// Human readable explanation.
        reason: String,
    },

    /// The config file could not be read.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The config file is not valid JSON for `BufferConfig`.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
