//! Memory-bounded per-stream buffering and flush scheduling for
//! asynchronous destinations.
//!
//! Producers hand records to an [`AsyncStreamConsumer`](crate::core::AsyncStreamConsumer);
//! the consumer keeps them in per-stream queues under a global byte budget,
//! flushes each stream when it is large enough, old enough or when memory
//! runs short, and releases upstream checkpoints once every record they
//! cover has been persisted.

// Declare the modules to re-export
pub mod configs;
pub mod core;
pub mod error;
#[cfg(feature = "loggers")]
pub mod loggers;

// Re-export everything
pub use configs::BufferConfig;
pub use crate::core::*;
pub use error::{BufferError, ConfigError, FlushError, Result};
