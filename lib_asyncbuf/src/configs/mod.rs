//! # Configuration Modules
//!
//! Buffering, trigger and concurrency tunables consumed by the core.

/// Memory budget, trigger thresholds, concurrency ceilings and retry policy.
pub mod config_buffer;

pub use config_buffer::BufferConfig;
