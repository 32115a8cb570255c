//! # Buffer Configuration
//!
//! Tunables for the memory budget, the flush triggers, flush concurrency and
//! the retry policy. Every field has a default so partial JSON files are valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const MIB: u64 = 1024 * 1024;

/// Size of one memory block handed to a stream buffer when it grows.
pub const DEFAULT_BLOCK_SIZE_BYTES: u64 = 10 * MIB;
/// Default global buffering budget.
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * MIB;
/// Default time trigger: five minutes without a flush.
pub const DEFAULT_TIME_TRIGGER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
/// # Buffer Config
///
/// All durations are expressed in milliseconds on the wire and exposed as
/// [`Duration`] through accessor methods.
pub struct BufferConfig {
    /// Global ceiling for all stream quotas plus in-flight batches.
    pub max_memory_bytes: u64,
    /// Growth unit requested from the memory manager when a buffer is full.
    pub block_size_bytes: u64,
    /// Quota granted to a stream buffer when it is first created.
    pub initial_stream_quota_bytes: u64,
    /// A stream is size-triggered once its buffered bytes reach this share of its own quota.
    pub size_trigger_fraction: f64,
    /// Global usage ratio at which every non-empty stream is flushed eagerly.
    pub eager_flush_memory_ratio: f64,
    /// Maximum time a stream may go without a flush.
    pub time_trigger_ms: u64,
    /// Flushes allowed in flight for a single stream.
    pub per_stream_concurrency: usize,
    /// Flushes allowed in flight across all streams.
    pub global_concurrency: usize,
    /// Wait bound for a blocked memory allocation.
    pub allocate_timeout_ms: u64,
    /// Wait bound for a single flush attempt.
    pub flush_task_timeout_ms: u64,
    /// Retries after the first failed attempt before a batch is abandoned.
    pub flush_max_retries: u32,
    /// First retry delay; doubled on each further retry.
    pub retry_base_delay_ms: u64,
    /// Upper bound for the retry delay.
    pub retry_max_delay_ms: u64,
    /// Period of the flush supervisor when no enqueue wakes it earlier.
    pub evaluation_interval_ms: u64,
    /// Period of the queue info report.
    pub report_interval_ms: u64,
    /// Optional cap on the number of records in one batch.
    pub max_batch_records: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
            initial_stream_quota_bytes: DEFAULT_BLOCK_SIZE_BYTES,
            size_trigger_fraction: 0.8,
            eager_flush_memory_ratio: 0.9,
            time_trigger_ms: DEFAULT_TIME_TRIGGER.as_millis() as u64,
            per_stream_concurrency: 1,
            global_concurrency: 5,
            allocate_timeout_ms: 60_000,
            flush_task_timeout_ms: 600_000,
            flush_max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            evaluation_interval_ms: 1_000,
            report_interval_ms: 60_000,
            max_batch_records: None,
        }
    }
}

impl BufferConfig {
    /// Checks cross-field constraints.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memory_bytes == 0 {
            return Err(invalid("maxMemoryBytes", "must be greater than zero"));
        }
        if self.block_size_bytes == 0 {
            return Err(invalid("blockSizeBytes", "must be greater than zero"));
        }
        if self.initial_stream_quota_bytes > self.max_memory_bytes {
            return Err(invalid(
                "initialStreamQuotaBytes",
                format!(
                    "{} exceeds maxMemoryBytes {}",
                    self.initial_stream_quota_bytes, self.max_memory_bytes
                ),
            ));
        }
        if !(self.size_trigger_fraction > 0.0 && self.size_trigger_fraction <= 1.0) {
            return Err(invalid("sizeTriggerFraction", "must be in (0, 1]"));
        }
        if !(self.eager_flush_memory_ratio > 0.0 && self.eager_flush_memory_ratio <= 1.0) {
            return Err(invalid("eagerFlushMemoryRatio", "must be in (0, 1]"));
        }
        if self.per_stream_concurrency == 0 {
            return Err(invalid("perStreamConcurrency", "must be at least 1"));
        }
        if self.global_concurrency == 0 {
            return Err(invalid("globalConcurrency", "must be at least 1"));
        }
        if self.per_stream_concurrency > self.global_concurrency {
            return Err(invalid(
                "perStreamConcurrency",
                "cannot exceed globalConcurrency",
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(invalid("retryBaseDelayMs", "cannot exceed retryMaxDelayMs"));
        }
        if self.evaluation_interval_ms == 0 {
            return Err(invalid("evaluationIntervalMs", "must be greater than zero"));
        }
        if self.report_interval_ms == 0 {
            return Err(invalid("reportIntervalMs", "must be greater than zero"));
        }
        if self.max_batch_records == Some(0) {
            return Err(invalid("maxBatchRecords", "must be at least 1 when set"));
        }
        Ok(())
    }

    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    /// I/O, parse and validation failures.
    #[cfg(feature = "configs")]
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BufferConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn time_trigger(&self) -> Duration {
        Duration::from_millis(self.time_trigger_ms)
    }

    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_millis(self.allocate_timeout_ms)
    }

    pub fn flush_task_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_task_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// Backoff before retry number `retry` (1-based), capped at the max delay.
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BufferConfig::default();
        config.validate().unwrap();
        assert_eq!(config.time_trigger(), Duration::from_secs(300));
        assert_eq!(config.per_stream_concurrency, 1);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: BufferConfig =
            serde_json::from_str(r#"{"maxMemoryBytes": 4096, "initialStreamQuotaBytes": 1024}"#)
                .unwrap();
        assert_eq!(config.max_memory_bytes, 4096);
        assert_eq!(config.initial_stream_quota_bytes, 1024);
        assert_eq!(config.block_size_bytes, DEFAULT_BLOCK_SIZE_BYTES);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let config = BufferConfig {
            size_trigger_fraction: 1.5,
            ..BufferConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "sizeTriggerFraction", .. })
        ));

        let config = BufferConfig {
            per_stream_concurrency: 6,
            global_concurrency: 5,
            ..BufferConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BufferConfig {
            max_memory_bytes: 100,
            initial_stream_quota_bytes: 200,
            ..BufferConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = BufferConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 350,
            ..BufferConfig::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(350));
        assert_eq!(config.retry_delay(30), Duration::from_millis(350));
    }

    #[cfg(feature = "configs")]
    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        std::fs::write(&path, r#"{"globalConcurrency": 8, "timeTriggerMs": 1000}"#).unwrap();
        let config = BufferConfig::from_json_file(&path).unwrap();
        assert_eq!(config.global_concurrency, 8);
        assert_eq!(config.time_trigger(), Duration::from_secs(1));
    }
}
