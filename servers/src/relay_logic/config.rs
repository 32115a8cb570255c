use anyhow::{Context, Result};
use clap::Parser;
use lib_asyncbuf::BufferConfig;
use lib_asyncbuf::loggers::LoggingOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "buffer_relay.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Buffers JSON-lines records per stream and flushes them to files", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_OUT_DIR", help = "Directory the per-stream .jsonl files are written to.")]
    pub out_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files. Console only when unset.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RELAY_LOG_JSON", help = "Write logs as JSON lines (true/false).")]
    pub log_json: Option<bool>,

    #[clap(long, env = "RELAY_MAX_MEMORY_BYTES", help = "Global buffering budget in bytes.")]
    pub max_memory_bytes: Option<u64>,

    #[clap(long, env = "RELAY_BLOCK_SIZE_BYTES", help = "Quota growth unit per stream buffer in bytes.")]
    pub block_size_bytes: Option<u64>,

    #[clap(long, env = "RELAY_TIME_TRIGGER_MS", help = "Flush a stream after this many milliseconds without a flush.")]
    pub time_trigger_ms: Option<u64>,

    #[clap(long, env = "RELAY_GLOBAL_CONCURRENCY", help = "Maximum flushes in flight across all streams.")]
    pub global_concurrency: Option<usize>,

    #[clap(long, env = "RELAY_FLUSH_MAX_RETRIES", help = "Retries of a failed batch before the relay gives up.")]
    pub flush_max_retries: Option<u32>,

    #[clap(long, env = "RELAY_REPORT_INTERVAL_MS", help = "Interval in milliseconds between queue reports.")]
    pub report_interval_ms: Option<u64>,

    #[clap(long, env = "RELAY_BATCH_SIZE_BYTES", help = "Preferred size of one file append in bytes.")]
    pub batch_size_bytes: Option<u64>,

    /// Full buffer tuning; only settable from the config file.
    #[clap(skip)]
    pub buffer: Option<BufferConfig>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            out_dir: other.out_dir.or(self.out_dir),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            max_memory_bytes: other.max_memory_bytes.or(self.max_memory_bytes),
            block_size_bytes: other.block_size_bytes.or(self.block_size_bytes),
            time_trigger_ms: other.time_trigger_ms.or(self.time_trigger_ms),
            global_concurrency: other.global_concurrency.or(self.global_concurrency),
            flush_max_retries: other.flush_max_retries.or(self.flush_max_retries),
            report_interval_ms: other.report_interval_ms.or(self.report_interval_ms),
            batch_size_bytes: other.batch_size_bytes.or(self.batch_size_bytes),
            buffer: other.buffer.or(self.buffer),
        }
    }

    /// Buffer settings: the file's `buffer` section, then the flat overrides.
    pub fn buffer_config(&self) -> BufferConfig {
        let mut buffer = self.buffer.clone().unwrap_or_default();
        if let Some(v) = self.max_memory_bytes {
            buffer.max_memory_bytes = v;
        }
        if let Some(v) = self.block_size_bytes {
            buffer.block_size_bytes = v;
            buffer.initial_stream_quota_bytes = v;
        }
        if let Some(v) = self.time_trigger_ms {
            buffer.time_trigger_ms = v;
        }
        if let Some(v) = self.global_concurrency {
            buffer.global_concurrency = v;
        }
        if let Some(v) = self.flush_max_retries {
            buffer.flush_max_retries = v;
        }
        if let Some(v) = self.report_interval_ms {
            buffer.report_interval_ms = v;
        }
        buffer
    }

    pub fn logging_options(&self) -> LoggingOptions {
        LoggingOptions {
            level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
            json: self.log_json.unwrap_or(false),
            log_dir: self.log_dir.clone(),
            file_prefix: "buffer_relay".to_string(),
            ..LoggingOptions::default()
        }
    }

    pub fn out_dir(&self) -> PathBuf {
        self.out_dir.clone().unwrap_or_else(|| PathBuf::from("./out"))
    }
}

fn defaults() -> Config {
    Config {
        out_dir: Some(PathBuf::from("./out")),
        log_level: Some("info".to_string()),
        log_json: Some(false),
        ..Default::default()
    }
}

fn read_config_file(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Layers defaults, the JSON config file and the CLI/environment values.
///
/// A missing config file is not an error; an unreadable or malformed one is.
pub fn resolve_config(cli: Config) -> Result<Config> {
    // 1. Defaults
    let mut current = defaults();

    // 2. Config file, if present
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if config_file_path.exists() {
        current = current.merge(read_config_file(&config_file_path)?);
    }

    // 3. CLI arguments and environment variables
    current = current.merge(cli);

    current
        .buffer_config()
        .validate()
        .context("invalid buffer configuration")?;
    Ok(current)
}

pub fn load_config() -> Result<Config> {
    resolve_config(Config::parse())
}
