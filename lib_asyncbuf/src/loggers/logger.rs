use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
/// # Logging Options
///
/// Where and how log events are written. Console output always goes to
/// stderr so stdout stays free for program output.
pub struct LoggingOptions {
    /// Default filter directive (`info`, `lib_asyncbuf=debug`, ...). `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of the human readable format.
    pub json: bool,
    /// Also write to a timestamped file in this directory.
    pub log_dir: Option<PathBuf>,
    /// File name prefix: `<prefix>_<timestamp>.log`.
    pub file_prefix: String,
    /// Older log files with the same prefix to keep besides the new one.
    pub keep_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_dir: None,
            file_prefix: "asyncbuf".to_string(),
            keep_files: 1,
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global `tracing` subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the life of the program.
///
/// # Errors
/// Fails if the log directory cannot be prepared or a global subscriber is
/// already installed.
pub fn init_logging(options: &LoggingOptions) -> io::Result<Option<WorkerGuard>> {
    let mut layers = Vec::new();

    let console = fmt::layer().with_writer(io::stderr).with_target(true);
    if options.json {
        layers.push(console.json().with_filter(env_filter(&options.level)).boxed());
    } else {
        layers.push(console.with_filter(env_filter(&options.level)).boxed());
    }

    let mut guard = None;
    if let Some(log_dir) = &options.log_dir {
        fs::create_dir_all(log_dir)?;
        cleanup_old_logs(log_dir, &options.file_prefix, options.keep_files)?;

        let file_name = format!(
            "{}_{}.log",
            options.file_prefix,
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let appender = tracing_appender::rolling::never(log_dir, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        let file = fmt::layer().with_writer(writer).with_ansi(false);
        if options.json {
            layers.push(file.json().with_filter(env_filter(&options.level)).boxed());
        } else {
            layers.push(file.with_filter(env_filter(&options.level)).boxed());
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(io::Error::other)?;
    Ok(guard)
}

/// Deletes `<prefix>_*.log` files in `log_dir`, keeping the `keep` newest.
pub fn cleanup_old_logs(log_dir: &Path, prefix: &str, keep: usize) -> io::Result<usize> {
    let name_prefix = format!("{prefix}_");
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let path = e.path();
            path.extension().is_some_and(|ext| ext == "log")
                && e.file_name().to_string_lossy().starts_with(&name_prefix)
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
