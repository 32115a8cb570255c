/// `tracing` subscriber setup with console, JSON and file output.
pub mod logger;

pub use logger::{cleanup_old_logs, init_logging, LoggingOptions};
