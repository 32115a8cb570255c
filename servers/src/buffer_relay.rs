//! # Buffer Relay
//!
//! Reads JSON lines from stdin, buffers records per stream under a global
//! memory budget and appends them to `<out_dir>/<stream>.jsonl`. Upstream
//! `STATE` lines are written back to stdout once every record before them
//! has been persisted.
//!
//! Stops at end of input, on Ctrl-C or on SIGTERM, flushing everything that
//! is still buffered.

use std::time::Duration;

use anyhow::{Context, Result};
use lib_asyncbuf::AsyncStreamConsumer;
use lib_asyncbuf::loggers::init_logging;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod relay_logic;
use relay_logic::{config, relay, sink::JsonlFileSink};

/// Grace period for blocking tasks at exit. A pending stdin read cannot be
/// cancelled and would otherwise keep the runtime alive after a signal.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start the tokio runtime")?;
    let outcome = runtime.block_on(run());
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    outcome
}

async fn run() -> Result<()> {
    let config = config::load_config()?;
    let _log_guard = init_logging(&config.logging_options()).context("failed to set up logging")?;

    let out_dir = config.out_dir();
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("failed to create output directory {}", out_dir.display()))?;
    let sink = JsonlFileSink::new(&out_dir, config.batch_size_bytes);
    info!(out_dir = %sink.out_dir().display(), "writing streams as JSON lines");

    let (checkpoint_tx, checkpoint_rx) = mpsc::unbounded_channel();
    let consumer = AsyncStreamConsumer::new(config.buffer_config(), sink, checkpoint_tx)?;
    consumer.start()?;
    info!("buffer relay started");

    let writer = tokio::spawn(relay::write_checkpoints(checkpoint_rx, tokio::io::stdout()));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let pumped = relay::pump(&consumer, BufReader::new(tokio::io::stdin()), shutdown).await;
    if let Err(e) = &pumped {
        error!(error = %format!("{e:#}"), "input stopped with an error");
    }

    let closed = consumer.close().await;
    // Dropping the consumer closes the checkpoint channel and ends the writer.
    drop(consumer);
    let (written, _) = writer.await.context("checkpoint writer panicked")??;

    let stats = pumped?;
    closed?;
    info!(
        records = stats.records,
        states = stats.states,
        skipped = stats.skipped,
        checkpoints = written,
        "Shutdown complete."
    );
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            info!("SIGTERM received, initiating shutdown.");
        }
    }
    shutdown.cancel();
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            error!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
