use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use lib_asyncbuf::loggers::{LoggingOptions, init_logging};
use lib_asyncbuf::{
    AsyncStreamConsumer, BufferConfig, BufferedRecord, FlushError, FlushFunction, IncomingMessage,
    IncomingRecord, StreamDescriptor, display_bytes,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Pushes synthetic records through the buffer subsystem", long_about = None)]
struct Args {
    /// Number of concurrent streams
    #[clap(short, long, default_value_t = 8)]
    streams: usize,

    /// Records produced per stream
    #[clap(short, long, default_value_t = 100_000)]
    records: u64,

    /// Accounted size of one record in bytes
    #[clap(long, default_value_t = 512)]
    record_size: u64,

    /// Simulated destination latency per batch
    #[clap(long, default_value_t = 20)]
    flush_delay_ms: u64,

    /// Global buffer memory in MiB
    #[clap(long, default_value_t = 64)]
    max_memory_mb: u64,

    /// Report interval in seconds
    #[clap(long, default_value_t = 5)]
    report_interval_secs: u64,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: String,
}

/// Destination that only sleeps and counts.
#[derive(Default)]
struct SleepySink {
    delay: Duration,
    records: AtomicU64,
    bytes: AtomicU64,
    batches: AtomicU64,
}

impl FlushFunction for SleepySink {
    fn flush(
        &self,
        _stream: &StreamDescriptor,
        records: &[BufferedRecord],
    ) -> impl Future<Output = Result<(), FlushError>> + Send {
        let count = records.len() as u64;
        let bytes: u64 = records.iter().map(|r| r.size_bytes).sum();
        async move {
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.records.fetch_add(count, Ordering::Relaxed);
            self.bytes.fetch_add(bytes, Ordering::Relaxed);
            self.batches.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn optimal_batch_size_bytes(&self) -> u64 {
        4 * 1024 * 1024
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&LoggingOptions {
        level: args.log_level.clone(),
        ..LoggingOptions::default()
    })
    .context("failed to set up logging")?;

    let sink = Arc::new(SleepySink {
        delay: Duration::from_millis(args.flush_delay_ms),
        ..SleepySink::default()
    });
    let config = BufferConfig {
        max_memory_bytes: args.max_memory_mb * 1024 * 1024,
        evaluation_interval_ms: 100,
        report_interval_ms: args.report_interval_secs * 1_000,
        ..BufferConfig::default()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = Arc::new(AsyncStreamConsumer::new(config, Arc::clone(&sink), tx)?);
    consumer.start()?;

    let checkpoints = tokio::spawn(async move {
        let mut received = 0u64;
        while rx.recv().await.is_some() {
            received += 1;
        }
        received
    });

    let started = Instant::now();
    let stop_reporter = CancellationToken::new();
    let reporter = {
        let sink = Arc::clone(&sink);
        let consumer = Arc::clone(&consumer);
        let stop = stop_reporter.clone();
        let period = Duration::from_secs(args.report_interval_secs.max(1));
        tokio::spawn(async move {
            let mut last_records = 0u64;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = sleep(period) => {}
                }
                let records = sink.records.load(Ordering::Relaxed);
                let rate = (records - last_records) as f64 / period.as_secs_f64();
                last_records = records;

                println!("\n----- Throughput Summary -----");
                println!("Elapsed: {:.1}s", started.elapsed().as_secs_f64());
                println!("Flushed: {} records in {} batches ({})",
                    records,
                    sink.batches.load(Ordering::Relaxed),
                    display_bytes(sink.bytes.load(Ordering::Relaxed)));
                println!("Rate: {:.0} records/s", rate);
                println!("{}", consumer.queue_info());
                println!("------------------------------\n");
            }
        })
    };

    let producers: Vec<_> = (0..args.streams)
        .map(|i| {
            let consumer = Arc::clone(&consumer);
            let stream = StreamDescriptor::with_namespace("bench", format!("stream_{i:03}"));
            let (records, record_size) = (args.records, args.record_size);
            tokio::spawn(async move {
                for n in 1..=records {
                    let message = IncomingMessage::Record {
                        stream: stream.clone(),
                        record: IncomingRecord::new(json!({ "n": n }), record_size),
                    };
                    consumer.accept(message).await?;
                    if n % 10_000 == 0 {
                        consumer
                            .accept(IncomingMessage::State {
                                stream: stream.clone(),
                                state: json!({ "cursor": n }),
                            })
                            .await?;
                    }
                }
                anyhow::Ok(())
            })
        })
        .collect();

    for producer in producers {
        producer.await.context("producer panicked")??;
    }
    let produced_in = started.elapsed();
    consumer.close().await?;
    let total = started.elapsed();

    stop_reporter.cancel();
    reporter.await.context("reporter panicked")?;
    drop(consumer);
    let received = checkpoints.await.context("checkpoint reader panicked")?;

    let records = sink.records.load(Ordering::Relaxed);
    println!("\n========== Final ==========");
    println!("Produced in {:.2}s, drained in {:.2}s", produced_in.as_secs_f64(), total.as_secs_f64());
    println!("Records flushed: {} ({})", records, display_bytes(sink.bytes.load(Ordering::Relaxed)));
    println!("Batches: {}", sink.batches.load(Ordering::Relaxed));
    println!("Checkpoints: {}", received);
    println!("Average: {:.0} records/s", records as f64 / total.as_secs_f64());
    println!("===========================");
    Ok(())
}
