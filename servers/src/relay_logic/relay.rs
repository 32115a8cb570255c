use anyhow::{Context, Result};
use lib_asyncbuf::{AsyncStreamConsumer, BufferError, Checkpoint, FlushFunction, IncomingMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{InputLine, OutputState};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub records: u64,
    pub states: u64,
    pub skipped: u64,
}

/// Feeds input lines into the consumer until EOF or `shutdown`.
///
/// Unparseable lines are skipped with a warning; any error from the consumer
/// ends the pump.
pub async fn pump<F, R>(
    consumer: &AsyncStreamConsumer<F>,
    input: R,
    shutdown: CancellationToken,
) -> Result<PumpStats>
where
    F: FlushFunction,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut stats = PumpStats::default();
    let mut line_no = 0u64;

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(line_no, "shutdown requested; stopping input");
                break;
            }
            next = lines.next_line() => next.context("failed to read input")?,
        };
        let Some(line) = line else {
            info!(line_no, "end of input");
            break;
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let message = match InputLine::parse(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(line_no, error = %e, "skipping malformed input line");
                stats.skipped += 1;
                continue;
            }
        };
        let is_record = matches!(message, IncomingMessage::Record { .. });

        match consumer.accept(message).await {
            Ok(()) if is_record => stats.records += 1,
            Ok(()) => stats.states += 1,
            Err(e @ BufferError::QuotaExceeded { .. }) => {
                return Err(e).with_context(|| format!("record on line {line_no} can never fit in memory"));
            }
            Err(e) => return Err(e).with_context(|| format!("failed to accept line {line_no}")),
        }
    }

    Ok(stats)
}

/// Writes committed checkpoints as JSON lines until the channel closes.
/// Returns the number of lines written and the writer.
pub async fn write_checkpoints<W>(
    mut checkpoints: mpsc::UnboundedReceiver<Checkpoint>,
    mut out: W,
) -> Result<(u64, W)>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(checkpoint) = checkpoints.recv().await {
        let mut line = serde_json::to_vec(&OutputState::from(&checkpoint))?;
        line.push(b'\n');
        out.write_all(&line).await.context("failed to write checkpoint")?;
        out.flush().await?;
        debug!(stream = %checkpoint.stream, bound_token = checkpoint.bound_token, "checkpoint written");
        written += 1;
    }
    Ok((written, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_logic::sink::JsonlFileSink;
    use lib_asyncbuf::BufferConfig;
    use serde_json::Value;

    const INPUT: &str = r#"{"type":"RECORD","stream":{"name":"users"},"data":{"id":1}}
{"type":"RECORD","stream":{"namespace":"shop","name":"orders"},"data":{"id":10}}
this line is not json

{"type":"RECORD","stream":{"name":"users"},"data":{"id":2}}
{"type":"STATE","stream":{"name":"users"},"data":{"cursor":2}}
"#;

    #[tokio::test]
    async fn relays_records_to_files_and_states_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = AsyncStreamConsumer::new(
            BufferConfig::default(),
            JsonlFileSink::new(dir.path(), None),
            tx,
        )
        .unwrap();
        consumer.start().unwrap();

        let stats = pump(&consumer, INPUT.as_bytes(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            stats,
            PumpStats {
                records: 3,
                states: 1,
                skipped: 1
            }
        );

        let writer = tokio::spawn(write_checkpoints(rx, Vec::new()));
        consumer.close().await.unwrap();
        drop(consumer);
        let (written, out) = writer.await.unwrap().unwrap();
        assert_eq!(written, 1);

        let line: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line["type"], "STATE");
        assert_eq!(line["data"]["cursor"], 2);
        assert_eq!(line["boundToken"], 2);

        let users = std::fs::read_to_string(dir.path().join("users.jsonl")).unwrap();
        assert_eq!(users, "{\"id\":1}\n{\"id\":2}\n");
        let orders = std::fs::read_to_string(dir.path().join("shop.orders.jsonl")).unwrap();
        assert_eq!(orders, "{\"id\":10}\n");
    }

    #[tokio::test]
    async fn cancelled_pump_stops_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = AsyncStreamConsumer::new(
            BufferConfig::default(),
            JsonlFileSink::new(dir.path(), None),
            tx,
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = pump(&consumer, INPUT.as_bytes(), shutdown).await.unwrap();
        assert_eq!(stats, PumpStats::default());
        consumer.close().await.unwrap();
    }
}
