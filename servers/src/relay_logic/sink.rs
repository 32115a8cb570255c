//! File destination: one append-only `.jsonl` file per stream.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use lib_asyncbuf::core::flush_workers::DEFAULT_OPTIMAL_BATCH_SIZE_BYTES;
use lib_asyncbuf::{BufferedRecord, FlushError, FlushFunction, StreamDescriptor};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct JsonlFileSink {
    out_dir: PathBuf,
    batch_size_bytes: u64,
}

impl JsonlFileSink {
    pub fn new(out_dir: impl Into<PathBuf>, batch_size_bytes: Option<u64>) -> Self {
        Self {
            out_dir: out_dir.into(),
            batch_size_bytes: batch_size_bytes.unwrap_or(DEFAULT_OPTIMAL_BATCH_SIZE_BYTES),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// `<out_dir>/<namespace>.<name>.jsonl`, path separators replaced.
    pub fn path_for(&self, stream: &StreamDescriptor) -> PathBuf {
        let file_name: String = stream
            .to_string()
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.out_dir.join(format!("{file_name}.jsonl"))
    }

    async fn append(&self, stream: &StreamDescriptor, records: &[BufferedRecord]) -> Result<(), FlushError> {
        match fs::metadata(&self.out_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(FlushError::Fatal(format!(
                    "{} is not a directory",
                    self.out_dir.display()
                )));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FlushError::Fatal(format!(
                    "output directory {} does not exist",
                    self.out_dir.display()
                )));
            }
            Err(e) => return Err(FlushError::Transient(e.to_string())),
        }

        let mut chunk = Vec::new();
        for record in records {
            serde_json::to_writer(&mut chunk, &record.payload)
                .map_err(|e| FlushError::Fatal(format!("unserializable record: {e}")))?;
            chunk.push(b'\n');
        }

        let path = self.path_for(stream);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| FlushError::Transient(format!("open {}: {e}", path.display())))?;
        let start_len = file
            .metadata()
            .await
            .map_err(|e| FlushError::Transient(format!("stat {}: {e}", path.display())))?
            .len();

        let written = match file.write_all(&chunk).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Ok(()),
            Err(cause) => Err(roll_back(&file, &path, start_len, cause).await),
        }
    }
}

/// Cuts `file` back to `len` after a failed append, so a retry never sees a
/// torn or duplicated batch. The batch is only retried if that worked.
async fn roll_back(file: &File, path: &Path, len: u64, cause: io::Error) -> FlushError {
    match file.set_len(len).await {
        Ok(()) => {
            warn!(path = %path.display(), len, error = %cause, "append failed; file rolled back");
            FlushError::Transient(format!("write {}: {cause}", path.display()))
        }
        Err(e) => FlushError::Fatal(format!(
            "write {} failed ({cause}) and could not be rolled back: {e}",
            path.display()
        )),
    }
}

impl FlushFunction for JsonlFileSink {
    fn flush(
        &self,
        stream: &StreamDescriptor,
        records: &[BufferedRecord],
    ) -> impl Future<Output = Result<(), FlushError>> + Send {
        self.append(stream, records)
    }

    fn optimal_batch_size_bytes(&self) -> u64 {
        self.batch_size_bytes
    }
}
