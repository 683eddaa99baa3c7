use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::sinks::{Flusher, QueuedRecord, SinkError};

/// Appends records as JSON lines to files under a directory. Every worker
/// writes its own files, and a file is rolled over once it grows past
/// `roll_size` bytes.
pub struct FileFlusher {
    directory: PathBuf,
    worker: usize,
    roll_size: u64,
    current: Option<OpenFile>,
}

struct OpenFile {
    path: PathBuf,
    file: File,
    written: u64,
}

impl FileFlusher {
    pub fn new(directory: &Path, worker: usize, roll_size: u64) -> Result<Self, SinkError> {
        std::fs::create_dir_all(directory).map_err(|e| {
            SinkError::Fatal(format!("can't create {}: {}", directory.display(), e))
        })?;
        Ok(Self {
            directory: directory.to_path_buf(),
            worker,
            roll_size,
            current: None,
        })
    }

    async fn open(&self) -> std::io::Result<OpenFile> {
        let path = self
            .directory
            .join(format!("beacon-{}-{}.jsonl", self.worker, Uuid::now_v7()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("writing records to {}", path.display());
        Ok(OpenFile {
            path,
            file,
            written: 0,
        })
    }

    async fn write(&mut self, batch: &[QueuedRecord]) -> std::io::Result<()> {
        let mut current = match self.current.take() {
            Some(current) => current,
            None => self.open().await?,
        };

        let mut lines = Vec::new();
        for record in batch {
            lines.extend_from_slice(&record.buffer.payload);
            lines.push(b'\n');
        }
        current.file.write_all(&lines).await?;
        current.file.flush().await?;
        current.written += lines.len() as u64;

        if current.written >= self.roll_size {
            current.file.sync_all().await?;
            debug!("rolled over {}", current.path.display());
        } else {
            self.current = Some(current);
        }
        Ok(())
    }
}

#[async_trait]
impl Flusher for FileFlusher {
    async fn flush(&mut self, batch: &[QueuedRecord]) -> Result<(), SinkError> {
        // A failed write leaves no open file behind, the retry starts a new one
        self.write(batch)
            .await
            .map_err(|e| SinkError::Retryable(format!("file write failed: {e}")))
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(current) = self.current.take() {
            current
                .file
                .sync_all()
                .await
                .map_err(|e| SinkError::Fatal(format!("file sync failed: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::buffer::RecordBuffer;

    fn record(payload: &str) -> QueuedRecord {
        QueuedRecord {
            partition_key: "0:party".to_string(),
            buffer: Arc::new(RecordBuffer {
                id: Uuid::now_v7(),
                partition_key: "0:party".to_string(),
                session_id: "0:session".to_string(),
                request_start_time: 0,
                client_utc_offset: 0,
                corrupt: false,
                duplicate: false,
                payload: Bytes::copy_from_slice(payload.as_bytes()),
            }),
        }
    }

    fn files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut flusher = FileFlusher::new(dir.path(), 0, 1 << 20).unwrap();

        flusher
            .flush(&[record(r#"{"a":1}"#), record(r#"{"a":2}"#)])
            .await
            .unwrap();
        flusher.flush(&[record(r#"{"a":3}"#)]).await.unwrap();
        flusher.close().await.unwrap();

        let files = files(dir.path());
        assert_eq!(files.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&files[0]).unwrap(),
            "{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n"
        );
    }

    #[tokio::test]
    async fn rolls_over_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut flusher = FileFlusher::new(dir.path(), 3, 10).unwrap();

        for n in 0..3 {
            flusher
                .flush(&[record(&format!(r#"{{"n":{n},"pad":"xxxx"}}"#))])
                .await
                .unwrap();
        }
        flusher.close().await.unwrap();

        let files = files(dir.path());
        assert_eq!(files.len(), 3);
        for file in &files {
            assert!(file
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("beacon-3-"));
        }
        let mut contents: Vec<_> = files
            .iter()
            .map(|f| std::fs::read_to_string(f).unwrap())
            .collect();
        contents.sort();
        assert_eq!(
            contents,
            vec![
                "{\"n\":0,\"pad\":\"xxxx\"}\n",
                "{\"n\":1,\"pad\":\"xxxx\"}\n",
                "{\"n\":2,\"pad\":\"xxxx\"}\n",
            ]
        );
    }
}
