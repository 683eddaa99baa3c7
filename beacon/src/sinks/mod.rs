use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::buffer::RecordBuffer;

pub mod file;
pub mod kafka;
pub mod pool;
pub mod print;
pub mod retry;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("retryable sink error: {0}")]
    Retryable(String),
    #[error("non-retryable sink error: {0}")]
    Fatal(String),
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("sink queue is full")]
    Saturated,
    #[error("sink is shut down")]
    Closed,
}

/// A destination for record buffers. Buffers sharing a partition key are
/// delivered in the order they were enqueued.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    /// Waits for queue capacity, so a slow sink slows down its producers
    /// instead of losing records.
    async fn enqueue(
        &self,
        partition_key: &str,
        buffer: Arc<RecordBuffer>,
    ) -> Result<(), EnqueueError>;

    /// Enqueues only if there is room right away.
    fn try_enqueue(&self, partition_key: &str, buffer: Arc<RecordBuffer>)
        -> Result<(), EnqueueError>;

    /// Stops accepting buffers and waits for queued ones to be written.
    async fn shutdown(&self) {}
}

#[derive(Clone, Debug)]
pub struct QueuedRecord {
    pub partition_key: String,
    pub buffer: Arc<RecordBuffer>,
}

/// Writes batches to one downstream system. Each pool worker owns its own
/// flusher, so implementations can keep per-worker state.
#[async_trait]
pub trait Flusher: Send + 'static {
    /// Writes the whole batch. On error the same batch may be handed in
    /// again, so writes must tolerate being repeated.
    async fn flush(&mut self, batch: &[QueuedRecord]) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
