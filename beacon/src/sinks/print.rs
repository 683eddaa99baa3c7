use async_trait::async_trait;
use tracing::info;

use crate::sinks::{Flusher, QueuedRecord, SinkError};

/// Logs records instead of writing them anywhere, for local debugging.
pub struct PrintFlusher;

#[async_trait]
impl Flusher for PrintFlusher {
    async fn flush(&mut self, batch: &[QueuedRecord]) -> Result<(), SinkError> {
        for record in batch {
            info!(
                partition_key = %record.partition_key,
                buffer_id = %record.buffer.id,
                "record: {}",
                String::from_utf8_lossy(&record.buffer.payload)
            );
        }
        Ok(())
    }
}
