//! Partitioned asynchronous delivery to one kind of sink.
//!
//! The pool runs a fixed set of workers, each owning a bounded queue and a
//! flusher. A partition key always hashes to the same worker, which gives
//! per-key ordering while different keys are flushed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use health::{HealthHandle, HealthRegistry};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::RecordBuffer;
use crate::sinks::retry::RetryPolicy;
use crate::sinks::{EnqueueError, Flusher, QueuedRecord, RecordSink, SinkError};

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub workers: usize,
    pub queue_size: usize,
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_size: 1000,
            max_batch_size: 100,
            flush_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ProcessingPool<F: Flusher> {
    name: String,
    senders: Vec<mpsc::Sender<QueuedRecord>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    _flusher: PhantomData<fn() -> F>,
}

impl<F: Flusher> ProcessingPool<F> {
    /// Starts the workers, building one flusher per worker index.
    pub fn start<M>(
        name: &str,
        settings: PoolSettings,
        liveness: &HealthRegistry,
        mut make_flusher: M,
    ) -> Result<Self, SinkError>
    where
        M: FnMut(usize) -> Result<F, SinkError>,
    {
        let workers = settings.workers.max(1);
        let shutdown = CancellationToken::new();
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        info!("starting {} pool with {} workers", name, workers);
        for index in 0..workers {
            let (sender, receiver) = mpsc::channel(settings.queue_size.max(1));
            let worker = Worker {
                sink: name.to_string(),
                index,
                receiver,
                flusher: make_flusher(index)?,
                batch: Vec::with_capacity(settings.max_batch_size),
                settings: settings.clone(),
                // A worker reports on every flush interval tick, unless a
                // flush is stuck retrying
                liveness: liveness.register(
                    format!("{name}_worker_{index}"),
                    settings.flush_interval * 4 + Duration::from_secs(10),
                ),
                shutdown: shutdown.clone(),
            };
            senders.push(sender);
            handles.push(tokio::spawn(worker.run()));
        }

        Ok(Self {
            name: name.to_string(),
            senders,
            shutdown,
            handles: Mutex::new(handles),
            _flusher: PhantomData,
        })
    }

    fn worker_for(&self, partition_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Stops accepting records, then waits for every worker to flush what
    /// it already queued.
    pub async fn shutdown(&self) {
        info!("shutting down {} pool", self.name);
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("{} pool worker panicked during shutdown: {}", self.name, e);
            }
        }
    }
}

#[async_trait]
impl<F: Flusher> RecordSink for ProcessingPool<F> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        partition_key: &str,
        buffer: Arc<RecordBuffer>,
    ) -> Result<(), EnqueueError> {
        if self.shutdown.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        let record = QueuedRecord {
            partition_key: partition_key.to_string(),
            buffer,
        };
        self.senders[self.worker_for(partition_key)]
            .send(record)
            .await
            .map_err(|_| EnqueueError::Closed)?;

        counter!("beacon_sink_enqueued_total", "sink" => self.name.clone()).increment(1);
        Ok(())
    }

    fn try_enqueue(
        &self,
        partition_key: &str,
        buffer: Arc<RecordBuffer>,
    ) -> Result<(), EnqueueError> {
        if self.shutdown.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        let record = QueuedRecord {
            partition_key: partition_key.to_string(),
            buffer,
        };
        self.senders[self.worker_for(partition_key)]
            .try_send(record)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Saturated,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            })?;

        counter!("beacon_sink_enqueued_total", "sink" => self.name.clone()).increment(1);
        Ok(())
    }

    async fn shutdown(&self) {
        ProcessingPool::shutdown(self).await
    }
}

struct Worker<F: Flusher> {
    sink: String,
    index: usize,
    receiver: mpsc::Receiver<QueuedRecord>,
    flusher: F,
    batch: Vec<QueuedRecord>,
    settings: PoolSettings,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl<F: Flusher> Worker<F> {
    async fn run(mut self) {
        debug!("{} worker {} started", self.sink, self.index);

        let mut interval = tokio::time::interval(self.settings.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                record = self.receiver.recv() => match record {
                    Some(record) => {
                        self.batch.push(record);
                        if self.batch.len() >= self.settings.max_batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => {
                    self.flush().await;
                    self.liveness.report_healthy();
                }
            }
        }

        // Refuse new records, but deliver everything already accepted
        self.receiver.close();
        while let Some(record) = self.receiver.recv().await {
            self.batch.push(record);
            if self.batch.len() >= self.settings.max_batch_size {
                self.flush().await;
            }
        }
        self.flush().await;

        if let Err(e) = self.flusher.close().await {
            error!("{} worker {} failed to close its flusher: {}", self.sink, self.index, e);
        }
        debug!("{} worker {} shut down", self.sink, self.index);
    }

    /// Writes the current batch, retrying per the retry policy. A batch
    /// that can't be written is reported as failed, record by record.
    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match self.flusher.flush(&self.batch).await {
                Ok(()) => break Ok(()),
                Err(SinkError::Retryable(e)) if self.settings.retry.should_retry(attempts) => {
                    counter!("beacon_sink_flush_errors_total", "sink" => self.sink.clone())
                        .increment(1);
                    let backoff = self.settings.retry.time_until_next_retry(attempts - 1);
                    warn!(
                        sink = %self.sink,
                        worker = self.index,
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "flush failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    counter!("beacon_sink_flush_errors_total", "sink" => self.sink.clone())
                        .increment(1);
                    break Err(e);
                }
            }
        };

        match outcome {
            Ok(()) => {
                counter!("beacon_sink_flushed_total", "sink" => self.sink.clone())
                    .increment(self.batch.len() as u64);
                histogram!("beacon_sink_flush_batch_size").record(self.batch.len() as f64);
                self.liveness.report_healthy();
            }
            Err(e) => {
                for record in &self.batch {
                    error!(
                        sink = %self.sink,
                        partition_key = %record.partition_key,
                        buffer_id = %record.buffer.id,
                        attempts,
                        "failed to deliver record: {}",
                        e
                    );
                }
                counter!("beacon_sink_delivery_failures_total", "sink" => self.sink.clone())
                    .increment(self.batch.len() as u64);
            }
        }
        self.batch.clear();
    }
}
