//! Per event admission: checksum, duplicate detection, mapping, then
//! fan-out of the serialized record to every configured sink.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{debug, error, instrument, warn};

use crate::buffer::RecordBuffer;
use crate::checksum::ChecksumVerifier;
use crate::config::MappingConfig;
use crate::duplicates::{DuplicateKey, DuplicateMemory};
use crate::event::{AdmittedEvent, EventContext};
use crate::mapping::{MappingError, Record, RecordMapper};
use crate::prometheus::report_dropped_events;
use crate::sinks::RecordSink;

/// What the caller should do with its event source after an event was
/// handled. The pipeline only ever asks to continue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessingDirective {
    Continue,
    Pause,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Corrupt,
    Duplicate,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Corrupt => "corrupt",
            DropReason::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug)]
pub enum EventOutcome {
    /// Enqueued into `sinks` sinks, of which `failed_sinks` refused it.
    Dispatched { sinks: usize, failed_sinks: usize },
    Dropped(DropReason),
    Failed(MappingError),
}

/// Notified once for every event that gets mapped, before it is handed to
/// the sinks. Errors and panics are logged and do not stop the dispatch.
pub trait IncomingEventListener: Send + Sync {
    fn incoming_event(
        &self,
        context: &EventContext,
        record: &Record,
        buffer: &RecordBuffer,
    ) -> anyhow::Result<()>;
}

pub struct EventPipeline {
    checksum: ChecksumVerifier,
    duplicates: DuplicateMemory,
    mapper: Arc<dyn RecordMapper + Send + Sync>,
    sinks: Vec<Arc<dyn RecordSink>>,
    listener: Option<Arc<dyn IncomingEventListener>>,
    discard_corrupted: bool,
    discard_duplicates: bool,
}

impl EventPipeline {
    pub fn new(
        config: &MappingConfig,
        mapper: Arc<dyn RecordMapper + Send + Sync>,
        sinks: Vec<Arc<dyn RecordSink>>,
    ) -> Self {
        Self {
            checksum: ChecksumVerifier::new(config.checksum_param.clone()),
            duplicates: DuplicateMemory::new(config.duplicate_memory_size),
            mapper,
            sinks,
            listener: None,
            discard_corrupted: config.discard_corrupted,
            discard_duplicates: config.discard_duplicates,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn IncomingEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn sinks(&self) -> &[Arc<dyn RecordSink>] {
        &self.sinks
    }

    pub async fn process(&self, context: &EventContext) -> ProcessingDirective {
        self.admit(context).await;
        ProcessingDirective::Continue
    }

    #[instrument(skip_all, fields(party_id = %context.party_id, event_id = %context.event_id))]
    pub async fn admit(&self, context: &EventContext) -> EventOutcome {
        counter!("beacon_events_received_total").increment(1);

        let corrupt = !context.has_identity() || !self.checksum.verify(&context.query);
        if corrupt && self.discard_corrupted {
            debug!("dropping corrupt event");
            report_dropped_events(DropReason::Corrupt.as_str(), 1);
            return EventOutcome::Dropped(DropReason::Corrupt);
        }

        // Without the full identity every incomplete event would share a key
        let duplicate = context.has_identity()
            && self
                .duplicates
                .check_and_remember(DuplicateKey::from(context));
        if duplicate && self.discard_duplicates {
            debug!("dropping duplicate event");
            report_dropped_events(DropReason::Duplicate.as_str(), 1);
            return EventOutcome::Dropped(DropReason::Duplicate);
        }

        let event = AdmittedEvent {
            context,
            corrupt,
            duplicate,
        };
        let (record, buffer) = match self.map(&event) {
            Ok(mapped) => mapped,
            Err(e) => {
                counter!("beacon_mapping_failures_total").increment(1);
                error!(
                    party_id = %context.party_id,
                    session_id = %context.session_id,
                    event_id = %context.event_id,
                    "failed to map event: {}",
                    e
                );
                return EventOutcome::Failed(e);
            }
        };
        histogram!("beacon_record_size_bytes").record(buffer.len() as f64);

        self.notify(context, &record, &buffer);
        let buffer = Arc::new(buffer);
        let failed_sinks = self.dispatch(&buffer).await;

        counter!("beacon_events_dispatched_total").increment(1);
        EventOutcome::Dispatched {
            sinks: self.sinks.len(),
            failed_sinks,
        }
    }

    fn map(&self, event: &AdmittedEvent) -> Result<(Record, RecordBuffer), MappingError> {
        let record = self.mapper.new_record_from_context(event)?;
        let buffer =
            RecordBuffer::from_record(event.context, &record, event.corrupt, event.duplicate)?;
        Ok((record, buffer))
    }

    fn notify(&self, context: &EventContext, record: &Record, buffer: &RecordBuffer) {
        let Some(listener) = &self.listener else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| {
            listener.incoming_event(context, record, buffer)
        })) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("incoming event listener failed: {:#}", e),
            Err(_) => error!("incoming event listener panicked"),
        }
    }

    /// Enqueues into all sinks at once, returns how many refused the buffer.
    async fn dispatch(&self, buffer: &Arc<RecordBuffer>) -> usize {
        let results = join_all(
            self.sinks
                .iter()
                .map(|sink| sink.enqueue(&buffer.partition_key, buffer.clone())),
        )
        .await;

        let mut failed = 0;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                counter!("beacon_sink_delivery_failures_total", "sink" => sink.name().to_string())
                    .increment(1);
                error!(
                    sink = sink.name(),
                    partition_key = %buffer.partition_key,
                    buffer_id = %buffer.id,
                    "failed to enqueue record: {}",
                    e
                );
            }
        }
        failed
    }
}
