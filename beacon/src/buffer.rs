use bytes::Bytes;
use uuid::Uuid;

use crate::event::EventContext;
use crate::mapping::{MappingError, Record};

/// A serialized record plus what the sinks need to route it. Built once
/// per event and shared by every sink through an `Arc`.
#[derive(Clone, Debug)]
pub struct RecordBuffer {
    pub id: Uuid,
    /// Party id of the visitor, every buffer of one visitor lands on the
    /// same sink worker.
    pub partition_key: String,
    pub session_id: String,
    pub request_start_time: i64,
    pub client_utc_offset: i64,
    pub corrupt: bool,
    pub duplicate: bool,
    /// JSON encoding of the record
    pub payload: Bytes,
}

impl RecordBuffer {
    pub fn from_record(
        context: &EventContext,
        record: &Record,
        corrupt: bool,
        duplicate: bool,
    ) -> Result<Self, MappingError> {
        let payload = serde_json::to_vec(record).map_err(MappingError::Serialization)?;
        Ok(Self {
            id: Uuid::now_v7(),
            partition_key: context.party_id.clone(),
            session_id: context.session_id.clone(),
            request_start_time: context.request_start_time,
            client_utc_offset: context.client_utc_offset,
            corrupt,
            duplicate,
            payload: Bytes::from(payload),
        })
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
