use crate::event::AdmittedEvent;
use crate::mapping::source::{Builtin, Source};
use crate::mapping::user_agent::UserAgentAttribute;
use crate::mapping::{FieldRules, MappingError, Record, RecordMapper, Schema, UserAgentParserAndCache};

const BUILTIN_FIELDS: &[(&str, Builtin)] = &[
    ("detectedCorruption", Builtin::Corrupt),
    ("detectedDuplicate", Builtin::Duplicate),
    ("firstInSession", Builtin::FirstInSession),
    ("timestamp", Builtin::Timestamp),
    ("clientTimestamp", Builtin::ClientTimestamp),
    ("remoteHost", Builtin::RemoteHost),
    ("referer", Builtin::Referer),
    ("location", Builtin::Location),
    ("viewportPixelWidth", Builtin::ViewportPixelWidth),
    ("viewportPixelHeight", Builtin::ViewportPixelHeight),
    ("screenPixelWidth", Builtin::ScreenPixelWidth),
    ("screenPixelHeight", Builtin::ScreenPixelHeight),
    ("devicePixelRatio", Builtin::DevicePixelRatio),
    ("partyId", Builtin::PartyId),
    ("sessionId", Builtin::SessionId),
    ("pageViewId", Builtin::PageViewId),
    ("eventId", Builtin::EventId),
    ("eventType", Builtin::EventType),
    ("userAgentString", Builtin::UserAgentString),
];

const USER_AGENT_FIELDS: &[(&str, UserAgentAttribute)] = &[
    ("userAgentName", UserAgentAttribute::Name),
    ("userAgentFamily", UserAgentAttribute::Family),
    ("userAgentVendor", UserAgentAttribute::Vendor),
    ("userAgentType", UserAgentAttribute::Type),
    ("userAgentVersion", UserAgentAttribute::Version),
    ("userAgentDeviceCategory", UserAgentAttribute::DeviceCategory),
    ("userAgentOsFamily", UserAgentAttribute::OsFamily),
    ("userAgentOsVersion", UserAgentAttribute::OsVersion),
    ("userAgentOsVendor", UserAgentAttribute::OsVendor),
];

/// Fixed mapping onto the builtin schema, used when no mapping version is
/// configured.
pub struct DefaultMapper {
    rules: FieldRules,
}

impl DefaultMapper {
    pub fn new(user_agents: UserAgentParserAndCache) -> Result<Self, MappingError> {
        let mappings = BUILTIN_FIELDS
            .iter()
            .map(|(field, builtin)| (field.to_string(), Source::Builtin(*builtin)))
            .chain(
                USER_AGENT_FIELDS
                    .iter()
                    .map(|(field, attribute)| (field.to_string(), Source::UserAgent(*attribute))),
            )
            .collect();

        Ok(Self {
            rules: FieldRules::new(Schema::builtin(), mappings, user_agents)?,
        })
    }
}

impl RecordMapper for DefaultMapper {
    fn new_record_from_context(&self, event: &AdmittedEvent) -> Result<Record, MappingError> {
        self.rules.apply(event)
    }

    fn schema(&self) -> &Schema {
        self.rules.schema()
    }
}
