use std::cell::OnceCell;
use std::sync::Arc;

use regex::Regex;
use serde_json::Map;

use crate::event::AdmittedEvent;
use crate::mapping::schema::{FieldType, Value};
use crate::mapping::user_agent::{ReadableUserAgent, UserAgentAttribute, UserAgentParserAndCache};
use crate::utils::parse_base36;

/// Query parameter carrying custom event parameters as a JSON object.
pub const EVENT_PARAMETERS_PARAM: &str = "u";

/// Values every event carries, from the identifiers, the request itself
/// and the standard query parameters set by the tracking tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    Corrupt,
    Duplicate,
    FirstInSession,
    NewParty,
    Timestamp,
    ClientTimestamp,
    ClientUtcOffset,
    RemoteHost,
    Referer,
    Location,
    ViewportPixelWidth,
    ViewportPixelHeight,
    ScreenPixelWidth,
    ScreenPixelHeight,
    DevicePixelRatio,
    PartyId,
    SessionId,
    PageViewId,
    EventId,
    EventType,
    UserAgentString,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "corrupt" => Self::Corrupt,
            "duplicate" => Self::Duplicate,
            "firstInSession" => Self::FirstInSession,
            "newParty" => Self::NewParty,
            "timestamp" => Self::Timestamp,
            "clientTimestamp" => Self::ClientTimestamp,
            "clientUtcOffset" => Self::ClientUtcOffset,
            "remoteHost" => Self::RemoteHost,
            "referer" => Self::Referer,
            "location" => Self::Location,
            "viewportPixelWidth" => Self::ViewportPixelWidth,
            "viewportPixelHeight" => Self::ViewportPixelHeight,
            "screenPixelWidth" => Self::ScreenPixelWidth,
            "screenPixelHeight" => Self::ScreenPixelHeight,
            "devicePixelRatio" => Self::DevicePixelRatio,
            "partyId" => Self::PartyId,
            "sessionId" => Self::SessionId,
            "pageViewId" => Self::PageViewId,
            "eventId" => Self::EventId,
            "eventType" => Self::EventType,
            "userAgentString" => Self::UserAgentString,
            _ => return None,
        })
    }

    pub fn value_type(&self) -> FieldType {
        match self {
            Self::Corrupt | Self::Duplicate | Self::FirstInSession | Self::NewParty => {
                FieldType::Boolean
            }
            Self::Timestamp | Self::ClientTimestamp | Self::ClientUtcOffset => FieldType::Long,
            Self::ViewportPixelWidth
            | Self::ViewportPixelHeight
            | Self::ScreenPixelWidth
            | Self::ScreenPixelHeight => FieldType::Int,
            Self::DevicePixelRatio => FieldType::Double,
            _ => FieldType::String,
        }
    }

    fn evaluate(&self, ctx: &SourceContext) -> Option<Value> {
        let event = ctx.event;
        let context = event.context;
        let query = &context.query;
        let non_empty = |s: &str| (!s.is_empty()).then(|| Value::String(s.to_string()));
        let int_param = |name: &str| query.first(name)?.parse().ok().map(Value::Int);

        match self {
            Self::Corrupt => Some(Value::Boolean(event.corrupt)),
            Self::Duplicate => Some(Value::Boolean(event.duplicate)),
            Self::FirstInSession => Some(Value::Boolean(context.first_in_session)),
            Self::NewParty => Some(Value::Boolean(context.new_party)),
            Self::Timestamp => Some(Value::Long(context.request_start_time)),
            Self::ClientTimestamp => query.first("c").and_then(parse_base36).map(Value::Long),
            Self::ClientUtcOffset => Some(Value::Long(context.client_utc_offset)),
            Self::RemoteHost => Some(Value::String(context.remote_host.clone())),
            Self::Referer => query
                .first("r")
                .or(context.referer_header.as_deref())
                .and_then(non_empty),
            Self::Location => query.first("l").and_then(non_empty),
            Self::ViewportPixelWidth => int_param("w"),
            Self::ViewportPixelHeight => int_param("h"),
            Self::ScreenPixelWidth => int_param("i"),
            Self::ScreenPixelHeight => int_param("j"),
            Self::DevicePixelRatio => query
                .first("k")?
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite())
                .map(Value::Double),
            Self::PartyId => non_empty(&context.party_id),
            Self::SessionId => non_empty(&context.session_id),
            Self::PageViewId => non_empty(&context.page_view_id),
            Self::EventId => non_empty(&context.event_id),
            Self::EventType => query.first("t").and_then(non_empty),
            Self::UserAgentString => context.user_agent.as_deref().and_then(non_empty),
        }
    }
}

/// Where the value of one record field comes from.
#[derive(Clone, Debug)]
pub enum Source {
    Builtin(Builtin),
    EventParameter(String),
    UserAgent(UserAgentAttribute),
    Literal(Value),
    RegexGroup {
        regex: Regex,
        group: String,
        source: Box<Source>,
    },
}

impl Source {
    /// Type of the values this source produces, None when only known per
    /// event.
    pub fn value_type(&self) -> Option<FieldType> {
        match self {
            Source::Builtin(builtin) => Some(builtin.value_type()),
            Source::EventParameter(_) => None,
            Source::UserAgent(_) | Source::RegexGroup { .. } => Some(FieldType::String),
            Source::Literal(value) => Some(value.field_type()),
        }
    }

    pub fn evaluate(&self, ctx: &SourceContext) -> Option<Value> {
        match self {
            Source::Builtin(builtin) => builtin.evaluate(ctx),
            Source::EventParameter(name) => ctx.event_parameter(name),
            Source::UserAgent(attribute) => {
                let parsed = ctx.user_agent()?;
                Some(Value::String(parsed.attribute(*attribute).to_string()))
            }
            Source::Literal(value) => Some(value.clone()),
            Source::RegexGroup {
                regex,
                group,
                source,
            } => {
                let input = source.evaluate(ctx)?.to_string();
                let captured = regex.captures(&input)?.name(group)?;
                Some(Value::String(captured.as_str().to_string()))
            }
        }
    }
}

/// Per-event evaluation state. The user-agent breakdown and the custom
/// event parameters are only computed when a mapping asks for them.
pub struct SourceContext<'a> {
    pub event: AdmittedEvent<'a>,
    user_agents: &'a UserAgentParserAndCache,
    user_agent: OnceCell<Option<Arc<ReadableUserAgent>>>,
    event_parameters: OnceCell<Option<Map<String, serde_json::Value>>>,
}

impl<'a> SourceContext<'a> {
    pub fn new(event: AdmittedEvent<'a>, user_agents: &'a UserAgentParserAndCache) -> Self {
        Self {
            event,
            user_agents,
            user_agent: OnceCell::new(),
            event_parameters: OnceCell::new(),
        }
    }

    fn user_agent(&self) -> Option<&Arc<ReadableUserAgent>> {
        self.user_agent
            .get_or_init(|| {
                let raw = self.event.context.user_agent.as_deref()?;
                Some(self.user_agents.parse(raw))
            })
            .as_ref()
    }

    fn event_parameter(&self, name: &str) -> Option<Value> {
        let parameters = self
            .event_parameters
            .get_or_init(|| {
                let raw = self.event.context.query.first(EVENT_PARAMETERS_PARAM)?;
                match serde_json::from_str(raw) {
                    Ok(serde_json::Value::Object(map)) => Some(map),
                    _ => None,
                }
            })
            .as_ref()?;

        match parameters.get(name)? {
            serde_json::Value::Bool(b) => Some(Value::Boolean(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(l) => Some(Value::Long(l)),
                None => n.as_f64().map(Value::Double),
            },
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Null => None,
            other => Some(Value::String(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventContext, QueryParams};

    fn context(query: &str) -> EventContext {
        EventContext {
            party_id: "0:party".to_string(),
            session_id: "0:session".to_string(),
            page_view_id: "0:pageview".to_string(),
            event_id: "0:pageview0".to_string(),
            request_start_time: 1_700_000_000_000,
            client_utc_offset: 60,
            remote_host: "127.0.0.1".to_string(),
            user_agent: Some(
                "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0"
                    .to_string(),
            ),
            referer_header: Some("https://tagged.example/".to_string()),
            query: QueryParams::parse(query).unwrap(),
            ..Default::default()
        }
    }

    fn eval(context: &EventContext, source: &Source) -> Option<Value> {
        let user_agents = UserAgentParserAndCache::with_rules(10);
        let event = AdmittedEvent {
            context,
            corrupt: false,
            duplicate: true,
        };
        source.evaluate(&SourceContext::new(event, &user_agents))
    }

    fn builtin(name: &str) -> Source {
        Source::Builtin(Builtin::from_name(name).unwrap())
    }

    #[test]
    fn builtins_read_tracking_parameters() {
        let ctx = context("l=https%3A%2F%2Fexample.com%2F&w=1024&h=768&i=abc&k=2.5&t=pageView&c=lq0a0ow0");

        assert_eq!(
            eval(&ctx, &builtin("location")),
            Some(Value::String("https://example.com/".to_string()))
        );
        assert_eq!(eval(&ctx, &builtin("viewportPixelWidth")), Some(Value::Int(1024)));
        assert_eq!(eval(&ctx, &builtin("viewportPixelHeight")), Some(Value::Int(768)));
        assert_eq!(eval(&ctx, &builtin("screenPixelWidth")), None);
        assert_eq!(eval(&ctx, &builtin("screenPixelHeight")), None);
        assert_eq!(eval(&ctx, &builtin("devicePixelRatio")), Some(Value::Double(2.5)));
        assert_eq!(
            eval(&ctx, &builtin("eventType")),
            Some(Value::String("pageView".to_string()))
        );
        assert_eq!(
            eval(&ctx, &builtin("clientTimestamp")),
            parse_base36("lq0a0ow0").map(Value::Long)
        );
        assert_eq!(eval(&ctx, &builtin("duplicate")), Some(Value::Boolean(true)));
        assert_eq!(eval(&ctx, &builtin("corrupt")), Some(Value::Boolean(false)));
        assert_eq!(
            eval(&ctx, &builtin("timestamp")),
            Some(Value::Long(1_700_000_000_000))
        );
    }

    #[test]
    fn referer_prefers_the_query_parameter() {
        let from_query = context("r=https%3A%2F%2Fsearch.example%2F");
        assert_eq!(
            eval(&from_query, &builtin("referer")),
            Some(Value::String("https://search.example/".to_string()))
        );

        let from_header = context("");
        assert_eq!(
            eval(&from_header, &builtin("referer")),
            Some(Value::String("https://tagged.example/".to_string()))
        );
    }

    #[test]
    fn event_parameters_come_from_json() {
        let ctx = context("u=%7B%22plan%22%3A%22pro%22%2C%22seats%22%3A5%2C%22ratio%22%3A0.5%2C%22trial%22%3Atrue%7D");

        assert_eq!(
            eval(&ctx, &Source::EventParameter("plan".to_string())),
            Some(Value::String("pro".to_string()))
        );
        assert_eq!(
            eval(&ctx, &Source::EventParameter("seats".to_string())),
            Some(Value::Long(5))
        );
        assert_eq!(
            eval(&ctx, &Source::EventParameter("ratio".to_string())),
            Some(Value::Double(0.5))
        );
        assert_eq!(
            eval(&ctx, &Source::EventParameter("trial".to_string())),
            Some(Value::Boolean(true))
        );
        assert_eq!(eval(&ctx, &Source::EventParameter("missing".to_string())), None);

        let malformed = context("u=not-json");
        assert_eq!(eval(&malformed, &Source::EventParameter("plan".to_string())), None);
    }

    #[test]
    fn user_agent_and_regex_group() {
        let ctx = context("l=https%3A%2F%2Fshop.example%2Fproduct%2F42");

        assert_eq!(
            eval(&ctx, &Source::UserAgent(UserAgentAttribute::Family)),
            Some(Value::String("Firefox".to_string()))
        );

        let product = Source::RegexGroup {
            regex: Regex::new(r"/product/(?P<id>\d+)").unwrap(),
            group: "id".to_string(),
            source: Box::new(builtin("location")),
        };
        assert_eq!(eval(&ctx, &product), Some(Value::String("42".to_string())));

        let elsewhere = context("l=https%3A%2F%2Fshop.example%2Fcart");
        assert_eq!(eval(&elsewhere, &product), None);
    }
}
