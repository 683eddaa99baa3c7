use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;

use crate::event::AdmittedEvent;
use crate::mapping::source::{Builtin, Source};
use crate::mapping::user_agent::UserAgentAttribute;
use crate::mapping::{
    FieldRules, MappingError, Record, RecordMapper, Schema, UserAgentParserAndCache, Value,
};

/// Version 1 mapping document:
///
/// ```json
/// {
///   "mapping": {
///     "location": "location",
///     "plan": {"event_parameter": "plan"},
///     "browser": {"user_agent": "family"},
///     "source": {"literal": "web"},
///     "productId": {"regex_group": {"regex": "/product/(?P<id>\\d+)", "field": "location", "group": "id"}}
///   }
/// }
/// ```
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MappingDocument {
    mapping: BTreeMap<String, RuleSpec>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleSpec {
    Builtin(String),
    Tagged(TaggedRule),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum TaggedRule {
    EventParameter(String),
    UserAgent(String),
    Literal(serde_json::Value),
    RegexGroup {
        regex: String,
        field: String,
        group: String,
    },
}

fn builtin(name: &str) -> Result<Source, MappingError> {
    Builtin::from_name(name)
        .map(Source::Builtin)
        .ok_or_else(|| MappingError::UnknownSource(name.to_string()))
}

impl TryFrom<RuleSpec> for Source {
    type Error = MappingError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        match spec {
            RuleSpec::Builtin(name) => builtin(&name),
            RuleSpec::Tagged(TaggedRule::EventParameter(name)) => Ok(Source::EventParameter(name)),
            RuleSpec::Tagged(TaggedRule::UserAgent(attribute)) => {
                UserAgentAttribute::from_name(&attribute)
                    .map(Source::UserAgent)
                    .ok_or_else(|| MappingError::UnknownSource(format!("user_agent.{attribute}")))
            }
            RuleSpec::Tagged(TaggedRule::Literal(literal)) => {
                let value = match literal {
                    serde_json::Value::Bool(b) => Value::Boolean(b),
                    serde_json::Value::String(s) => Value::String(s),
                    serde_json::Value::Number(n) => match n.as_i64() {
                        Some(l) => Value::Long(l),
                        None => Value::Double(n.as_f64().ok_or_else(|| {
                            MappingError::Rules(format!("unsupported literal {n}"))
                        })?),
                    },
                    other => {
                        return Err(MappingError::Rules(format!(
                            "unsupported literal {other}"
                        )))
                    }
                };
                Ok(Source::Literal(value))
            }
            RuleSpec::Tagged(TaggedRule::RegexGroup {
                regex,
                field,
                group,
            }) => {
                let regex = Regex::new(&regex)?;
                if !regex.capture_names().flatten().any(|name| name == group) {
                    return Err(MappingError::Rules(format!(
                        "regex {regex} has no group named {group}"
                    )));
                }
                Ok(Source::RegexGroup {
                    regex,
                    group,
                    source: Box::new(builtin(&field)?),
                })
            }
        }
    }
}

/// Declarative JSON mapping from schema fields to sources.
pub struct ConfigMapper {
    rules: FieldRules,
}

impl ConfigMapper {
    pub fn from_json(
        schema: Schema,
        document: &str,
        user_agents: UserAgentParserAndCache,
    ) -> Result<Self, MappingError> {
        let document: MappingDocument =
            serde_json::from_str(document).map_err(|e| MappingError::Rules(e.to_string()))?;

        let mappings = document
            .mapping
            .into_iter()
            .map(|(field, spec)| Ok((field, Source::try_from(spec)?)))
            .collect::<Result<Vec<_>, MappingError>>()?;

        Ok(Self {
            rules: FieldRules::new(schema, mappings, user_agents)?,
        })
    }
}

impl RecordMapper for ConfigMapper {
    fn new_record_from_context(&self, event: &AdmittedEvent) -> Result<Record, MappingError> {
        self.rules.apply(event)
    }

    fn schema(&self) -> &Schema {
        self.rules.schema()
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;
    use crate::event::{EventContext, QueryParams};

    fn schema() -> Schema {
        Schema::from_json(
            r#"{"name": "Custom", "fields": [
                {"name": "party", "type": "string", "required": true},
                {"name": "url", "type": "string"},
                {"name": "productId", "type": "long"},
                {"name": "plan", "type": "string"},
                {"name": "browser", "type": "string"},
                {"name": "channel", "type": "string"},
                {"name": "version", "type": "int"}
            ]}"#,
        )
        .unwrap()
    }

    fn mapper(document: &str) -> Result<ConfigMapper, MappingError> {
        ConfigMapper::from_json(schema(), document, UserAgentParserAndCache::with_rules(10))
    }

    #[test]
    fn map_with_every_kind_of_source() {
        let mapper = mapper(
            r#"{"mapping": {
                "party": "partyId",
                "url": "location",
                "productId": {"regex_group": {"regex": "/product/(?P<id>\\d+)", "field": "location", "group": "id"}},
                "plan": {"event_parameter": "plan"},
                "browser": {"user_agent": "family"},
                "channel": {"literal": "web"},
                "version": {"literal": 3}
            }}"#,
        )
        .unwrap();

        let context = EventContext {
            party_id: "0:party".to_string(),
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Firefox/121.0".to_string()),
            query: QueryParams::from_pairs([
                ("l", "https://shop.example/product/42?ref=home"),
                ("u", r#"{"plan": "pro"}"#),
            ]),
            ..Default::default()
        };
        let event = AdmittedEvent {
            context: &context,
            corrupt: false,
            duplicate: false,
        };

        let record = mapper.new_record_from_context(&event).unwrap();
        assert_json_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "party": "0:party",
                "url": "https://shop.example/product/42?ref=home",
                "productId": 42,
                "plan": "pro",
                "browser": "Firefox",
                "channel": "web",
                "version": 3
            })
        );
    }

    #[test]
    fn reject_bad_documents() {
        assert!(matches!(
            mapper(r#"{"mapping": {"party": "partyIdentifier"}}"#),
            Err(MappingError::UnknownSource(_))
        ));
        assert!(matches!(
            mapper(r#"{"mapping": {"party": "partyId", "nope": "location"}}"#),
            Err(MappingError::UnknownField(_))
        ));
        assert!(matches!(
            mapper(r#"{"mapping": {"party": "partyId", "browser": {"user_agent": "colour"}}}"#),
            Err(MappingError::UnknownSource(_))
        ));
        assert!(matches!(
            mapper(r#"{"mapping": {"party": "partyId", "version": {"literal": "three"}}}"#),
            Err(MappingError::TypeMismatch { .. })
        ));
        assert!(matches!(
            mapper(r#"{"mapping": {"party": "partyId", "url": {"regex_group": {"regex": "(", "field": "location", "group": "x"}}}}"#),
            Err(MappingError::Regex(_))
        ));
        assert!(matches!(
            mapper(r#"{"mapping": {"party": "partyId", "url": {"regex_group": {"regex": "(?P<a>.)", "field": "location", "group": "b"}}}}"#),
            Err(MappingError::Rules(_))
        ));
        assert!(matches!(
            mapper(r#"{"mappings": {}}"#),
            Err(MappingError::Rules(_))
        ));
        assert!(matches!(
            mapper(r#"{"mapping": {"url": "location"}}"#),
            Err(MappingError::MissingRequired(_))
        ));
    }
}
