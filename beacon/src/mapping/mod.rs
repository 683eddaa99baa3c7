//! Conversion of admitted events into schema records.
//!
//! Three strategies exist, picked once at startup by the mapping version:
//! the built-in default mapping, declarative JSON rules (version 1) and the
//! mapping script (version 2). They all compile down to a list of
//! field/source pairs that is validated against the schema before the
//! first event is mapped.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::MappingConfig;
use crate::event::AdmittedEvent;

pub mod config;
pub mod default;
pub mod schema;
pub mod script;
pub mod source;
pub mod user_agent;

pub use config::ConfigMapper;
pub use default::DefaultMapper;
pub use schema::{FieldType, Record, Schema, SchemaError, Value};
pub use script::ScriptMapper;
pub use source::{Builtin, Source, SourceContext};
pub use user_agent::{UserAgentAttribute, UserAgentParserAndCache};

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("unsupported schema mapping version {0}")]
    UnsupportedVersion(u32),
    #[error("schema mapping version {0} needs a mapping rules path")]
    MissingRules(u32),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("failed to read mapping rules from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid mapping rules: {0}")]
    Rules(String),
    #[error("invalid mapping script at line {line}: {message}")]
    Script { line: usize, message: String },
    #[error("field {0} is not part of the schema")]
    UnknownField(String),
    #[error("field {0} is mapped more than once")]
    DuplicateMapping(String),
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("value for field {field} can't be converted to {expected:?}")]
    TypeMismatch { field: String, expected: FieldType },
    #[error("required field {0} has no value")]
    MissingRequired(String),
    #[error("failed to serialize record: {0}")]
    Serialization(serde_json::Error),
}

pub trait RecordMapper {
    fn new_record_from_context(&self, event: &AdmittedEvent) -> Result<Record, MappingError>;

    fn schema(&self) -> &Schema;
}

/// Picks the mapping strategy for the configured version. Any error here
/// is fatal for the process.
pub fn mapper_from_config(
    config: &MappingConfig,
) -> Result<Arc<dyn RecordMapper + Send + Sync>, MappingError> {
    let user_agents = UserAgentParserAndCache::with_rules(config.user_agent_cache_size);

    let Some(version) = config.mapping_version else {
        info!("using built in default schema mapping");
        return Ok(Arc::new(DefaultMapper::new(user_agents)?));
    };

    let schema = match &config.mapping_schema_path {
        Some(path) => Schema::load(Path::new(path))?,
        None => Schema::builtin(),
    };
    let read_rules = || {
        let path = config
            .mapping_rules_path
            .as_deref()
            .ok_or(MappingError::MissingRules(version))?;
        std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.to_string(),
            source,
        })
    };

    match version {
        1 => {
            info!("using configuration based schema mapping");
            Ok(Arc::new(ConfigMapper::from_json(
                schema,
                &read_rules()?,
                user_agents,
            )?))
        }
        2 => {
            info!("using script based schema mapping");
            Ok(Arc::new(ScriptMapper::parse(
                schema,
                &read_rules()?,
                user_agents,
            )?))
        }
        other => Err(MappingError::UnsupportedVersion(other)),
    }
}

struct FieldRule {
    position: usize,
    name: String,
    field_type: FieldType,
    required: bool,
    source: Source,
}

/// Validated field/source pairs for one schema. Shared by every strategy.
pub struct FieldRules {
    schema: Arc<Schema>,
    rules: Vec<FieldRule>,
    user_agents: UserAgentParserAndCache,
}

impl FieldRules {
    pub fn new(
        schema: Schema,
        mappings: Vec<(String, Source)>,
        user_agents: UserAgentParserAndCache,
    ) -> Result<Self, MappingError> {
        let mut rules: Vec<FieldRule> = Vec::with_capacity(mappings.len());
        for (name, source) in mappings {
            let position = schema
                .position(&name)
                .ok_or_else(|| MappingError::UnknownField(name.clone()))?;
            if rules.iter().any(|r| r.position == position) {
                return Err(MappingError::DuplicateMapping(name));
            }
            let field = &schema.fields[position];

            let type_fits = match &source {
                Source::Literal(value) => value.clone().coerce(field.field_type).is_some(),
                other => other
                    .value_type()
                    .map_or(true, |from| convertible(from, field.field_type)),
            };
            if !type_fits {
                return Err(MappingError::TypeMismatch {
                    field: name,
                    expected: field.field_type,
                });
            }

            rules.push(FieldRule {
                position,
                name,
                field_type: field.field_type,
                required: field.required,
                source,
            });
        }

        if let Some(unmapped) = schema
            .fields
            .iter()
            .enumerate()
            .find(|(pos, f)| f.required && !rules.iter().any(|r| r.position == *pos))
        {
            return Err(MappingError::MissingRequired(unmapped.1.name.clone()));
        }

        Ok(Self {
            schema: Arc::new(schema),
            rules,
            user_agents,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Builds the record for one event. Values that can't be converted to
    /// their field type are left out of optional fields and fail the
    /// record for required ones.
    pub fn apply(&self, event: &AdmittedEvent) -> Result<Record, MappingError> {
        let ctx = SourceContext::new(*event, &self.user_agents);
        let mut values = vec![None; self.schema.fields.len()];

        for rule in &self.rules {
            let Some(value) = rule.source.evaluate(&ctx) else {
                continue;
            };
            match value.coerce(rule.field_type) {
                Some(value) => values[rule.position] = Some(value),
                None if rule.required => {
                    return Err(MappingError::TypeMismatch {
                        field: rule.name.clone(),
                        expected: rule.field_type,
                    })
                }
                None => debug!(field = %rule.name, "dropping value of the wrong type"),
            }
        }

        for rule in self.rules.iter().filter(|r| r.required) {
            if values[rule.position].is_none() {
                return Err(MappingError::MissingRequired(rule.name.clone()));
            }
        }

        Ok(Record::new(self.schema.clone(), values))
    }
}

fn convertible(from: FieldType, to: FieldType) -> bool {
    use FieldType::{Boolean, Double, Int, Long};

    match (from, to) {
        (_, FieldType::String) | (FieldType::String, _) => true,
        (from, to) if from == to => true,
        (Int, Long) | (Int, Double) | (Long, Int) | (Long, Double) => true,
        (Boolean, _) | (Double, _) | (Int, _) | (Long, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventContext, QueryParams};

    fn schema() -> Schema {
        Schema::from_json(
            r#"{"name": "Test", "fields": [
                {"name": "party", "type": "string", "required": true},
                {"name": "width", "type": "int"},
                {"name": "flag", "type": "boolean"}
            ]}"#,
        )
        .unwrap()
    }

    fn rules(mappings: Vec<(&str, Source)>) -> Result<FieldRules, MappingError> {
        FieldRules::new(
            schema(),
            mappings
                .into_iter()
                .map(|(name, source)| (name.to_string(), source))
                .collect(),
            UserAgentParserAndCache::with_rules(10),
        )
    }

    #[test]
    fn startup_validation() {
        let party = || ("party", Source::Builtin(Builtin::PartyId));

        assert!(matches!(
            rules(vec![party(), ("height", Source::Builtin(Builtin::ViewportPixelHeight))]),
            Err(MappingError::UnknownField(f)) if f == "height"
        ));
        assert!(matches!(
            rules(vec![party(), party()]),
            Err(MappingError::DuplicateMapping(_))
        ));
        assert!(matches!(
            rules(vec![party(), ("width", Source::Builtin(Builtin::Corrupt))]),
            Err(MappingError::TypeMismatch { .. })
        ));
        assert!(matches!(
            rules(vec![
                party(),
                ("width", Source::Literal(Value::String("wide".to_string())))
            ]),
            Err(MappingError::TypeMismatch { .. })
        ));
        assert!(matches!(
            rules(vec![("width", Source::Builtin(Builtin::ViewportPixelWidth))]),
            Err(MappingError::MissingRequired(f)) if f == "party"
        ));
        assert!(rules(vec![party()]).is_ok());
    }

    #[test]
    fn runtime_conversion() {
        let rules = rules(vec![
            ("party", Source::Builtin(Builtin::PartyId)),
            ("width", Source::EventParameter("width".to_string())),
            ("flag", Source::Literal(Value::String("true".to_string()))),
        ])
        .unwrap();

        let mut context = EventContext {
            party_id: "0:party".to_string(),
            query: QueryParams::from_pairs([("u", r#"{"width": "narrow"}"#)]),
            ..Default::default()
        };
        fn event(context: &EventContext) -> AdmittedEvent<'_> {
            AdmittedEvent {
                context,
                corrupt: false,
                duplicate: false,
            }
        }

        let record = rules.apply(&event(&context)).unwrap();
        assert_eq!(record.get("width"), None);
        assert_eq!(record.get("flag"), Some(&Value::Boolean(true)));

        context.query = QueryParams::from_pairs([("u", r#"{"width": 640}"#)]);
        let record = rules.apply(&event(&context)).unwrap();
        assert_eq!(record.get("width"), Some(&Value::Int(640)));

        context.party_id.clear();
        assert!(matches!(
            rules.apply(&event(&context)),
            Err(MappingError::MissingRequired(f)) if f == "party"
        ));
    }

    #[test]
    fn select_strategy_by_version() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("mapping.json");
        std::fs::write(&rules_path, r#"{"mapping": {"remoteHost": "remoteHost"}}"#).unwrap();
        let script_path = dir.path().join("mapping.script");
        std::fs::write(
            &script_path,
            "map remoteHost() onto 'remoteHost'\nmap timestamp() onto 'timestamp'\n",
        )
        .unwrap();

        let config = |version, path: Option<&Path>| MappingConfig {
            mapping_version: version,
            mapping_rules_path: path.map(|p| p.display().to_string()),
            ..MappingConfig::default()
        };

        assert!(mapper_from_config(&config(None, None)).is_ok());
        assert!(matches!(
            mapper_from_config(&config(Some(1), None)),
            Err(MappingError::MissingRules(1))
        ));
        assert!(matches!(
            mapper_from_config(&config(Some(3), Some(&rules_path))),
            Err(MappingError::UnsupportedVersion(3))
        ));
        // The builtin schema requires more fields than the rules provide
        assert!(matches!(
            mapper_from_config(&config(Some(1), Some(&rules_path))),
            Err(MappingError::MissingRequired(_))
        ));
        assert!(matches!(
            mapper_from_config(&config(Some(2), Some(&script_path))),
            Err(MappingError::MissingRequired(_))
        ));
    }
}
