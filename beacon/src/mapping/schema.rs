use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid schema document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("schema declares no fields")]
    Empty,
    #[error("field {0} is declared twice")]
    DuplicateField(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Boolean,
    Int,
    Long,
    Double,
    String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn from_json(document: &str) -> Result<Self, SchemaError> {
        let schema: Schema = serde_json::from_str(document)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let document = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&document)
    }

    /// Schema of the records produced when no custom mapping is configured.
    pub fn builtin() -> Self {
        use FieldType::{Boolean, Double, Int, Long};

        let fields = [
            ("detectedCorruption", Boolean, true),
            ("detectedDuplicate", Boolean, true),
            ("firstInSession", Boolean, true),
            ("timestamp", Long, true),
            ("clientTimestamp", Long, false),
            ("remoteHost", FieldType::String, true),
            ("referer", FieldType::String, false),
            ("location", FieldType::String, false),
            ("viewportPixelWidth", Int, false),
            ("viewportPixelHeight", Int, false),
            ("screenPixelWidth", Int, false),
            ("screenPixelHeight", Int, false),
            ("devicePixelRatio", Double, false),
            ("partyId", FieldType::String, false),
            ("sessionId", FieldType::String, false),
            ("pageViewId", FieldType::String, false),
            ("eventId", FieldType::String, false),
            ("eventType", FieldType::String, false),
            ("userAgentString", FieldType::String, false),
            ("userAgentName", FieldType::String, false),
            ("userAgentFamily", FieldType::String, false),
            ("userAgentVendor", FieldType::String, false),
            ("userAgentType", FieldType::String, false),
            ("userAgentVersion", FieldType::String, false),
            ("userAgentDeviceCategory", FieldType::String, false),
            ("userAgentOsFamily", FieldType::String, false),
            ("userAgentOsVersion", FieldType::String, false),
            ("userAgentOsVendor", FieldType::String, false),
        ];

        Self {
            name: "DefaultEventRecord".to_string(),
            fields: fields
                .into_iter()
                .map(|(name, field_type, required)| Field {
                    name: name.to_string(),
                    field_type,
                    required,
                })
                .collect(),
        }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl Value {
    /// Converts the value to `target`, or None when it has no faithful
    /// representation there. Query parameters arrive as strings, so
    /// strings are parsed into the numeric and boolean types.
    pub fn coerce(self, target: FieldType) -> Option<Value> {
        match (self, target) {
            (v @ Value::Boolean(_), FieldType::Boolean)
            | (v @ Value::Int(_), FieldType::Int)
            | (v @ Value::Long(_), FieldType::Long)
            | (v @ Value::Double(_), FieldType::Double)
            | (v @ Value::String(_), FieldType::String) => Some(v),

            (Value::Int(i), FieldType::Long) => Some(Value::Long(i.into())),
            (Value::Int(i), FieldType::Double) => Some(Value::Double(i.into())),
            (Value::Long(l), FieldType::Int) => i32::try_from(l).ok().map(Value::Int),
            (Value::Long(l), FieldType::Double) => Some(Value::Double(l as f64)),

            (Value::String(s), FieldType::Boolean) => s.parse().ok().map(Value::Boolean),
            (Value::String(s), FieldType::Int) => s.trim().parse().ok().map(Value::Int),
            (Value::String(s), FieldType::Long) => s.trim().parse().ok().map(Value::Long),
            (Value::String(s), FieldType::Double) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite())
                .map(Value::Double),

            (v, FieldType::String) => Some(Value::String(v.to_string())),
            _ => None,
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Boolean(_) => FieldType::Boolean,
            Value::Int(_) => FieldType::Int,
            Value::Long(_) => FieldType::Long,
            Value::Double(_) => FieldType::Double,
            Value::String(_) => FieldType::String,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Long(l) => write!(f, "{l}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

/// A record conforming to its schema. Values sit at the position of their
/// field; unset optional fields serialize as null.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Option<Value>>,
}

impl Record {
    pub(crate) fn new(schema: Arc<Schema>, values: Vec<Option<Value>>) -> Self {
        Self { schema, values }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema
            .position(name)
            .and_then(|pos| self.values.get(pos))
            .and_then(Option::as_ref)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in self.schema.fields.iter().zip(&self.values) {
            map.serialize_entry(&field.name, value)?;
        }
        map.end()
    }
}
