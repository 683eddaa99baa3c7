//! Version 2 mapping script.
//!
//! One statement per line, `#` starts a comment line:
//!
//! ```text
//! # page views
//! map location() onto 'location'
//! map eventParameter('plan') onto 'plan'
//! map userAgent().osFamily() onto 'os'
//! map 'web' onto 'channel'
//! ```
//!
//! The script is parsed once at startup into the same field rules the
//! other strategies use.

use crate::event::AdmittedEvent;
use crate::mapping::source::{Builtin, Source};
use crate::mapping::user_agent::UserAgentAttribute;
use crate::mapping::{
    FieldRules, MappingError, Record, RecordMapper, Schema, UserAgentParserAndCache, Value,
};

struct Parser<'a> {
    line: usize,
    rest: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> MappingError {
        MappingError::Script {
            line: self.line,
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        match self.rest.strip_prefix(token) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), MappingError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{token}` at `{}`", self.rest)))
        }
    }

    fn identifier(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        let end = self
            .rest
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_alphabetic() || *c == '_' || (*i > 0 && c.is_ascii_digit())))
            .map_or(self.rest.len(), |(i, _)| i);
        if end == 0 {
            return None;
        }
        let (identifier, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(identifier)
    }

    fn string(&mut self) -> Result<String, MappingError> {
        self.skip_whitespace();
        let input = self.rest;
        let mut chars = input.char_indices();
        let quote = match chars.next() {
            Some((_, q @ ('\'' | '"'))) => q,
            _ => return Err(self.error(format!("expected a quoted string at `{}`", self.rest))),
        };

        let mut value = String::new();
        let mut escaped = false;
        for (i, c) in chars {
            match c {
                _ if escaped => {
                    value.push(c);
                    escaped = false;
                }
                '\\' => escaped = true,
                c if c == quote => {
                    self.rest = &input[i + c.len_utf8()..];
                    return Ok(value);
                }
                c => value.push(c),
            }
        }
        Err(self.error("unterminated string"))
    }

    fn number(&mut self) -> Result<Value, MappingError> {
        self.skip_whitespace();
        let end = self
            .rest
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && *c == '-')))
            .map_or(self.rest.len(), |(i, _)| i);
        let (literal, rest) = self.rest.split_at(end);

        let value = if literal.contains('.') {
            literal.parse().ok().map(Value::Double)
        } else {
            literal.parse().ok().map(Value::Long)
        };
        let value = value.ok_or_else(|| self.error(format!("invalid number `{literal}`")))?;
        self.rest = rest;
        Ok(value)
    }

    fn expression(&mut self) -> Result<Source, MappingError> {
        self.skip_whitespace();
        match self.rest.chars().next() {
            Some('\'' | '"') => return Ok(Source::Literal(Value::String(self.string()?))),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                return Ok(Source::Literal(self.number()?))
            }
            _ => {}
        }

        let name = self
            .identifier()
            .ok_or_else(|| self.error(format!("expected an expression at `{}`", self.rest)))?;
        match name {
            "true" => return Ok(Source::Literal(Value::Boolean(true))),
            "false" => return Ok(Source::Literal(Value::Boolean(false))),
            _ => {}
        }

        self.expect("(")?;
        match name {
            "eventParameter" => {
                let parameter = self.string()?;
                self.expect(")")?;
                Ok(Source::EventParameter(parameter))
            }
            "userAgent" => {
                self.expect(")")?;
                self.expect(".")?;
                let attribute = self
                    .identifier()
                    .ok_or_else(|| self.error("expected a user agent attribute"))?;
                self.expect("(")?;
                self.expect(")")?;
                UserAgentAttribute::from_name(attribute)
                    .map(Source::UserAgent)
                    .ok_or_else(|| MappingError::UnknownSource(format!("userAgent().{attribute}()")))
            }
            builtin => {
                self.expect(")")?;
                Builtin::from_name(builtin)
                    .map(Source::Builtin)
                    .ok_or_else(|| MappingError::UnknownSource(format!("{builtin}()")))
            }
        }
    }

    fn statement(mut self) -> Result<(String, Source), MappingError> {
        if self.identifier() != Some("map") {
            return Err(self.error("statements start with `map`"));
        }
        let source = self.expression()?;
        if self.identifier() != Some("onto") {
            return Err(self.error(format!("expected `onto` at `{}`", self.rest)));
        }
        let field = self.string()?;

        self.skip_whitespace();
        if !self.rest.is_empty() {
            return Err(self.error(format!("unexpected `{}`", self.rest)));
        }
        Ok((field, source))
    }
}

fn parse_script(script: &str) -> Result<Vec<(String, Source)>, MappingError> {
    script
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line, rest)| Parser { line, rest }.statement())
        .collect()
}

pub struct ScriptMapper {
    rules: FieldRules,
}

impl ScriptMapper {
    pub fn parse(
        schema: Schema,
        script: &str,
        user_agents: UserAgentParserAndCache,
    ) -> Result<Self, MappingError> {
        Ok(Self {
            rules: FieldRules::new(schema, parse_script(script)?, user_agents)?,
        })
    }
}

impl RecordMapper for ScriptMapper {
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

    const SCRIPT: &str = r#"
        # identity
        map partyId() onto 'party'
        map location() onto "url"

        map eventParameter('plan') onto 'plan'
        map userAgent().osFamily() onto 'os'
        map 'web' onto 'channel'
        map -12 onto 'offset'
        map 0.25 onto 'ratio'
        map true onto 'tracked'
    "#;

    fn schema() -> Schema {
        Schema::from_json(
            r#"{"name": "Custom", "fields": [
                {"name": "party", "type": "string", "required": true},
                {"name": "url", "type": "string"},
                {"name": "plan", "type": "string"},
                {"name": "os", "type": "string"},
                {"name": "channel", "type": "string"},
                {"name": "offset", "type": "int"},
                {"name": "ratio", "type": "double"},
                {"name": "tracked", "type": "boolean"}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn parse_statements() {
        let statements = parse_script(SCRIPT).unwrap();
        let fields: Vec<_> = statements.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(
            fields,
            vec!["party", "url", "plan", "os", "channel", "offset", "ratio", "tracked"]
        );
        assert!(matches!(
            &statements[4].1,
            Source::Literal(Value::String(s)) if s == "web"
        ));
        assert!(matches!(&statements[5].1, Source::Literal(Value::Long(-12))));

        let escaped = parse_script(r"map 'it\'s' onto 'channel'").unwrap();
        assert!(matches!(
            &escaped[0].1,
            Source::Literal(Value::String(s)) if s == "it's"
        ));
    }

    #[test]
    fn map_with_a_script() {
        let mapper =
            ScriptMapper::parse(schema(), SCRIPT, UserAgentParserAndCache::with_rules(10)).unwrap();

        let context = EventContext {
            party_id: "0:party".to_string(),
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Firefox/121.0".to_string()),
            query: QueryParams::from_pairs([
                ("l", "https://example.com/"),
                ("u", r#"{"plan": "free"}"#),
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
                "url": "https://example.com/",
                "plan": "free",
                "os": "Linux",
                "channel": "web",
                "offset": -12,
                "ratio": 0.25,
                "tracked": true
            })
        );
    }

    #[test]
    fn syntax_errors_name_the_line() {
        let error = parse_script("map partyId() onto 'party'\n\nmap location( onto 'url'").unwrap_err();
        assert!(matches!(error, MappingError::Script { line: 3, .. }));

        for broken in [
            "mop partyId() onto 'party'",
            "map partyId() into 'party'",
            "map partyId() onto party",
            "map partyId() onto 'party' and more",
            "map 'unterminated onto 'party",
            "map 1.2.3 onto 'ratio'",
        ] {
            assert!(
                matches!(parse_script(broken), Err(MappingError::Script { line: 1, .. })),
                "{broken}"
            );
        }

        assert!(matches!(
            parse_script("map partyIdentifier() onto 'party'"),
            Err(MappingError::UnknownSource(_))
        ));
        assert!(matches!(
            parse_script("map userAgent().colour() onto 'os'"),
            Err(MappingError::UnknownSource(_))
        ));
    }
}
