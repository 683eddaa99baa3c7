use std::collections::BTreeMap;

use serde::Serialize;

/// Query string parameters in arrival order. A name can occur several
/// times, and the relative order of its values is kept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    /// Parses an url-encoded query string. Malformed input yields an error
    /// so the caller can decide to treat the event as corrupt.
    pub fn parse(query: &str) -> Result<Self, serde_urlencoded::de::Error> {
        Ok(Self(serde_urlencoded::from_str(query)?))
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Values grouped by name, values in arrival order. Names are ordered
    /// by their UTF-16 code units, the order the tracking tag sorts in. It
    /// differs from byte order for names mixing characters above U+FFFF
    /// with ones in U+E000..=U+FFFF.
    pub fn grouped(&self) -> Vec<(&str, Vec<&str>)> {
        let mut grouped: BTreeMap<Vec<u16>, (&str, Vec<&str>)> = BTreeMap::new();
        for (name, value) in self.iter() {
            grouped
                .entry(name.encode_utf16().collect())
                .or_insert_with(|| (name, Vec::new()))
                .1
                .push(value);
        }
        grouped.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything the pipeline knows about one inbound beacon. Built by the
/// transport layer, then only ever borrowed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventContext {
    pub party_id: String,
    pub session_id: String,
    pub page_view_id: String,
    pub event_id: String,
    /// Milliseconds since the unix epoch, taken when the request arrived.
    pub request_start_time: i64,
    /// Client's offset from UTC, in minutes.
    pub client_utc_offset: i64,
    pub remote_host: String,
    pub user_agent: Option<String>,
    /// Value of the Referer header, which is the page that loaded the tracker.
    pub referer_header: Option<String>,
    pub first_in_session: bool,
    pub new_party: bool,
    pub query: QueryParams,
}

impl EventContext {
    /// True when all four identifiers used for duplicate detection are set.
    pub fn has_identity(&self) -> bool {
        !(self.party_id.is_empty()
            || self.session_id.is_empty()
            || self.page_view_id.is_empty()
            || self.event_id.is_empty())
    }
}

/// An event that made it past admission control, with the classification
/// the pipeline attached to it.
#[derive(Clone, Copy, Debug)]
pub struct AdmittedEvent<'a> {
    pub context: &'a EventContext,
    pub corrupt: bool,
    pub duplicate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_repeated_values_in_order() {
        let query = QueryParams::parse("b=2&a=x&b=1&a=y%20z").unwrap();

        assert_eq!(query.len(), 4);
        assert_eq!(query.first("b"), Some("2"));
        assert_eq!(query.all("a").collect::<Vec<_>>(), vec!["x", "y z"]);

        assert_eq!(
            query.grouped(),
            vec![("a", vec!["x", "y z"]), ("b", vec!["2", "1"])]
        );
    }

    #[test]
    fn names_sort_by_utf16_code_units() {
        // U+1F600 is a surrogate pair starting at 0xD83D, below U+FFFD, while
        // its UTF-8 encoding sorts after it
        let query = QueryParams::from_pairs([("\u{FFFD}", "1"), ("\u{1F600}", "2"), ("z", "3")]);

        let names: Vec<_> = query.grouped().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["z", "\u{1F600}", "\u{FFFD}"]);
    }

    #[test]
    fn identity_requires_all_identifiers() {
        let mut context = EventContext {
            party_id: "0:p".to_string(),
            session_id: "0:s".to_string(),
            page_view_id: "0:v".to_string(),
            event_id: "0:e".to_string(),
            ..Default::default()
        };
        assert!(context.has_identity());

        context.page_view_id.clear();
        assert!(!context.has_identity());
    }
}
