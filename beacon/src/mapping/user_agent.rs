//! User-agent breakdown for records.
//!
//! Parsing is token based: browser, OS and device class are picked from the
//! well known product tokens. Results are cached by the raw string since the
//! set of distinct user-agents in real traffic is small compared to the
//! number of requests.

use std::sync::Arc;

use moka::sync::Cache;

pub const UNKNOWN: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserAgentAttribute {
    Name,
    Family,
    Vendor,
    Type,
    Version,
    DeviceCategory,
    OsFamily,
    OsVersion,
    OsVendor,
}

impl UserAgentAttribute {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "name" => Self::Name,
            "family" => Self::Family,
            "vendor" => Self::Vendor,
            "type" => Self::Type,
            "version" => Self::Version,
            "deviceCategory" => Self::DeviceCategory,
            "osFamily" => Self::OsFamily,
            "osVersion" => Self::OsVersion,
            "osVendor" => Self::OsVendor,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadableUserAgent {
    pub name: String,
    pub family: String,
    pub vendor: String,
    pub agent_type: String,
    pub version: String,
    pub device_category: String,
    pub os_family: String,
    pub os_version: String,
    pub os_vendor: String,
}

impl ReadableUserAgent {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            family: UNKNOWN.to_string(),
            vendor: UNKNOWN.to_string(),
            agent_type: UNKNOWN.to_string(),
            version: UNKNOWN.to_string(),
            device_category: UNKNOWN.to_string(),
            os_family: UNKNOWN.to_string(),
            os_version: UNKNOWN.to_string(),
            os_vendor: UNKNOWN.to_string(),
        }
    }

    pub fn attribute(&self, attribute: UserAgentAttribute) -> &str {
        match attribute {
            UserAgentAttribute::Name => &self.name,
            UserAgentAttribute::Family => &self.family,
            UserAgentAttribute::Vendor => &self.vendor,
            UserAgentAttribute::Type => &self.agent_type,
            UserAgentAttribute::Version => &self.version,
            UserAgentAttribute::DeviceCategory => &self.device_category,
            UserAgentAttribute::OsFamily => &self.os_family,
            UserAgentAttribute::OsVersion => &self.os_version,
            UserAgentAttribute::OsVendor => &self.os_vendor,
        }
    }
}

pub trait UserAgentParser {
    fn parse(&self, user_agent: &str) -> ReadableUserAgent;
}

// (token, family, vendor), first match wins so more specific tokens go first
const BROWSERS: &[(&str, &str, &str)] = &[
    ("Edg/", "Edge", "Microsoft Corporation."),
    ("Edge/", "Edge", "Microsoft Corporation."),
    ("OPR/", "Opera", "Opera Software ASA."),
    ("SamsungBrowser/", "Samsung Internet", "Samsung Electronics Co., Ltd."),
    ("Firefox/", "Firefox", "Mozilla Foundation"),
    ("Chrome/", "Chrome", "Google Inc."),
    ("CriOS/", "Chrome", "Google Inc."),
    ("Version/", "Safari", "Apple Inc."),
    ("MSIE ", "IE", "Microsoft Corporation."),
    ("Trident/", "IE", "Microsoft Corporation."),
];

const ROBOT_MARKERS: &[&str] = &["bot", "crawler", "spider", "slurp"];

/// Token based parser covering the common browsers and platforms. Anything
/// it does not recognise is reported as `unknown`.
#[derive(Clone, Debug, Default)]
pub struct RuleBasedParser;

impl RuleBasedParser {
    fn version_after<'a>(user_agent: &'a str, token: &str) -> Option<&'a str> {
        let start = user_agent.find(token)? + token.len();
        let version = user_agent[start..]
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '_'))
            .next()?;
        (!version.is_empty()).then_some(version)
    }

    fn operating_system(user_agent: &str) -> (&'static str, String, &'static str) {
        if let Some(nt) = Self::version_after(user_agent, "Windows NT ") {
            let version = match nt {
                "10.0" => "10",
                "6.3" => "8.1",
                "6.2" => "8",
                "6.1" => "7",
                "6.0" => "Vista",
                "5.1" => "XP",
                other => other,
            };
            return ("Windows", version.to_string(), "Microsoft Corporation.");
        }
        if let Some(version) = Self::version_after(user_agent, "Android ") {
            return ("Android", version.to_string(), "Google, Inc.");
        }
        if user_agent.contains("Android") {
            return ("Android", UNKNOWN.to_string(), "Google, Inc.");
        }
        for token in ["iPhone OS ", "CPU OS "] {
            if let Some(version) = Self::version_after(user_agent, token) {
                return ("iOS", version.replace('_', "."), "Apple Inc.");
            }
        }
        if let Some(version) = Self::version_after(user_agent, "Mac OS X ") {
            return ("OS X", version.replace('_', "."), "Apple Computer, Inc.");
        }
        if user_agent.contains("CrOS") {
            return ("Chrome OS", UNKNOWN.to_string(), "Google, Inc.");
        }
        if user_agent.contains("Linux") {
            return ("Linux", UNKNOWN.to_string(), "Linux Foundation");
        }
        (UNKNOWN, UNKNOWN.to_string(), UNKNOWN)
    }

    fn device_category(user_agent: &str, robot: bool) -> &'static str {
        if robot {
            "Other"
        } else if user_agent.contains("iPad") || user_agent.contains("Tablet") {
            "Tablet"
        } else if user_agent.contains("Mobi") || user_agent.contains("iPhone") {
            "Smartphone"
        } else if user_agent.contains("Android") {
            "Tablet"
        } else if user_agent.contains("Windows")
            || user_agent.contains("Macintosh")
            || user_agent.contains("X11")
            || user_agent.contains("CrOS")
        {
            "Personal computer"
        } else {
            UNKNOWN
        }
    }
}

impl UserAgentParser for RuleBasedParser {
    fn parse(&self, user_agent: &str) -> ReadableUserAgent {
        if user_agent.trim().is_empty() {
            return ReadableUserAgent::unknown();
        }

        let lowercase = user_agent.to_lowercase();
        let robot = ROBOT_MARKERS.iter().any(|m| lowercase.contains(m));
        let (os_family, os_version, os_vendor) = Self::operating_system(user_agent);
        let device_category = Self::device_category(user_agent, robot);

        let mut parsed = ReadableUserAgent {
            device_category: device_category.to_string(),
            os_family: os_family.to_string(),
            os_version,
            os_vendor: os_vendor.to_string(),
            ..ReadableUserAgent::unknown()
        };

        if robot {
            parsed.agent_type = "Robot".to_string();
            parsed.name = user_agent
                .split(|c: char| c == '/' || c.is_whitespace() || c == ';')
                .find(|part| {
                    let part = part.to_lowercase();
                    ROBOT_MARKERS.iter().any(|m| part.contains(m))
                })
                .unwrap_or(UNKNOWN)
                .to_string();
            parsed.family = parsed.name.clone();
            return parsed;
        }

        let browser = BROWSERS.iter().find_map(|(token, family, vendor)| {
            let version = Self::version_after(user_agent, token)?;
            // Chrome and Safari on iOS both carry "Version/" style tokens
            if *family == "Safari" && !user_agent.contains("Safari/") {
                return None;
            }
            Some((*family, *vendor, version))
        });

        if let Some((family, vendor, version)) = browser {
            let mobile = device_category == "Smartphone" || device_category == "Tablet";
            parsed.name = if mobile {
                format!("Mobile {family}")
            } else {
                family.to_string()
            };
            parsed.family = family.to_string();
            parsed.vendor = vendor.to_string();
            parsed.agent_type = if mobile { "Mobile Browser" } else { "Browser" }.to_string();
            parsed.version = version.to_string();
        }

        parsed
    }
}

/// A parser fronted by a bounded concurrent cache keyed on the raw
/// user-agent string.
#[derive(Clone)]
pub struct UserAgentParserAndCache {
    parser: Arc<dyn UserAgentParser + Send + Sync>,
    cache: Cache<String, Arc<ReadableUserAgent>>,
}

impl UserAgentParserAndCache {
    pub fn new(parser: Arc<dyn UserAgentParser + Send + Sync>, capacity: u64) -> Self {
        Self {
            parser,
            cache: Cache::new(capacity),
        }
    }

    pub fn with_rules(capacity: u64) -> Self {
        Self::new(Arc::new(RuleBasedParser), capacity)
    }

    pub fn parse(&self, user_agent: &str) -> Arc<ReadableUserAgent> {
        self.cache.get_with_by_ref(user_agent, || {
            Arc::new(self.parser.parse(user_agent))
        })
    }
}
