//! Integrity check for beacon query strings.
//!
//! The tracking tag appends a checksum over all other parameters, so that
//! requests truncated or rewritten by proxies and CDNs can be told apart.
//! It offers no protection against anyone forging requests on purpose:
//! there is no secret and the algorithm is public.

use murmur3::murmur3_32;
use tracing::{debug, warn};

use crate::event::QueryParams;
use crate::utils::encode_base36;

pub const DEFAULT_CHECKSUM_PARAM: &str = "x";
const CHECKSUM_SEED: u32 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChecksumResult {
    Valid,
    /// No checksum parameter was sent
    Missing,
    /// The checksum parameter is not a base-36 unsigned 32 bit integer
    Unparsable,
    Mismatch { expected: u32, computed: u32 },
}

impl ChecksumResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChecksumResult::Valid)
    }
}

#[derive(Clone, Debug)]
pub struct ChecksumVerifier {
    param: String,
}

impl Default for ChecksumVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKSUM_PARAM)
    }
}

impl ChecksumVerifier {
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
        }
    }

    pub fn verify(&self, query: &QueryParams) -> bool {
        self.check(query).is_valid()
    }

    pub fn check(&self, query: &QueryParams) -> ChecksumResult {
        let Some(raw) = query.first(&self.param) else {
            return ChecksumResult::Missing;
        };
        let Ok(expected) = u32::from_str_radix(raw, 36) else {
            return ChecksumResult::Unparsable;
        };

        let canonical = self.canonical_string(query);
        let computed = match murmur3_32(&mut canonical.as_bytes(), CHECKSUM_SEED) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("failed to hash canonical query string: {}", e);
                return ChecksumResult::Unparsable;
            }
        };

        if computed == expected {
            ChecksumResult::Valid
        } else {
            debug!(
                expected = %encode_base36(expected.into()),
                computed = %encode_base36(computed.into()),
                canonical = %canonical,
                "checksum mismatch"
            );
            ChecksumResult::Mismatch { expected, computed }
        }
    }

    /// Renders the parameters as `name=v1,v2,...,;` per name, names sorted,
    /// values kept in arrival order, the checksum parameter left out.
    /// Every value is terminated, so `a=1&a=2` and `a=12` differ.
    pub fn canonical_string(&self, query: &QueryParams) -> String {
        let mut canonical = String::new();
        for (name, values) in query.grouped() {
            if name == self.param {
                continue;
            }
            canonical.push_str(name);
            canonical.push('=');
            for value in values {
                canonical.push_str(value);
                canonical.push(',');
            }
            canonical.push(';');
        }
        canonical
    }
}
