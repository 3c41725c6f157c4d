//! Caller information extraction.
//!
//! The protocol engine exposes the remote party of a call as a free-text
//! header value such as `"Alice" <sip:alice@example.com>`. This module
//! distills that text into a display name and a canonical URI with a
//! two-step pattern match: first a pattern capturing both a quoted display
//! name and the embedded `sip:` address, then a fallback capturing only the
//! address. Anything else resolves to the `"Unknown"` sentinel.
//!
//! This is a pure string transformation with no side effects.

use std::sync::OnceLock;

use regex::Regex;

/// Sentinel used when no display name or URI can be extracted.
pub const UNKNOWN: &str = "Unknown";

static NAME_AND_URI: OnceLock<Regex> = OnceLock::new();
static URI_ONLY: OnceLock<Regex> = OnceLock::new();

fn name_and_uri() -> &'static Regex {
    NAME_AND_URI.get_or_init(|| {
        Regex::new(r#"^"([^"]+).*?sip:(.*?)>$"#).expect("display name pattern")
    })
}

fn uri_only() -> &'static Regex {
    URI_ONLY.get_or_init(|| Regex::new(r"^.*?sip:(.*?)>$").expect("remote uri pattern"))
}

/// Display name and canonical URI of the remote party of a call.
///
/// ```rust
/// use voxline_client_core::caller::CallerInfo;
///
/// let info = CallerInfo::parse("\"Alice\" <sip:alice@example.com>");
/// assert_eq!(info.display_name, "Alice");
/// assert_eq!(info.remote_uri, "alice@example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerInfo {
    /// Display name of the remote party, or `"Unknown"`
    pub display_name: String,
    /// Canonical URI of the remote party (without the `sip:` scheme), or `"Unknown"`
    pub remote_uri: String,
}

impl CallerInfo {
    /// Extracts caller information from a remote party header value.
    pub fn parse(remote_party: &str) -> Self {
        if remote_party.is_empty() {
            return Self::unknown();
        }

        if let Some(captures) = name_and_uri().captures(remote_party) {
            return Self {
                display_name: captures[1].to_string(),
                remote_uri: captures[2].to_string(),
            };
        }

        if let Some(captures) = uri_only().captures(remote_party) {
            let uri = captures[1].to_string();
            return Self {
                display_name: uri.clone(),
                remote_uri: uri,
            };
        }

        Self::unknown()
    }

    fn unknown() -> Self {
        Self {
            display_name: UNKNOWN.to_string(),
            remote_uri: UNKNOWN.to_string(),
        }
    }
}
