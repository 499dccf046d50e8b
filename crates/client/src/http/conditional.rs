//! Conditional-request helpers: ETag formatting and parsing, `If-Match`
//! and `If-None-Match` construction.
//!
//! Versions travel as strong, double-quoted ETags whose value is the
//! base64 text of the opaque version token. Weak ETags (`W/"..."`) never
//! match a stored version.

use reqwest::header::{HeaderMap, HeaderValue, ETAG};

use crate::errors::{ClientError, Result};

/// Render a version token as a strong ETag.
pub fn format_etag(version: &str) -> String {
    format!("\"{version}\"")
}

/// Parse a strong ETag back into its version token. Weak validators are
/// rejected.
pub fn parse_etag(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.starts_with("W/") || raw.starts_with("w/") {
        return Err(ClientError::protocol(format!(
            "weak ETag '{raw}' cannot carry an entity version"
        )));
    }
    let inner = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| ClientError::protocol(format!("malformed ETag '{raw}'")))?;
    if inner.contains('"') {
        return Err(ClientError::protocol(format!("malformed ETag '{raw}'")));
    }
    Ok(inner.to_string())
}

/// `If-Match` header value for a write carrying a version.
pub fn if_match_value(version: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(&format_etag(version))
        .map_err(|_| ClientError::protocol(format!("version '{version}' is not header-safe")))
}

/// `If-None-Match` header value for cache validation.
pub fn if_none_match_value(version: &str) -> Result<HeaderValue> {
    if_match_value(version)
}

/// Extract the version token from a response's `ETag` header, ignoring
/// weak or malformed validators.
pub fn response_version(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| parse_etag(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_round_trip() {
        let etag = format_etag("dGVzdA==");
        assert_eq!(etag, "\"dGVzdA==\"");
        assert_eq!(parse_etag(&etag).unwrap(), "dGVzdA==");
    }

    #[test]
    fn weak_etags_never_match() {
        assert!(parse_etag("W/\"dGVzdA==\"").is_err());
        assert!(parse_etag("w/\"dGVzdA==\"").is_err());
    }

    #[test]
    fn malformed_etags_are_rejected() {
        assert!(parse_etag("dGVzdA==").is_err());
        assert!(parse_etag("\"unterminated").is_err());
        assert!(parse_etag("\"a\"b\"").is_err());
    }

    #[test]
    fn response_version_skips_weak_validators() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("W/\"abc\""));
        assert_eq!(response_version(&headers), None);

        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        assert_eq!(response_version(&headers).as_deref(), Some("abc"));
    }
}
