//! The synchronizable entity contract.
//!
//! Every record that participates in synchronization carries four system
//! fields: `id`, `updatedAt`, `version`, and `deleted`. `updatedAt` and
//! `version` are server-authoritative; the client never fabricates them.
//! On the wire `updatedAt` uses millisecond precision with an explicit zone
//! (`Z` for UTC) and `version` is base64 text when carried as a JSON field.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::Value;

use crate::errors::{Error, Result};

/// Wire name of the primary-key field.
pub const ID_FIELD: &str = "id";
/// Wire name of the server-maintained modification timestamp.
pub const UPDATED_AT_FIELD: &str = "updatedAt";
/// Wire name of the opaque concurrency token.
pub const VERSION_FIELD: &str = "version";
/// Wire name of the soft-delete marker.
pub const DELETED_FIELD: &str = "deleted";

const MAX_ID_LEN: usize = 127;

/// The system fields extracted from a wire payload.
///
/// `version` is kept in its transport form (base64 text); it is opaque to
/// the client and only ever echoed back in conditional request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemProperties {
    pub id: String,
    pub updated_at: Option<DateTime<FixedOffset>>,
    pub version: Option<String>,
    pub deleted: bool,
}

impl SystemProperties {
    /// Extract the system fields from a JSON entity payload.
    ///
    /// `id` must be present and valid; the remaining fields are optional
    /// because client-originated payloads do not carry them yet.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Validation("entity payload is not a JSON object".into()))?;

        let id = object
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("entity payload has no string 'id' field".into()))?;
        validate_entity_id(id)?;

        let updated_at = match object.get(UPDATED_AT_FIELD) {
            Some(Value::String(raw)) => Some(parse_timestamp(raw)?),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(Error::Validation(format!(
                    "'updatedAt' must be a string, got {other}"
                )))
            }
        };

        let version = match object.get(VERSION_FIELD) {
            Some(Value::String(raw)) if !raw.is_empty() => Some(raw.clone()),
            _ => None,
        };

        let deleted = object
            .get(DELETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            id: id.to_string(),
            updated_at,
            version,
            deleted,
        })
    }
}

/// Validate an entity id against the id grammar: one ASCII alphanumeric
/// followed by up to 126 characters drawn from alphanumerics, `_`, `.`,
/// `:`, `|`, and `-`.
pub fn validate_entity_id(id: &str) -> Result<()> {
    let bytes = id.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_ID_LEN {
        return Err(Error::InvalidEntityId(id.to_string()));
    }
    if !bytes[0].is_ascii_alphanumeric() {
        return Err(Error::InvalidEntityId(id.to_string()));
    }
    for byte in &bytes[1..] {
        if !byte.is_ascii_alphanumeric() && !matches!(byte, b'_' | b'.' | b':' | b'|' | b'-') {
            return Err(Error::InvalidEntityId(id.to_string()));
        }
    }
    Ok(())
}

/// The delta-token origin: an absent token means "pull everything".
pub fn epoch() -> DateTime<FixedOffset> {
    DateTime::<Utc>::UNIX_EPOCH.fixed_offset()
}

/// Format a timestamp in the wire form `yyyy-MM-ddTHH:mm:ss.fffK`:
/// millisecond precision, `Z` for UTC, otherwise the explicit offset.
pub fn format_timestamp(value: &DateTime<FixedOffset>) -> String {
    if value.offset().local_minus_utc() == 0 {
        value.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    } else {
        value.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
    }
}

/// Parse a wire timestamp. Accepts any RFC 3339 text; the offset is
/// preserved so that formatting round-trips.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>> {
    Ok(DateTime::parse_from_rfc3339(raw)?)
}

/// Encode an opaque version token for transport as a JSON field.
pub fn encode_version(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a transported version token back to its raw bytes.
pub fn decode_version(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text)
        .map_err(|err| Error::Validation(format!("version '{text}' is not valid base64: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_grammar_boundaries() {
        assert!(validate_entity_id("m1").is_ok());
        assert!(validate_entity_id("A").is_ok());
        assert!(validate_entity_id("0start").is_ok());
        assert!(validate_entity_id("a_b.c:d|e-f").is_ok());
        assert!(validate_entity_id(&format!("a{}", "b".repeat(126))).is_ok());

        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("-leading").is_err());
        assert!(validate_entity_id("_leading").is_err());
        assert!(validate_entity_id("has space").is_err());
        assert!(validate_entity_id("has/slash").is_err());
        assert!(validate_entity_id(&format!("a{}", "b".repeat(127))).is_err());
    }

    #[test]
    fn timestamp_round_trips_utc_and_offsets() {
        let utc = parse_timestamp("2024-01-02T03:04:05.678Z").unwrap();
        assert_eq!(format_timestamp(&utc), "2024-01-02T03:04:05.678Z");

        let offset = parse_timestamp("2024-01-02T03:04:05.678+05:30").unwrap();
        assert_eq!(format_timestamp(&offset), "2024-01-02T03:04:05.678+05:30");
    }

    #[test]
    fn timestamp_formats_with_millisecond_precision() {
        let value = parse_timestamp("2024-06-01T12:00:00Z").unwrap();
        assert_eq!(format_timestamp(&value), "2024-06-01T12:00:00.000Z");
    }

    #[test]
    fn system_properties_extraction() {
        let value = json!({
            "id": "m1",
            "updatedAt": "2024-01-01T00:00:00.000Z",
            "version": "dGVzdA==",
            "deleted": true,
            "title": "ignored"
        });
        let props = SystemProperties::from_value(&value).unwrap();
        assert_eq!(props.id, "m1");
        assert_eq!(
            props.updated_at.map(|t| format_timestamp(&t)),
            Some("2024-01-01T00:00:00.000Z".to_string())
        );
        assert_eq!(props.version.as_deref(), Some("dGVzdA=="));
        assert!(props.deleted);
    }

    #[test]
    fn system_properties_tolerate_absent_metadata() {
        let props = SystemProperties::from_value(&json!({"id": "m2", "title": "new"})).unwrap();
        assert_eq!(props.id, "m2");
        assert!(props.updated_at.is_none());
        assert!(props.version.is_none());
        assert!(!props.deleted);
    }

    #[test]
    fn version_tokens_round_trip_through_base64() {
        assert_eq!(encode_version(b"v1"), "djE=");
        assert_eq!(decode_version("djE=").unwrap(), b"v1");
        assert!(decode_version("not base64!").is_err());
    }

    #[test]
    fn system_properties_reject_missing_id() {
        assert!(SystemProperties::from_value(&json!({"title": "x"})).is_err());
        assert!(SystemProperties::from_value(&json!({"id": "bad id"})).is_err());
        assert!(SystemProperties::from_value(&json!([1, 2])).is_err());
    }
}
