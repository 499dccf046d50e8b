//! Service responses surfaced to callers in push and pull results.

use serde_json::Value;

use crate::http::HttpResponse;
use crate::retry::{classify_http_status, RetryClass};

/// The outcome of one service request, kept for failure reporting.
///
/// `status` is absent for transport-level failures that never produced an
/// HTTP response. Conflict responses (409/412) carry the server's
/// authoritative entity in `body` so the caller can merge and resolve.
#[derive(Debug, Clone, Default)]
pub struct ServiceResponse {
    pub status: Option<u16>,
    pub body: Option<Value>,
    pub etag: Option<String>,
    pub reason: Option<String>,
}

impl ServiceResponse {
    /// Capture status, entity body, and version from an HTTP response.
    pub(crate) fn from_http(response: &HttpResponse) -> Self {
        Self {
            status: Some(response.status.as_u16()),
            body: response.json::<Value>().ok(),
            etag: crate::http::conditional::response_version(&response.headers),
            reason: None,
        }
    }

    /// A transport-level failure with no HTTP status.
    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// A protocol violation observed while handling a response.
    pub(crate) fn protocol(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status
    }

    /// True for the optimistic-concurrency failures (409 Conflict and
    /// 412 Precondition Failed) that carry the server's current entity.
    pub fn is_conflict(&self) -> bool {
        matches!(self.status, Some(409) | Some(412))
    }

    /// The server's authoritative entity, when the response carried one.
    pub fn server_entity(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Classify this failure for an embedder-driven retry loop.
    pub fn retry_class(&self) -> RetryClass {
        match self.status {
            Some(status) => classify_http_status(status),
            // No response at all: the request may simply not have arrived.
            None => RetryClass::Retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conflict_detection_covers_409_and_412() {
        for status in [409u16, 412] {
            let response = ServiceResponse {
                status: Some(status),
                body: Some(json!({"id": "m1"})),
                ..ServiceResponse::default()
            };
            assert!(response.is_conflict());
            assert!(response.server_entity().is_some());
        }
        let ok = ServiceResponse {
            status: Some(500),
            ..ServiceResponse::default()
        };
        assert!(!ok.is_conflict());
    }

    #[test]
    fn transport_failures_have_no_status_and_retry() {
        let response = ServiceResponse::transport("connection refused");
        assert_eq!(response.status_code(), None);
        assert_eq!(response.retry_class(), RetryClass::Retryable);
    }
}
