//! The uniform "too many requests" response.

use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Response, StatusCode};
use serde::{Deserialize, Serialize};

/// Body sent with every rejection.
pub const REJECTION_MESSAGE: &str = "Too many requests, please slow down.";

/// Rejection rendering settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionConfig {
    /// Send a `Retry-After` header with the seconds left in the window
    #[serde(default)]
    pub retry_after: bool,
}

/// A refused call, ready to be rendered by the transport layer.
///
/// Carries nothing about counters, keys or the store beyond the optional
/// retry hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    retry_after: Option<u64>,
}

impl Rejection {
    pub(crate) fn new(reset_seconds: u64, config: RejectionConfig) -> Self {
        Self {
            retry_after: config.retry_after.then_some(reset_seconds),
        }
    }

    /// Status code for a rejected call.
    pub fn status(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    /// Retry hint in seconds, when enabled.
    pub fn retry_after(&self) -> Option<u64> {
        self.retry_after
    }

    /// Render the rejection as an HTTP 429 response.
    pub fn into_response(self) -> Response<String> {
        let mut resp = Response::new(REJECTION_MESSAGE.to_string());
        *resp.status_mut() = self.status();

        resp.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let Some(secs) = self.retry_after {
            resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
        }

        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_is_generic_429() {
        let resp = Rejection::new(42, RejectionConfig::default()).into_response();

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.body(), REJECTION_MESSAGE);
        assert!(resp.headers().get(RETRY_AFTER).is_none());
        assert_eq!(resp.headers().len(), 1);
    }

    #[test]
    fn test_retry_after_when_enabled() {
        let rejection = Rejection::new(42, RejectionConfig { retry_after: true });
        assert_eq!(rejection.retry_after(), Some(42));

        let resp = rejection.into_response();
        assert_eq!(resp.headers()[RETRY_AFTER], "42");
    }
}
