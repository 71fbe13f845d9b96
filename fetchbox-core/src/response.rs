//! The response envelope.
//!
//! Every transport call and every controller execution resolves to a
//! [`Response`]. On a completed call exactly one of `data` / `error` is set;
//! `aborted: true` signals cancellation. Transport failures are responses,
//! not Rust errors: the error value travels in the envelope so the last good
//! cached data is never disturbed by a failed fetch.

use std::collections::HashMap;

use serde_json::Value;

/// The outcome of one operation.
///
/// `Response` is `Clone` because deduplicated callers all receive the same
/// settled value through a shared future.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Response {
    /// HTTP-style status code; `0` when no transport call completed.
    pub status: u16,
    /// Response payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error payload on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Response headers, if the transport surfaced any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Whether the call was cancelled before settling.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
}

impl Response {
    /// A successful response with `status: 200`.
    pub fn ok(data: Value) -> Self {
        Response {
            status: 200,
            data: Some(data),
            ..Default::default()
        }
    }

    /// A failed response carrying an error payload.
    pub fn error(status: u16, error: Value) -> Self {
        Response {
            status,
            error: Some(error),
            ..Default::default()
        }
    }

    /// The cancelled-call response: `{status: 0, aborted: true}`.
    pub fn aborted() -> Self {
        Response {
            status: 0,
            aborted: true,
            ..Default::default()
        }
    }

    /// The empty response `{status: 0}` returned by rate-limiting plugins
    /// when no cached data is available.
    pub fn empty() -> Self {
        Response::default()
    }

    /// Whether this response commits: defined data and no error.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.data.is_some() && self.error.is_none() && !self.aborted
    }

    /// Whether this response carries a failure (an error or an abort).
    #[inline]
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_commits() {
        let response = Response::ok(json!({"id": 1}));
        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert!(!response.is_failure());
    }

    #[test]
    fn test_error_does_not_commit() {
        let response = Response::error(500, json!("boom"));
        assert!(!response.is_success());
        assert!(response.is_failure());
    }

    #[test]
    fn test_aborted_is_failure() {
        let response = Response::aborted();
        assert_eq!(response.status, 0);
        assert!(response.aborted);
        assert!(response.is_failure());
    }

    #[test]
    fn test_empty_is_neither() {
        let response = Response::empty();
        assert!(!response.is_success());
        assert!(!response.is_failure());
    }
}
