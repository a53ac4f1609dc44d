//! Observed network request records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rule::HttpMethod;

/// One observed outgoing request/response pair.
///
/// Bodies are carried as raw text; nothing is parsed until the observer's
/// gate has confirmed a registered rule cares about this request. Records
/// live only for the duration of a `handle_request` call (plus the bounded
/// identity replay buffer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Request URL as observed.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// When the request was issued.
    pub timestamp: DateTime<Utc>,

    /// Raw request body text, if the request carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,

    /// Raw response body text, once the response arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

impl NetworkRequest {
    /// Creates a bodiless record.
    #[must_use]
    pub fn new(url: impl Into<String>, method: HttpMethod, timestamp: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            method,
            timestamp,
            request_body: None,
            response_body: None,
        }
    }

    /// Attaches the raw request body.
    #[must_use]
    pub fn with_request_body(mut self, body: impl Into<String>) -> Self {
        self.request_body = Some(body.into());
        self
    }

    /// Attaches the raw response body.
    #[must_use]
    pub fn with_response_body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let record = NetworkRequest::new("/api/cart", HttpMethod::Post, Utc::now())
            .with_request_body(r#"{"sku":"A-1"}"#)
            .with_response_body(r#"{"ok":true}"#);
        assert_eq!(record.url, "/api/cart");
        assert!(record.request_body.is_some());
        assert!(record.response_body.is_some());
    }
}
