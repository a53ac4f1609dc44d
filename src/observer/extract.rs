//! Value extraction from observed requests.
//!
//! Pure functions: a miss is `None`, never an error. The method-aware
//! routing lives here — a request-body mapping against the body-less GET
//! verb reads the response instead, and mutating methods fall back to the
//! response when the request body has nothing at the declared path.

use serde_json::Value;
use tracing::debug;

use super::record::NetworkRequest;
use crate::path;
use crate::rule::{FieldSource, UrlPart};
use crate::value::FieldValue;

/// Whether a deferred source's declared method+pattern match a request.
///
/// This is the observer's security gate predicate; it runs before any body
/// text is parsed. Synchronous sources never match.
pub(crate) fn source_matches(source: &FieldSource, record: &NetworkRequest) -> bool {
    match source.network_shape() {
        Some((method, pattern)) => {
            method == record.method && path::match_path(&record.url, pattern)
        }
        None => false,
    }
}

/// Parses a raw body as JSON.
///
/// Absent, empty, or non-JSON bodies yield `None`: the text is kept as-is
/// by the record, but path extraction against it finds nothing.
pub(crate) fn parse_body(body: Option<&str>) -> Option<Value> {
    let text = body?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(error) => {
            debug!(%error, "body is not JSON; unusable for path extraction");
            None
        }
    }
}

/// Walks a dot-separated path into a JSON value.
///
/// Numeric segments index arrays. An empty path is the whole value; any
/// missing segment is `None`.
pub(crate) fn walk_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in trimmed.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Extracts a deferred mapping's value from a matching request.
///
/// `request_json` / `response_json` are the lazily-parsed bodies, shared
/// across every mapping interested in the same record. A JSON `null` at
/// the declared path counts as no value.
pub(crate) fn extract_value(
    source: &FieldSource,
    record: &NetworkRequest,
    request_json: Option<&Value>,
    response_json: Option<&Value>,
) -> Option<FieldValue> {
    let found = match source {
        FieldSource::RequestBody { method, path, .. } => {
            if method.is_bodyless() {
                // GET carries no request body: the declared value can only
                // live in the response.
                response_json.and_then(|body| walk_path(body, path))
            } else {
                request_json
                    .and_then(|body| walk_path(body, path))
                    .or_else(|| response_json.and_then(|body| walk_path(body, path)))
            }
        }
        FieldSource::ResponseBody { path, .. } => {
            response_json.and_then(|body| walk_path(body, path))
        }
        FieldSource::RequestUrl { pattern, part, .. } => {
            return extract_url_part(&record.url, pattern, part);
        }
        _ => None,
    };

    match found {
        Some(Value::Null) | None => None,
        Some(value) => Some(FieldValue::from_json(value.clone())),
    }
}

fn extract_url_part(url: &str, pattern: &str, part: &UrlPart) -> Option<FieldValue> {
    if !path::match_path(url, pattern) {
        return None;
    }
    match part {
        UrlPart::Param { name } => path::extract_params(url, pattern)
            .remove(name)
            .map(FieldValue::from),
        UrlPart::Segment { index } => {
            path::extract_by_index(url, pattern, *index).map(FieldValue::from)
        }
        UrlPart::Query { name } => path::query_param(url, name).map(FieldValue::from),
        UrlPart::Full => Some(FieldValue::from(url)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::HttpMethod;
    use chrono::Utc;
    use serde_json::json;

    fn get_record(response: &str) -> NetworkRequest {
        NetworkRequest::new("/api/product/1", HttpMethod::Get, Utc::now())
            .with_response_body(response)
    }

    #[test]
    fn test_source_matches_checks_method_and_pattern() {
        let record = NetworkRequest::new("/api/product/1", HttpMethod::Get, Utc::now());
        let matching = FieldSource::response_body(HttpMethod::Get, "/api/product/:id", "price");
        let wrong_method = FieldSource::response_body(HttpMethod::Post, "/api/product/:id", "price");
        let wrong_path = FieldSource::response_body(HttpMethod::Get, "/api/cart", "price");

        assert!(source_matches(&matching, &record));
        assert!(!source_matches(&wrong_method, &record));
        assert!(!source_matches(&wrong_path, &record));
        assert!(!source_matches(&FieldSource::cookie("sid"), &record));
    }

    #[test]
    fn test_parse_body_tolerates_garbage() {
        assert_eq!(parse_body(None), None);
        assert_eq!(parse_body(Some("")), None);
        assert_eq!(parse_body(Some("  ")), None);
        assert_eq!(parse_body(Some("<html>nope</html>")), None);
        assert_eq!(parse_body(Some(r#"{"a":1}"#)), Some(json!({"a": 1})));
    }

    #[test]
    fn test_walk_path() {
        let body = json!({"data": {"items": [{"sku": "A-1"}, {"sku": "B-2"}]}});
        assert_eq!(walk_path(&body, "data.items.1.sku"), Some(&json!("B-2")));
        assert_eq!(walk_path(&body, "data.missing"), None);
        assert_eq!(walk_path(&body, "data.items.9"), None);
        assert_eq!(walk_path(&body, "data.items.x"), None);
        assert_eq!(walk_path(&body, ""), Some(&body));
    }

    #[test]
    fn test_get_request_body_mapping_reads_response() {
        let source = FieldSource::request_body(HttpMethod::Get, "/api/product/:id", "price");
        let record = get_record(r#"{"price": 9.99}"#);
        let response = parse_body(record.response_body.as_deref());

        let value = extract_value(&source, &record, None, response.as_ref());
        assert_eq!(value, Some(FieldValue::Float(9.99)));
    }

    #[test]
    fn test_mutating_method_prefers_request_body() {
        let source = FieldSource::request_body(HttpMethod::Post, "/api/cart", "sku");
        let record = NetworkRequest::new("/api/cart", HttpMethod::Post, Utc::now())
            .with_request_body(r#"{"sku": "from-request"}"#)
            .with_response_body(r#"{"sku": "from-response"}"#);
        let request = parse_body(record.request_body.as_deref());
        let response = parse_body(record.response_body.as_deref());

        let value = extract_value(&source, &record, request.as_ref(), response.as_ref());
        assert_eq!(value, Some(FieldValue::from("from-request")));
    }

    #[test]
    fn test_mutating_method_falls_back_to_response() {
        let source = FieldSource::request_body(HttpMethod::Post, "/api/cart", "orderId");
        let record = NetworkRequest::new("/api/cart", HttpMethod::Post, Utc::now())
            .with_request_body(r#"{"sku": "A-1"}"#)
            .with_response_body(r#"{"orderId": 42}"#);
        let request = parse_body(record.request_body.as_deref());
        let response = parse_body(record.response_body.as_deref());

        let value = extract_value(&source, &record, request.as_ref(), response.as_ref());
        assert_eq!(value, Some(FieldValue::Int(42)));
    }

    #[test]
    fn test_response_body_mapping_ignores_request_body() {
        let source = FieldSource::response_body(HttpMethod::Post, "/api/cart", "sku");
        let record = NetworkRequest::new("/api/cart", HttpMethod::Post, Utc::now())
            .with_request_body(r#"{"sku": "from-request"}"#)
            .with_response_body(r#"{"sku": "from-response"}"#);
        let request = parse_body(record.request_body.as_deref());
        let response = parse_body(record.response_body.as_deref());

        let value = extract_value(&source, &record, request.as_ref(), response.as_ref());
        assert_eq!(value, Some(FieldValue::from("from-response")));
    }

    #[test]
    fn test_json_null_is_no_value() {
        let source = FieldSource::response_body(HttpMethod::Get, "/api/product/:id", "price");
        let record = get_record(r#"{"price": null}"#);
        let response = parse_body(record.response_body.as_deref());
        assert_eq!(extract_value(&source, &record, None, response.as_ref()), None);
    }

    #[test]
    fn test_request_url_param_extraction() {
        let source = FieldSource::request_url(
            HttpMethod::Get,
            "/api/product/:id",
            UrlPart::Param {
                name: "id".to_string(),
            },
        );
        let record = NetworkRequest::new("/api/product/123?full=1", HttpMethod::Get, Utc::now());
        assert_eq!(
            extract_value(&source, &record, None, None),
            Some(FieldValue::from("123"))
        );
    }

    #[test]
    fn test_request_url_query_and_full() {
        let record = NetworkRequest::new("/search?q=shoes", HttpMethod::Get, Utc::now());
        let query = FieldSource::request_url(
            HttpMethod::Get,
            "/search",
            UrlPart::Query {
                name: "q".to_string(),
            },
        );
        let full = FieldSource::request_url(HttpMethod::Get, "/search", UrlPart::Full);

        assert_eq!(
            extract_value(&query, &record, None, None),
            Some(FieldValue::from("shoes"))
        );
        assert_eq!(
            extract_value(&full, &record, None, None),
            Some(FieldValue::from("/search?q=shoes"))
        );
    }
}
