//! URL pattern matching and parameter extraction.
//!
//! Patterns are literal path segments mixed with named parameters
//! (`:name` or `{name}`). A compiled pattern matches a URL either as the
//! full path or, failing that, as an ordered subsequence of the URL's
//! segments, so `product/:id` still matches `/api/v2/product/123/details`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use crate::error::{CorelayError, CorelayResult, ValidationError};

const PATTERN_CACHE_MAX: usize = 1024;

static PATTERN_CACHE: OnceLock<RwLock<HashMap<String, Arc<CompiledPath>>>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Param(String),
}

/// A compiled URL pattern: anchored regex plus ordered parameter names.
#[derive(Debug)]
pub struct CompiledPath {
    regex: Regex,
    params: Vec<String>,
    segments: Vec<PatternSegment>,
}

impl CompiledPath {
    /// Ordered names of the pattern's parameters.
    #[must_use]
    pub fn param_names(&self) -> &[String] {
        &self.params
    }
}

/// Compiles a pattern, via a bounded process-wide cache.
pub fn compile(pattern: &str) -> CorelayResult<Arc<CompiledPath>> {
    let cache = PATTERN_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache
            .read()
            .map_err(|_| CorelayError::internal("pattern cache lock poisoned"))?;
        if let Some(compiled) = guard.get(pattern) {
            return Ok(Arc::clone(compiled));
        }
    }

    let compiled = Arc::new(compile_uncached(pattern)?);

    let mut guard = cache
        .write()
        .map_err(|_| CorelayError::internal("pattern cache lock poisoned"))?;

    if guard.len() >= PATTERN_CACHE_MAX {
        // Keep the cache bounded to avoid unbounded memory usage.
        guard.clear();
    }

    // Another thread may have inserted it while we compiled.
    let entry = guard
        .entry(pattern.to_string())
        .or_insert_with(|| Arc::clone(&compiled));
    Ok(Arc::clone(entry))
}

fn compile_uncached(pattern: &str) -> CorelayResult<CompiledPath> {
    let invalid = |reason: &str| {
        CorelayError::Validation(ValidationError::InvalidUrlPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        })
    };

    let normalized = normalize_pattern(pattern);
    let raw_segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    if raw_segments.is_empty() {
        return Err(invalid("pattern has no path segments"));
    }

    let mut segments = Vec::with_capacity(raw_segments.len());
    let mut params = Vec::new();
    for raw in raw_segments {
        if let Some(name) = raw.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid("parameter segment has no name"));
            }
            params.push(name.to_string());
            segments.push(PatternSegment::Param(name.to_string()));
        } else if let Some(name) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            if name.is_empty() {
                return Err(invalid("parameter segment has no name"));
            }
            params.push(name.to_string());
            segments.push(PatternSegment::Param(name.to_string()));
        } else {
            segments.push(PatternSegment::Literal(raw.to_string()));
        }
    }

    let body = segments
        .iter()
        .map(|seg| match seg {
            PatternSegment::Literal(lit) => regex::escape(lit),
            PatternSegment::Param(_) => "([^/]+)".to_string(),
        })
        .collect::<Vec<_>>()
        .join("/");

    // Trailing slash tolerated; queries are stripped during normalization.
    let regex = Regex::new(&format!("^/{body}/?$"))
        .map_err(|e| invalid(&format!("regex compilation failed: {e}")))?;

    Ok(CompiledPath {
        regex,
        params,
        segments,
    })
}

/// Reduces a URL to a comparable path.
///
/// Absolute URLs resolve to their path component; query and fragment are
/// stripped; anything unparseable is treated as a raw path.
#[must_use]
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();

    let path = if let Some(scheme_end) = trimmed.find("://") {
        let after = &trimmed[scheme_end + 3..];
        match after.find('/') {
            Some(idx) => &after[idx..],
            None => "/",
        }
    } else if let Some(after) = trimmed.strip_prefix("//") {
        // Protocol-relative.
        match after.find('/') {
            Some(idx) => &after[idx..],
            None => "/",
        }
    } else {
        trimmed
    };

    let path = path.split(['?', '#']).next().unwrap_or(path);
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn normalize_pattern(pattern: &str) -> String {
    normalize_url(pattern)
}

/// Path segments of a URL, after normalization.
#[must_use]
pub fn path_segments(url: &str) -> Vec<String> {
    normalize_url(url)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// A query-string parameter of a URL, raw (not percent-decoded).
#[must_use]
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split('#').next().unwrap_or(url).split('?').nth(1)?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            return Some(parts.next().unwrap_or("").to_string());
        }
    }
    None
}

/// Whether a URL satisfies a pattern.
///
/// Tries a full-path match first, then the partial subsequence fallback.
/// An uncompilable pattern never matches.
#[must_use]
pub fn match_path(url: &str, pattern: &str) -> bool {
    let Ok(compiled) = compile(pattern) else {
        return false;
    };

    if compiled.regex.is_match(&normalize_url(url)) {
        return true;
    }

    let url_segments = path_segments(url);
    subsequence_alignment(&url_segments, &compiled.segments).is_some()
}

/// Extracts named parameters from a matching URL.
///
/// Returns an empty map when the URL does not match.
#[must_use]
pub fn extract_params(url: &str, pattern: &str) -> HashMap<String, String> {
    let Ok(compiled) = compile(pattern) else {
        return HashMap::new();
    };

    let normalized = normalize_url(url);
    if let Some(captures) = compiled.regex.captures(&normalized) {
        return compiled
            .params
            .iter()
            .zip(captures.iter().skip(1))
            .filter_map(|(name, group)| group.map(|g| (name.clone(), g.as_str().to_string())))
            .collect();
    }

    let url_segments = path_segments(url);
    let Some(alignment) = subsequence_alignment(&url_segments, &compiled.segments) else {
        return HashMap::new();
    };

    compiled
        .segments
        .iter()
        .zip(alignment)
        .filter_map(|(seg, idx)| match seg {
            PatternSegment::Param(name) => Some((name.clone(), url_segments[idx].clone())),
            PatternSegment::Literal(_) => None,
        })
        .collect()
}

/// The `index`-th path segment of a URL, provided the URL matches.
#[must_use]
pub fn extract_by_index(url: &str, pattern: &str, index: usize) -> Option<String> {
    if !match_path(url, pattern) {
        return None;
    }
    path_segments(url).get(index).cloned()
}

/// Greedy leftmost alignment of pattern segments over URL segments.
///
/// Each pattern segment must be found after the previous one; literals
/// match exactly, parameters match any single non-empty segment.
fn subsequence_alignment(
    url_segments: &[String],
    pattern_segments: &[PatternSegment],
) -> Option<Vec<usize>> {
    let mut out = Vec::with_capacity(pattern_segments.len());
    let mut cursor = 0;

    for seg in pattern_segments {
        let mut found = None;
        while cursor < url_segments.len() {
            let candidate = &url_segments[cursor];
            cursor += 1;
            match seg {
                PatternSegment::Literal(lit) => {
                    if candidate == lit {
                        found = Some(cursor - 1);
                        break;
                    }
                }
                PatternSegment::Param(_) => {
                    found = Some(cursor - 1);
                    break;
                }
            }
        }
        out.push(found?);
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match_with_params() {
        assert!(match_path(
            "/api/product/123/details",
            "/api/product/:id/details"
        ));
        let params = extract_params("/api/product/123/details", "/api/product/:id/details");
        assert_eq!(params.get("id").map(String::as_str), Some("123"));
    }

    #[test]
    fn test_partial_subsequence_match() {
        assert!(match_path("/api/v2/product/123/details", "product/:id"));
        let params = extract_params("/api/v2/product/123/details", "product/:id");
        assert_eq!(params.get("id").map(String::as_str), Some("123"));
    }

    #[test]
    fn test_brace_parameter_syntax() {
        assert!(match_path("/orders/42", "/orders/{orderId}"));
        let params = extract_params("/orders/42", "/orders/{orderId}");
        assert_eq!(params.get("orderId").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_query_suffix_ignored() {
        assert!(match_path("/api/product/9?ref=home", "/api/product/:id"));
        let params = extract_params("/api/product/9?ref=home#top", "/api/product/:id");
        assert_eq!(params.get("id").map(String::as_str), Some("9"));
    }

    #[test]
    fn test_absolute_url_resolves_to_path() {
        assert!(match_path(
            "https://shop.example/api/product/5",
            "/api/product/:id"
        ));
        assert!(match_path("//cdn.example/assets/logo.png", "/assets/:file"));
    }

    #[test]
    fn test_invalid_url_treated_as_raw_path() {
        assert!(match_path("not a url/product/3", "product/:id"));
    }

    #[test]
    fn test_literal_segment_must_match_exactly() {
        assert!(!match_path("/api/products/1", "/api/product/:id"));
        assert!(!match_path("/api", "/api/product/:id"));
    }

    #[test]
    fn test_no_match_yields_empty_params() {
        assert!(extract_params("/checkout", "/api/product/:id").is_empty());
    }

    #[test]
    fn test_extract_by_index_requires_match() {
        assert_eq!(
            extract_by_index("/api/product/123", "/api/product/:id", 2),
            Some("123".to_string())
        );
        assert_eq!(extract_by_index("/checkout", "/api/product/:id", 0), None);
    }

    #[test]
    fn test_trailing_slash_tolerated() {
        assert!(match_path("/api/product/123/", "/api/product/:id"));
    }

    #[test]
    fn test_param_order_preserved() {
        let compiled = compile("/a/:first/b/:second").unwrap();
        assert_eq!(compiled.param_names(), ["first", "second"]);
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        assert!(compile("/").is_err());
        assert!(compile("/a/:").is_err());
        assert!(compile("/a/{}").is_err());
    }

    #[test]
    fn test_compile_cache_returns_shared_instance() {
        let a = compile("/cache/:probe").unwrap();
        let b = compile("/cache/:probe").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_query_param_lookup() {
        assert_eq!(
            query_param("/search?q=shoes&page=2", "page").as_deref(),
            Some("2")
        );
        assert_eq!(query_param("/search?q=shoes", "missing"), None);
        assert_eq!(query_param("/search", "q"), None);
    }

    #[test]
    fn test_regex_metacharacters_escaped() {
        assert!(match_path("/a.b/x", "/a.b/:v"));
        assert!(!match_path("/aXb/x", "/a.b/:v"));
    }
}
