//! Tracking rules and field mappings.
//!
//! A rule declares which payload fields an event needs and where each one
//! comes from. Rules are produced by the configuration loader at page load
//! and are read-only for the lifetime of the page.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CorelayResult, ValidationError};
use crate::value::FieldValue;

/// Unique identifier for a tracking rule.
///
/// Rule ids come from configuration, so this is a string newtype rather
/// than a generated id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    /// Wraps a configured rule id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw configured id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// HTTP methods a network mapping can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Returns true for the body-less verb.
    ///
    /// Request-body extraction is re-routed to the response for these.
    #[must_use]
    pub const fn is_bodyless(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unsupported HTTP method: {other}")),
        }
    }
}

/// Which part of a URL a URL-sourced mapping extracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "part", rename_all = "snake_case")]
pub enum UrlPart {
    /// A named parameter captured by the mapping's URL pattern.
    Param {
        name: String,
    },
    /// The `index`-th path segment (zero-based).
    Segment {
        index: usize,
    },
    /// A query-string parameter.
    Query {
        name: String,
    },
    /// The whole URL as observed.
    Full,
}

/// Where one payload field's value comes from.
///
/// Sources split into two families: synchronous sources resolve at trigger
/// time from state already on the page, deferred sources resolve later from
/// an observed network call. [`FieldSource::is_deferred`] is the partition
/// the payload builder runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FieldSource {
    /// An attribute (or the text content) of the interacted element.
    Element {
        /// Attribute name; `None` reads the element's text content.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute: Option<String>,
    },

    /// A cookie by name.
    Cookie {
        name: String,
    },

    /// A localStorage entry by key.
    LocalStore {
        key: String,
    },

    /// A sessionStorage entry by key.
    SessionStore {
        key: String,
    },

    /// A piece of the current page URL.
    PageUrl {
        #[serde(flatten)]
        part: UrlPart,
    },

    /// A literal constant from configuration.
    Static {
        value: FieldValue,
    },

    /// The resolved user identity (cached or anonymous fallback).
    IdentityProvider,

    /// A JSON path into the body of a matching outgoing request.
    RequestBody {
        method: HttpMethod,
        pattern: String,
        path: String,
    },

    /// A JSON path into the response body of a matching request.
    ResponseBody {
        method: HttpMethod,
        pattern: String,
        path: String,
    },

    /// A piece of the URL of a matching request.
    RequestUrl {
        method: HttpMethod,
        pattern: String,
        #[serde(flatten)]
        part: UrlPart,
    },
}

impl FieldSource {
    /// Creates an element text-content source.
    #[must_use]
    pub const fn element_text() -> Self {
        Self::Element { attribute: None }
    }

    /// Creates an element attribute source.
    #[must_use]
    pub fn element_attr(attribute: impl Into<String>) -> Self {
        Self::Element {
            attribute: Some(attribute.into()),
        }
    }

    /// Creates a cookie source.
    #[must_use]
    pub fn cookie(name: impl Into<String>) -> Self {
        Self::Cookie { name: name.into() }
    }

    /// Creates a localStorage source.
    #[must_use]
    pub fn local_store(key: impl Into<String>) -> Self {
        Self::LocalStore { key: key.into() }
    }

    /// Creates a sessionStorage source.
    #[must_use]
    pub fn session_store(key: impl Into<String>) -> Self {
        Self::SessionStore { key: key.into() }
    }

    /// Creates a static literal source.
    #[must_use]
    pub fn static_value(value: impl Into<FieldValue>) -> Self {
        Self::Static {
            value: value.into(),
        }
    }

    /// Creates a request-body source.
    #[must_use]
    pub fn request_body(
        method: HttpMethod,
        pattern: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::RequestBody {
            method,
            pattern: pattern.into(),
            path: path.into(),
        }
    }

    /// Creates a response-body source.
    #[must_use]
    pub fn response_body(
        method: HttpMethod,
        pattern: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::ResponseBody {
            method,
            pattern: pattern.into(),
            path: path.into(),
        }
    }

    /// Creates a request-url source.
    #[must_use]
    pub fn request_url(method: HttpMethod, pattern: impl Into<String>, part: UrlPart) -> Self {
        Self::RequestUrl {
            method,
            pattern: pattern.into(),
            part,
        }
    }

    /// Returns true when the value only materializes inside a later
    /// outgoing network call.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(
            self,
            Self::RequestBody { .. } | Self::ResponseBody { .. } | Self::RequestUrl { .. }
        )
    }

    /// The declared method and URL pattern, for deferred sources.
    ///
    /// This is what the observer's security gate checks before parsing any
    /// body text.
    #[must_use]
    pub fn network_shape(&self) -> Option<(HttpMethod, &str)> {
        match self {
            Self::RequestBody { method, pattern, .. }
            | Self::ResponseBody { method, pattern, .. }
            | Self::RequestUrl { method, pattern, .. } => Some((*method, pattern.as_str())),
            _ => None,
        }
    }
}

/// One output field of a payload and its extraction recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Output key in the finished payload.
    pub field: String,
    /// Where the value comes from.
    #[serde(flatten)]
    pub source: FieldSource,
}

impl FieldMapping {
    /// Creates a mapping.
    #[must_use]
    pub fn new(field: impl Into<String>, source: FieldSource) -> Self {
        Self {
            field: field.into(),
            source,
        }
    }
}

/// A declarative tracking rule: which event, which target, which fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRule {
    /// Configured rule id.
    pub id: RuleId,
    /// Event-type id reported to the collector.
    pub event_type: String,

    /// Optional action qualifier (e.g. a rating submit vs. a rating edit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// CSS selector the trigger detectors bind to.
    pub target_selector: String,
    /// Ordered field mappings.
    pub mappings: Vec<FieldMapping>,
}

impl TrackingRule {
    /// Creates a rule with no mappings.
    #[must_use]
    pub fn new(
        id: impl Into<RuleId>,
        event_type: impl Into<String>,
        target_selector: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            action: None,
            target_selector: target_selector.into(),
            mappings: Vec::new(),
        }
    }

    /// Sets the action qualifier.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Appends a field mapping.
    #[must_use]
    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Mappings whose values arrive from later network calls.
    pub fn deferred_mappings(&self) -> impl Iterator<Item = &FieldMapping> {
        self.mappings.iter().filter(|m| m.source.is_deferred())
    }

    /// Mappings resolvable synchronously at trigger time.
    pub fn sync_mappings(&self) -> impl Iterator<Item = &FieldMapping> {
        self.mappings.iter().filter(|m| !m.source.is_deferred())
    }

    /// Checks the rule is well-formed enough to register.
    pub fn validate(&self) -> CorelayResult<()> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyRuleId.into());
        }
        if self.mappings.is_empty() {
            return Err(ValidationError::NoMappings {
                rule_id: self.id.to_string(),
            }
            .into());
        }
        for m in &self.mappings {
            if m.field.trim().is_empty() {
                return Err(ValidationError::EmptyFieldName {
                    rule_id: self.id.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

impl From<String> for RuleId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}
