//! Trigger contexts handed to the engine by the UI detectors.
//!
//! The engine never touches live DOM handles. Detectors capture a snapshot
//! of the interacted element (attributes + text) at trigger time and pass
//! it in read-only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

/// A point-in-time snapshot of a DOM element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    /// Attribute name to value, as captured by the detector.
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Text content, if the detector captured it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ElementSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Sets the text content.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Looks up an attribute value.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// A stable-ish identity for the element: its `id` attribute when
    /// present, otherwise its text content.
    ///
    /// Used to compose duplicate-suppression keys.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.attr("id").or(self.text.as_deref())
    }
}

/// Everything the engine knows about one trigger firing.
///
/// Created per firing by the (out-of-scope) detector; the engine reads it
/// and never mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    /// The interacted element.
    pub target: ElementSnapshot,

    /// Enclosing container (e.g. the widget the element sits in).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ElementSnapshot>,

    /// Event-kind-specific extras keyed by payload field name, e.g. review
    /// free text the detector already extracted.
    #[serde(default)]
    pub extras: HashMap<String, FieldValue>,
}

impl TriggerContext {
    /// Creates a context around a target snapshot.
    #[must_use]
    pub fn new(target: ElementSnapshot) -> Self {
        Self {
            target,
            container: None,
            extras: HashMap::new(),
        }
    }

    /// Sets the container snapshot.
    #[must_use]
    pub fn with_container(mut self, container: ElementSnapshot) -> Self {
        self.container = Some(container);
        self
    }

    /// Adds an extra value under a payload field name.
    #[must_use]
    pub fn with_extra(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.extras.insert(field.into(), value.into());
        self
    }
}
