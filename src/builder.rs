//! Payload orchestration.
//!
//! `PayloadBuilder` is the entry point the UI trigger detectors call. It
//! splits a rule's mappings into fields resolvable right now and fields
//! that must wait for network traffic, resolves the immediate ones, opens
//! an execution context for the rest, and wires the observer so future
//! requests are checked against the rule. Identity fields short-circuit
//! through the cached identity or an anonymous fallback and never block.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::{CompletionCallback, ContextManager};
use crate::error::CorelayResult;
use crate::identity::{IdentityResolver, IdentityStore, USER_ID_FIELD};
use crate::observer::{NetworkObserver, RequestInterceptor};
use crate::page::PageEnvironment;
use crate::path;
use crate::rule::{FieldSource, TrackingRule, UrlPart};
use crate::trigger::TriggerContext;
use crate::value::{FieldValue, Payload};

/// The correlation engine's orchestrator and public entry point.
///
/// Constructing a builder wires up the whole engine: the context manager,
/// the network observer over it, and the identity resolver. The observer
/// still has to be installed into the host's request mechanism separately
/// (see [`NetworkObserver::install`]).
pub struct PayloadBuilder {
    config: EngineConfig,
    contexts: Arc<ContextManager>,
    observer: Arc<NetworkObserver>,
    page: Arc<dyn PageEnvironment>,
    identity: IdentityResolver,
    recent_triggers: Mutex<HashMap<[u8; 32], DateTime<Utc>>>,
    suppressed: AtomicU64,
}

impl PayloadBuilder {
    /// Wires up an engine over the host's page and identity capabilities.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        page: Arc<dyn PageEnvironment>,
        identity_store: Arc<dyn IdentityStore>,
    ) -> Self {
        let contexts = Arc::new(ContextManager::new(&config));
        let observer = Arc::new(NetworkObserver::new(&config, Arc::clone(&contexts)));
        Self {
            config,
            contexts,
            observer,
            page,
            identity: IdentityResolver::new(identity_store),
            recent_triggers: Mutex::new(HashMap::new()),
            suppressed: AtomicU64::new(0),
        }
    }

    /// The engine's context manager.
    #[must_use]
    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    /// The engine's network observer.
    #[must_use]
    pub fn observer(&self) -> &Arc<NetworkObserver> {
        &self.observer
    }

    /// Triggers suppressed as duplicates so far.
    #[must_use]
    pub fn suppressed_triggers(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Hooks the engine's observer into the host's request mechanism.
    ///
    /// Idempotent; see [`NetworkObserver::install`].
    pub fn install(&self, interceptor: &dyn RequestInterceptor) -> CorelayResult<()> {
        NetworkObserver::install(&self.observer, interceptor)
    }

    /// Unhooks the engine's observer.
    pub fn uninstall(&self, interceptor: &dyn RequestInterceptor) -> CorelayResult<()> {
        self.observer.uninstall(interceptor)
    }

    /// Handles one trigger firing, stamped with the current time.
    ///
    /// See [`PayloadBuilder::handle_trigger_at`].
    pub fn handle_trigger(
        &self,
        rule: &TrackingRule,
        trigger: &TriggerContext,
        on_complete: CompletionCallback,
    ) -> bool {
        self.handle_trigger_at(rule, trigger, Utc::now(), on_complete)
    }

    /// Handles one trigger firing at an explicit timestamp.
    ///
    /// For a rule without deferred mappings the callback fires with the
    /// resolvable fields before this returns and no context is created.
    /// Otherwise a context opens for the deferred field names, resolved
    /// synchronous fields ride along into it, identity fields
    /// short-circuit, and the rule is registered with the observer.
    ///
    /// Returns false when the firing was suppressed as a duplicate; the
    /// callback is not invoked in that case.
    pub fn handle_trigger_at(
        &self,
        rule: &TrackingRule,
        trigger: &TriggerContext,
        now: DateTime<Utc>,
        on_complete: CompletionCallback,
    ) -> bool {
        if self.is_duplicate(rule, trigger, now) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(rule = %rule.id, "duplicate trigger suppressed");
            return false;
        }

        let resolved: Vec<(String, FieldValue)> = rule
            .sync_mappings()
            .filter_map(|m| {
                self.resolve_sync(&m.field, &m.source, trigger)
                    .map(|v| (m.field.clone(), v))
            })
            .collect();

        let required: HashSet<String> = rule.deferred_mappings().map(|m| m.field.clone()).collect();

        if required.is_empty() {
            let payload: Payload = resolved.into_iter().collect();
            debug!(rule = %rule.id, fields = payload.len(), "synchronous rule completed");
            on_complete(payload);
            return true;
        }

        let has_identity_field = required.contains(USER_ID_FIELD);
        let context_id = self
            .contexts
            .create_context(rule.id.clone(), required, now, on_complete);

        // Ride-alongs must land before the identity swap, which can
        // complete the context when identity was the only deferred field.
        for (field, value) in resolved {
            self.contexts.collect_field(context_id, &field, value);
        }

        if has_identity_field {
            let identity = self.identity.resolve();
            debug!(rule = %rule.id, field = %identity.field, "identity short-circuit");
            if self
                .contexts
                .replace_required_field(context_id, USER_ID_FIELD, &identity.field)
            {
                self.contexts.collect_field(
                    context_id,
                    &identity.field,
                    FieldValue::from(identity.value),
                );
            }
        }

        if let Err(err) = self.observer.register_rule(rule.clone()) {
            warn!(rule = %rule.id, error = %err, "rule registration failed");
        }
        true
    }

    /// Resolves one synchronous source. Pure, absence-tolerant, panic-free.
    fn resolve_sync(
        &self,
        field: &str,
        source: &FieldSource,
        trigger: &TriggerContext,
    ) -> Option<FieldValue> {
        match source {
            FieldSource::Element { attribute } => match attribute {
                Some(attr) => trigger.target.attr(attr).map(FieldValue::from),
                // Detector-extracted extras win over the raw text snapshot.
                None => trigger
                    .extras
                    .get(field)
                    .cloned()
                    .or_else(|| trigger.target.text.as_deref().map(FieldValue::from)),
            },
            FieldSource::Cookie { name } => self.page.cookie(name).map(FieldValue::from),
            FieldSource::LocalStore { key } => self.page.local_item(key).map(FieldValue::from),
            FieldSource::SessionStore { key } => self.page.session_item(key).map(FieldValue::from),
            FieldSource::PageUrl { part } => resolve_page_url(&self.page.page_url(), part),
            FieldSource::Static { value } => Some(value.clone()),
            FieldSource::IdentityProvider => {
                Some(FieldValue::from(self.identity.resolve().value))
            }
            // Deferred sources resolve through the observer, never here.
            _ => None,
        }
    }

    fn is_duplicate(&self, rule: &TrackingRule, trigger: &TriggerContext, now: DateTime<Utc>) -> bool {
        if self.config.duplicate_window.is_zero() {
            return false;
        }
        let window = chrono::Duration::from_std(self.config.duplicate_window)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(500));

        let key = suppression_key(rule, trigger);
        let mut recent = self
            .recent_triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        recent.retain(|_, seen| now.signed_duration_since(*seen) < window);
        if recent.contains_key(&key) {
            return true;
        }
        recent.insert(key, now);
        false
    }
}

/// Stable duplicate-suppression key: rule id, event type, and the target's
/// identity attribute.
fn suppression_key(rule: &TrackingRule, trigger: &TriggerContext) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(rule.id.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(rule.event_type.as_bytes());
    hasher.update(&[0]);
    if let Some(identity) = trigger.target.identity() {
        hasher.update(identity.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

fn resolve_page_url(url: &str, part: &UrlPart) -> Option<FieldValue> {
    match part {
        UrlPart::Segment { index } => path::path_segments(url)
            .get(*index)
            .cloned()
            .map(FieldValue::from),
        UrlPart::Query { name } => path::query_param(url, name).map(FieldValue::from),
        UrlPart::Full => Some(FieldValue::from(url)),
        // Named parameters need a request pattern; meaningless for the
        // page url.
        UrlPart::Param { .. } => None,
    }
}

impl std::fmt::Debug for PayloadBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadBuilder")
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}
