//! Network observation and correlation dispatch.
//!
//! A single observer per page wraps the host's outbound-request mechanism
//! so every request/response pair is visible to the engine without
//! instrumenting individual call sites. The observer never parses a body
//! until a registered rule is known to care about the request, buffers
//! early traffic for the identity resolver, and drives context deadlines
//! from a background sweeper.

/// Value extraction and method-aware routing.
mod extract;
/// Observed request records.
pub mod record;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::ContextManager;
use crate::error::CorelayResult;
use crate::identity::IdentitySink;
use crate::rule::{RuleId, TrackingRule};

use self::extract::{extract_value, parse_body, source_matches};
pub use self::record::NetworkRequest;

/// Receives every observed request/response pair.
pub trait RequestSink: Send + Sync {
    /// Called once per completed request/response pair.
    fn on_request(&self, record: NetworkRequest);
}

/// The host's outbound-request interception capability.
///
/// A browser host satisfies this by wrapping fetch/XHR; tests use a fake
/// that forwards records to the subscribed sink. `install` must be safe to
/// call once per sink.
pub trait RequestInterceptor: Send + Sync {
    /// Subscribes a sink to every outgoing request.
    fn install(&self, sink: Arc<dyn RequestSink>) -> CorelayResult<()>;

    /// Removes the subscription.
    fn uninstall(&self) -> CorelayResult<()>;
}

struct Sweeper {
    shutdown: Sender<()>,
    join: Option<JoinHandle<()>>,
}

/// Process-wide network observer.
///
/// Explicitly constructed, installed at most once at a time; all
/// registration state lives on this service and is reached through its
/// methods, never through globals.
pub struct NetworkObserver {
    contexts: Arc<ContextManager>,
    sweep_interval: Duration,
    replay_capacity: usize,
    rules: RwLock<HashMap<RuleId, TrackingRule>>,
    identity_sink: RwLock<Option<Arc<dyn IdentitySink>>>,
    replay_buffer: Mutex<VecDeque<NetworkRequest>>,
    dropped_replays: AtomicU64,
    installed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl NetworkObserver {
    /// Creates an observer over a context manager.
    #[must_use]
    pub fn new(config: &EngineConfig, contexts: Arc<ContextManager>) -> Self {
        Self {
            contexts,
            sweep_interval: config.sweep_interval.max(Duration::from_millis(1)),
            replay_capacity: config.replay_buffer_capacity.max(1),
            rules: RwLock::new(HashMap::new()),
            identity_sink: RwLock::new(None),
            replay_buffer: Mutex::new(VecDeque::new()),
            dropped_replays: AtomicU64::new(0),
            installed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Hooks the observer into the host's request mechanism.
    ///
    /// Idempotent: a second install while already installed is a no-op.
    /// Also starts the background deadline sweeper. Associated function
    /// because the observer subscribes itself as the interceptor's sink.
    pub fn install(
        observer: &Arc<Self>,
        interceptor: &dyn RequestInterceptor,
    ) -> CorelayResult<()> {
        if observer.installed.swap(true, Ordering::AcqRel) {
            debug!("observer already installed");
            return Ok(());
        }

        if let Err(err) = interceptor.install(Arc::clone(observer) as Arc<dyn RequestSink>) {
            observer.installed.store(false, Ordering::Release);
            return Err(err);
        }

        observer.spawn_sweeper();
        info!("network observer installed");
        Ok(())
    }

    /// Unhooks the observer and stops the sweeper.
    ///
    /// Idempotent; the observer can be installed again afterwards.
    pub fn uninstall(&self, interceptor: &dyn RequestInterceptor) -> CorelayResult<()> {
        if !self.installed.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(err) = interceptor.uninstall() {
            self.installed.store(true, Ordering::Release);
            return Err(err);
        }

        if let Some(mut sweeper) = self.sweeper_slot().take() {
            let _ = sweeper.shutdown.try_send(());
            if let Some(handle) = sweeper.join.take() {
                let _ = handle.join();
            }
        }
        info!("network observer uninstalled");
        Ok(())
    }

    /// Whether the observer is currently installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Declares interest in a rule's network traffic.
    ///
    /// The security gate only ever matches registered rules. Registering
    /// the same rule id again replaces the previous registration.
    pub fn register_rule(&self, rule: TrackingRule) -> CorelayResult<()> {
        rule.validate()?;
        debug!(rule = %rule.id, "rule registered with observer");
        if let Ok(mut rules) = self.rules.write() {
            rules.insert(rule.id.clone(), rule);
        }
        Ok(())
    }

    /// Retracts interest in a rule. Returns true if it was registered.
    pub fn unregister_rule(&self, id: &RuleId) -> bool {
        let removed = self
            .rules
            .write()
            .map(|mut rules| rules.remove(id).is_some())
            .unwrap_or(false);
        if removed {
            debug!(rule = %id, "rule unregistered from observer");
        }
        removed
    }

    /// Number of registered rules.
    #[must_use]
    pub fn registered_rules(&self) -> usize {
        self.rules.read().map(|rules| rules.len()).unwrap_or(0)
    }

    /// Attaches the identity resolver's request sink.
    ///
    /// Requests observed before this point were buffered; they replay to
    /// the sink immediately, oldest first.
    pub fn attach_identity_sink(&self, sink: Arc<dyn IdentitySink>) {
        if let Ok(mut slot) = self.identity_sink.write() {
            *slot = Some(Arc::clone(&sink));
        }

        let buffered: Vec<NetworkRequest> = {
            let mut buffer = self.replay_lock();
            buffer.drain(..).collect()
        };
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "replaying buffered requests to identity sink");
        }
        for record in &buffered {
            sink.observe_request(record);
        }
    }

    /// Requests dropped from the identity replay buffer.
    #[must_use]
    pub fn dropped_replays(&self) -> u64 {
        self.dropped_replays.load(Ordering::Relaxed)
    }

    /// Correlates one observed request/response pair.
    ///
    /// The gate runs first: unless some registered rule declares a
    /// deferred mapping matching this method+URL, no body text is parsed
    /// and the record is forgotten.
    pub fn handle_request(&self, record: &NetworkRequest) {
        self.feed_identity(record);

        let interested: Vec<TrackingRule> = {
            let Ok(rules) = self.rules.read() else {
                return;
            };
            rules
                .values()
                .filter(|rule| {
                    rule.deferred_mappings()
                        .any(|m| source_matches(&m.source, record))
                })
                .cloned()
                .collect()
        };
        if interested.is_empty() {
            return;
        }

        // Gate passed: parse each body once, shared by all interested rules.
        let request_json = parse_body(record.request_body.as_deref());
        let response_json = parse_body(record.response_body.as_deref());

        for rule in &interested {
            let Some(context_id) = self
                .contexts
                .find_matching_context(&rule.id, record.timestamp)
            else {
                debug!(rule = %rule.id, url = %record.url, "rule matched but no pending context in window");
                continue;
            };

            for mapping in rule.deferred_mappings() {
                if !source_matches(&mapping.source, record) {
                    continue;
                }
                if let Some(value) = extract_value(
                    &mapping.source,
                    record,
                    request_json.as_ref(),
                    response_json.as_ref(),
                ) {
                    debug!(rule = %rule.id, field = %mapping.field, "deferred field collected");
                    self.contexts.collect_field(context_id, &mapping.field, value);
                }
            }
        }
    }

    fn feed_identity(&self, record: &NetworkRequest) {
        let sink = self.identity_sink.read().ok().and_then(|slot| slot.clone());
        if let Some(sink) = sink {
            sink.observe_request(record);
            return;
        }

        let mut buffer = self.replay_lock();
        if buffer.len() >= self.replay_capacity {
            buffer.pop_front();
            self.dropped_replays.fetch_add(1, Ordering::Relaxed);
            debug!("identity replay buffer full; oldest request dropped");
        }
        buffer.push_back(record.clone());
    }

    fn spawn_sweeper(&self) {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let contexts = Arc::clone(&self.contexts);
        let interval = self.sweep_interval;

        let join = thread::Builder::new()
            .name("corelay-sweeper".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => contexts.tick(Utc::now()),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match join {
            Ok(handle) => {
                *self.sweeper_slot() = Some(Sweeper {
                    shutdown: shutdown_tx,
                    join: Some(handle),
                });
            }
            Err(err) => {
                // Deadlines then only advance through explicit ticks.
                warn!(error = %err, "failed to spawn sweeper thread");
            }
        }
    }

    fn sweeper_slot(&self) -> std::sync::MutexGuard<'_, Option<Sweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replay_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<NetworkRequest>> {
        self.replay_buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl RequestSink for NetworkObserver {
    fn on_request(&self, record: NetworkRequest) {
        self.handle_request(&record);
    }
}

impl Drop for NetworkObserver {
    fn drop(&mut self) {
        // Drop the shutdown sender so the sweeper exits on its own instead
        // of joining here; a join could stall host teardown.
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(mut sweeper) = slot.take() {
                drop(sweeper.shutdown);
                if let Some(handle) = sweeper.join.take() {
                    drop(handle);
                }
            }
        }
    }
}

impl std::fmt::Debug for NetworkObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkObserver")
            .field("installed", &self.is_installed())
            .field("rules", &self.registered_rules())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use crate::context::CompletionCallback;
    use crate::rule::{FieldMapping, FieldSource, HttpMethod};
    use crate::value::{FieldValue, Payload};

    struct FakeInterceptor {
        sink: Mutex<Option<Arc<dyn RequestSink>>>,
        installs: AtomicUsize,
    }

    impl FakeInterceptor {
        fn new() -> Self {
            Self {
                sink: Mutex::new(None),
                installs: AtomicUsize::new(0),
            }
        }

        fn emit(&self, record: NetworkRequest) {
            let sink = self.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                sink.on_request(record);
            }
        }
    }

    impl RequestInterceptor for FakeInterceptor {
        fn install(&self, sink: Arc<dyn RequestSink>) -> CorelayResult<()> {
            *self.sink.lock().unwrap() = Some(sink);
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn uninstall(&self) -> CorelayResult<()> {
            *self.sink.lock().unwrap() = None;
            Ok(())
        }
    }

    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    impl IdentitySink for RecordingSink {
        fn observe_request(&self, record: &NetworkRequest) {
            self.seen.lock().unwrap().push(record.url.clone());
        }
    }

    fn observer() -> (Arc<NetworkObserver>, Arc<ContextManager>) {
        let contexts = Arc::new(ContextManager::new(&EngineConfig::default()));
        let observer = Arc::new(NetworkObserver::new(
            &EngineConfig::default(),
            Arc::clone(&contexts),
        ));
        (observer, contexts)
    }

    fn price_rule() -> TrackingRule {
        TrackingRule::new("product-view", "product_view", ".product").with_mapping(
            FieldMapping::new(
                "price",
                FieldSource::response_body(HttpMethod::Get, "/api/product/:id", "data.price"),
            ),
        )
    }

    fn capture() -> (Arc<Mutex<Option<Payload>>>, CompletionCallback) {
        let slot = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&slot);
        let cb: CompletionCallback = Box::new(move |payload| {
            *writer.lock().unwrap() = Some(payload);
        });
        (slot, cb)
    }

    #[test]
    fn install_is_idempotent() {
        let (observer, _) = observer();
        let interceptor = FakeInterceptor::new();

        NetworkObserver::install(&observer, &interceptor).unwrap();
        NetworkObserver::install(&observer, &interceptor).unwrap();
        assert_eq!(interceptor.installs.load(Ordering::SeqCst), 1);
        assert!(observer.is_installed());

        observer.uninstall(&interceptor).unwrap();
        assert!(!observer.is_installed());

        // Reinstall after uninstall is allowed.
        NetworkObserver::install(&observer, &interceptor).unwrap();
        assert_eq!(interceptor.installs.load(Ordering::SeqCst), 2);
        observer.uninstall(&interceptor).unwrap();
    }

    #[test]
    fn register_rejects_invalid_rule() {
        let (observer, _) = observer();
        let invalid = TrackingRule::new("", "e", "sel");
        assert!(observer.register_rule(invalid).is_err());
        assert_eq!(observer.registered_rules(), 0);
    }

    #[test]
    fn matching_request_completes_context() {
        let (observer, contexts) = observer();
        let rule = price_rule();
        observer.register_rule(rule.clone()).unwrap();

        let now = Utc::now();
        let (slot, cb) = capture();
        let required: HashSet<String> = ["price".to_string()].into();
        contexts.create_context(rule.id.clone(), required, now, cb);

        let record = NetworkRequest::new("/api/product/7", HttpMethod::Get, now)
            .with_response_body(r#"{"data": {"price": 19.5}}"#);
        observer.handle_request(&record);

        let payload = slot.lock().unwrap().take().unwrap();
        assert_eq!(payload.get("price"), Some(&FieldValue::Float(19.5)));
    }

    #[test]
    fn unmatched_method_leaves_context_pending() {
        let (observer, contexts) = observer();
        let rule = price_rule();
        observer.register_rule(rule.clone()).unwrap();

        let now = Utc::now();
        let (slot, cb) = capture();
        let required: HashSet<String> = ["price".to_string()].into();
        contexts.create_context(rule.id.clone(), required, now, cb);

        let record = NetworkRequest::new("/api/product/7", HttpMethod::Post, now)
            .with_response_body(r#"{"data": {"price": 19.5}}"#);
        observer.handle_request(&record);

        assert!(slot.lock().unwrap().is_none());
    }

    #[test]
    fn unregistered_rule_is_gated_out() {
        let (observer, contexts) = observer();
        let rule = price_rule();

        let now = Utc::now();
        let (slot, cb) = capture();
        let required: HashSet<String> = ["price".to_string()].into();
        contexts.create_context(rule.id.clone(), required, now, cb);

        let record = NetworkRequest::new("/api/product/7", HttpMethod::Get, now)
            .with_response_body(r#"{"data": {"price": 19.5}}"#);
        observer.handle_request(&record);
        assert!(slot.lock().unwrap().is_none());

        observer.register_rule(rule).unwrap();
        observer.handle_request(&record);
        assert!(slot.lock().unwrap().is_some());
    }

    #[test]
    fn one_request_satisfies_at_most_one_context() {
        let (observer, contexts) = observer();
        let rule = price_rule();
        observer.register_rule(rule.clone()).unwrap();

        let now = Utc::now();
        let (slot_a, cb_a) = capture();
        let (slot_b, cb_b) = capture();
        let required: HashSet<String> = ["price".to_string()].into();
        contexts.create_context(rule.id.clone(), required.clone(), now, cb_a);
        contexts.create_context(
            rule.id.clone(),
            required,
            now + chrono::Duration::milliseconds(10),
            cb_b,
        );

        let record = NetworkRequest::new(
            "/api/product/7",
            HttpMethod::Get,
            now + chrono::Duration::milliseconds(20),
        )
        .with_response_body(r#"{"data": {"price": 5.0}}"#);
        observer.handle_request(&record);

        // Earliest trigger wins; the second context keeps waiting.
        assert!(slot_a.lock().unwrap().is_some());
        assert!(slot_b.lock().unwrap().is_none());
    }

    #[test]
    fn early_requests_replay_to_identity_sink() {
        let (observer, _) = observer();
        let now = Utc::now();

        observer.handle_request(&NetworkRequest::new("/auth/session", HttpMethod::Get, now));
        observer.handle_request(&NetworkRequest::new("/api/me", HttpMethod::Get, now));

        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        observer.attach_identity_sink(Arc::clone(&sink) as Arc<dyn IdentitySink>);

        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec!["/auth/session".to_string(), "/api/me".to_string()]
        );

        // Once attached, requests flow through directly.
        observer.handle_request(&NetworkRequest::new("/api/cart", HttpMethod::Get, now));
        assert_eq!(sink.seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn replay_buffer_is_bounded() {
        let contexts = Arc::new(ContextManager::new(&EngineConfig::default()));
        let config = EngineConfig {
            replay_buffer_capacity: 2,
            ..EngineConfig::default()
        };
        let observer = NetworkObserver::new(&config, contexts);
        let now = Utc::now();

        for i in 0..5 {
            observer.handle_request(&NetworkRequest::new(
                format!("/req/{i}"),
                HttpMethod::Get,
                now,
            ));
        }
        assert_eq!(observer.dropped_replays(), 3);

        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        observer.attach_identity_sink(Arc::clone(&sink) as Arc<dyn IdentitySink>);
        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec!["/req/3".to_string(), "/req/4".to_string()]
        );
    }
}
