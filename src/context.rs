//! Execution contexts: per-trigger correlation bookkeeping.
//!
//! One context exists per trigger firing that declared deferred fields. It
//! tracks which required fields are still outstanding, holds everything
//! collected so far, and carries the completion callback. The state machine
//! is `Pending -> Completed | Expired`; both terminal states are followed
//! by scheduled removal after a short cleanup delay so slightly-late
//! duplicate matches hit a no-op instead of a recycled id.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::rule::RuleId;
use crate::value::{FieldValue, Payload};

/// Invoked exactly once per trigger with the finished (possibly partial)
/// payload.
pub type CompletionCallback = Box<dyn FnOnce(Payload) + Send + 'static>;

/// Unique identifier for an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Creates a new random execution id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /// Waiting for required fields.
    Pending,
    /// All required fields collected; callback has fired.
    Completed,
    /// Deadline elapsed first; callback has fired with partial data.
    Expired,
}

impl ContextStatus {
    /// Returns true once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }
}

struct ContextEntry {
    rule_id: RuleId,
    triggered_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    seq: u64,
    status: ContextStatus,
    required: HashSet<String>,
    collected: HashMap<String, FieldValue>,
    on_complete: Option<CompletionCallback>,
    remove_at: Option<DateTime<Utc>>,
}

impl ContextEntry {
    fn is_satisfied(&self) -> bool {
        self.required
            .iter()
            .all(|field| self.collected.contains_key(field))
    }

    fn take_callback(&mut self) -> Option<(CompletionCallback, Payload)> {
        self.on_complete
            .take()
            .map(|cb| (cb, self.collected.clone()))
    }
}

#[derive(Default)]
struct Inner {
    contexts: HashMap<ExecutionId, ContextEntry>,
    next_seq: u64,
}

/// Owns every active execution context and all transitions on them.
///
/// Each method takes the internal lock once, so `create_context`,
/// `collect_field`, `expire_overdue`, and `sweep` are individually atomic;
/// completion callbacks always run after the lock is released.
pub struct ContextManager {
    max_wait: chrono::Duration,
    window: chrono::Duration,
    cleanup: chrono::Duration,
    inner: Mutex<Inner>,
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    // Config durations are human-scale; an overflowing one clamps high.
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(86_400))
}

impl ContextManager {
    /// Creates a manager with the given timing configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_wait: to_chrono(config.max_wait),
            window: to_chrono(config.correlation_window),
            cleanup: to_chrono(config.cleanup_delay),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Opens a context waiting for `required` fields.
    ///
    /// The deadline is `now + max_wait`. A context created with an empty
    /// required set completes immediately, before this call returns.
    pub fn create_context(
        &self,
        rule_id: RuleId,
        required: HashSet<String>,
        now: DateTime<Utc>,
        on_complete: CompletionCallback,
    ) -> ExecutionId {
        let id = ExecutionId::new();

        if required.is_empty() {
            debug!(%id, %rule_id, "context created with nothing required; completing immediately");
            on_complete(Payload::new());
            return id;
        }

        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(%id, %rule_id, required = required.len(), "context created");
        inner.contexts.insert(
            id,
            ContextEntry {
                rule_id,
                triggered_at: now,
                deadline: now + self.max_wait,
                seq,
                status: ContextStatus::Pending,
                required,
                collected: HashMap::new(),
                on_complete: Some(on_complete),
                remove_at: None,
            },
        );
        id
    }

    /// Stores a collected field value on a pending context.
    ///
    /// Fields outside the required set ride along into the payload without
    /// affecting completion. Returns false (a no-op) when the context is
    /// missing or already terminal. When the last required field lands,
    /// the context completes and the callback fires before this returns.
    pub fn collect_field(&self, id: ExecutionId, field: &str, value: FieldValue) -> bool {
        let fired = {
            let mut inner = self.lock();
            let Some(entry) = inner.contexts.get_mut(&id) else {
                debug!(%id, field, "collect on unknown context ignored");
                return false;
            };
            if entry.status != ContextStatus::Pending {
                debug!(%id, field, status = ?entry.status, "collect on terminal context ignored");
                return false;
            }

            entry.collected.insert(field.to_string(), value);
            if !entry.is_satisfied() {
                return true;
            }

            entry.status = ContextStatus::Completed;
            entry.remove_at = Some(Utc::now() + self.cleanup);
            entry.take_callback()
        };

        if let Some((callback, payload)) = fired {
            debug!(%id, fields = payload.len(), "context completed");
            callback(payload);
        }
        true
    }

    /// Swaps one required-field name on a still-pending context.
    ///
    /// Used to retarget identity fields (a required `userId` becomes a
    /// required `username` or `anonymousId`) without losing the
    /// still-waiting semantics. Returns false if the context is missing,
    /// terminal, or `old` was not required.
    pub fn replace_required_field(&self, id: ExecutionId, old: &str, new: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.contexts.get_mut(&id) else {
            return false;
        };
        if entry.status != ContextStatus::Pending || !entry.required.remove(old) {
            return false;
        }
        entry.required.insert(new.to_string());
        debug!(%id, old, new, "required field retargeted");
        true
    }

    /// Finds the pending context a request at `request_ts` may satisfy.
    ///
    /// Only contexts for `rule_id` whose trigger happened at or before the
    /// request, and no longer than the correlation window before it, are
    /// candidates: a request that started before the trigger can never
    /// satisfy it. Among candidates the earliest trigger wins, with the
    /// creation sequence breaking exact timestamp ties.
    #[must_use]
    pub fn find_matching_context(
        &self,
        rule_id: &RuleId,
        request_ts: DateTime<Utc>,
    ) -> Option<ExecutionId> {
        let inner = self.lock();
        inner
            .contexts
            .iter()
            .filter(|(_, entry)| {
                entry.status == ContextStatus::Pending
                    && entry.rule_id == *rule_id
                    && entry.triggered_at <= request_ts
                    && request_ts <= entry.triggered_at + self.window
            })
            .min_by_key(|(_, entry)| (entry.triggered_at, entry.seq))
            .map(|(id, _)| *id)
    }

    /// Force-expires a single context if it is still pending.
    ///
    /// The callback still fires, with whatever was collected: partial data
    /// beats silent loss.
    pub fn expire_context(&self, id: ExecutionId, now: DateTime<Utc>) -> bool {
        let fired = {
            let mut inner = self.lock();
            let Some(entry) = inner.contexts.get_mut(&id) else {
                return false;
            };
            if entry.status != ContextStatus::Pending {
                return false;
            }
            entry.status = ContextStatus::Expired;
            entry.remove_at = Some(now + self.cleanup);
            entry.take_callback()
        };

        if let Some((callback, payload)) = fired {
            debug!(%id, fields = payload.len(), "context expired with partial payload");
            callback(payload);
        }
        true
    }

    /// Expires every pending context whose deadline has passed.
    ///
    /// Returns how many expired. Callbacks fire after the internal lock is
    /// released, in deadline order.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> usize {
        let mut fired = {
            let mut inner = self.lock();
            let mut overdue: Vec<_> = inner
                .contexts
                .iter_mut()
                .filter(|(_, entry)| entry.status == ContextStatus::Pending && entry.deadline <= now)
                .map(|(id, entry)| {
                    entry.status = ContextStatus::Expired;
                    entry.remove_at = Some(now + self.cleanup);
                    (*id, entry.deadline, entry.take_callback())
                })
                .collect();
            overdue.sort_by_key(|(_, deadline, _)| *deadline);
            overdue
        };

        let count = fired.len();
        for (id, _, callback) in fired.drain(..) {
            if let Some((callback, payload)) = callback {
                debug!(%id, fields = payload.len(), "context expired with partial payload");
                callback(payload);
            }
        }
        count
    }

    /// Removes terminal contexts whose cleanup delay has elapsed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let before = inner.contexts.len();
        inner
            .contexts
            .retain(|_, entry| entry.remove_at.map(|at| at > now).unwrap_or(true));
        before - inner.contexts.len()
    }

    /// One sweeper pass: expire overdue contexts, then remove stale ones.
    pub fn tick(&self, now: DateTime<Utc>) {
        self.expire_overdue(now);
        self.sweep(now);
    }

    /// Current status of a context, if it is still tracked.
    #[must_use]
    pub fn status(&self, id: ExecutionId) -> Option<ContextStatus> {
        self.lock().contexts.get(&id).map(|entry| entry.status)
    }

    /// Number of tracked contexts, terminal ones included until swept.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.lock().contexts.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("tracked", &self.tracked_count())
            .finish_non_exhaustive()
    }
}
