//! # corelay - Trigger-to-Payload Correlation Engine
//!
//! corelay assembles structured analytics payloads for a browser-side
//! instrumentation SDK. A tracking rule declares which fields an event's
//! payload needs; some of those fields only materialize later, inside the
//! body of an unrelated outgoing network call. corelay correlates those
//! calls back to the triggering user action within a bounded time window,
//! and always delivers the payload - complete when correlation succeeds,
//! best-effort when it does not.
//!
//! ## Core Concepts
//!
//! - **Rule**: declarative spec of what payload fields an event needs and
//!   where each comes from
//! - **Mapping**: one field's extraction recipe (source + config)
//! - **Execution context**: per-trigger bookkeeping of which required
//!   fields are still outstanding
//! - **Correlation window**: the bounded interval after a trigger during
//!   which an observed network call may still satisfy it
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use corelay::{
//!     EngineConfig, FieldMapping, FieldSource, HttpMethod, MemoryIdentityStore,
//!     MemoryPage, PayloadBuilder, TrackingRule, TriggerContext,
//! };
//!
//! let rule = TrackingRule::new("product-view", "product_view", ".product-card")
//!     .with_mapping(FieldMapping::new("sku", FieldSource::element_attr("data-sku")))
//!     .with_mapping(FieldMapping::new(
//!         "price",
//!         FieldSource::response_body(HttpMethod::Get, "/api/product/:id", "data.price"),
//!     ));
//!
//! let builder = PayloadBuilder::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryPage::with_url("https://shop.example/p/42")),
//!     Arc::new(MemoryIdentityStore::new()),
//! );
//! builder.install(&host_interceptor)?;
//!
//! builder.handle_trigger(&rule, &trigger, Box::new(|payload| {
//!     // ship the payload to the delivery pipeline
//! }));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core data model
pub mod config;
pub mod error;
pub mod rule;
pub mod trigger;
pub mod value;

// Host capabilities
pub mod identity;
pub mod page;

// Correlation machinery
pub mod builder;
pub mod context;
pub mod observer;
pub mod path;

// Re-export primary types at crate root for convenience
pub use builder::PayloadBuilder;
pub use config::EngineConfig;
pub use context::{CompletionCallback, ContextManager, ContextStatus, ExecutionId};
pub use error::{CorelayError, CorelayResult, ExecutionError, ValidationError};
pub use identity::{
    CachedIdentity, IdentityResolver, IdentitySink, IdentityStore, MemoryIdentityStore,
    ANONYMOUS_ID_FIELD, USER_ID_FIELD,
};
pub use observer::{NetworkObserver, NetworkRequest, RequestInterceptor, RequestSink};
pub use page::{MemoryPage, PageEnvironment};
pub use rule::{FieldMapping, FieldSource, HttpMethod, RuleId, TrackingRule, UrlPart};
pub use trigger::{ElementSnapshot, TriggerContext};
pub use value::{FieldValue, Payload};
