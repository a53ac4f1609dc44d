//! Engine tuning knobs.
//!
//! The reference behavior shipped with diverging constants across hosts;
//! everything timing-related is tunable here, with one consistent default
//! policy.

use std::time::Duration;

/// Tunable timing and capacity configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a context waits for its deferred fields before expiring.
    pub max_wait: Duration,

    /// How far after its trigger a request may arrive and still correlate.
    pub correlation_window: Duration,

    /// How long a completed or expired context lingers before removal, to
    /// tolerate slightly-late duplicate matches without id reuse.
    pub cleanup_delay: Duration,

    /// Cadence of the background deadline sweeper.
    pub sweep_interval: Duration,

    /// Max requests buffered for identity replay before the oldest drop.
    pub replay_buffer_capacity: usize,

    /// Window within which a repeated trigger key is suppressed as a
    /// duplicate. Zero disables suppression.
    pub duplicate_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(1),
            correlation_window: Duration::from_secs(3),
            cleanup_delay: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(50),
            replay_buffer_capacity: 32,
            duplicate_window: Duration::from_millis(500),
        }
    }
}
