//! Pipeline configuration.
//!
//! One flat config struct with sensible defaults and builder-style
//! overrides, shared by the engine, the caches, and the event worker.

use std::time::Duration;

/// Default fence cache TTL: fence edits become visible within an hour.
pub const DEFAULT_FENCE_CACHE_TTL_SECS: u64 = 60 * 60;

/// Default fingerprint TTL: a device is "remembered" for a day.
pub const DEFAULT_FINGERPRINT_TTL_SECS: u64 = 24 * 60 * 60;

/// Default alert-dedupe window: one fraud alert per (user, fence) per day.
pub const DEFAULT_ALERT_DEDUPE_TTL_SECS: u64 = 24 * 60 * 60;

/// Default worker poll interval when the queue is empty.
pub const DEFAULT_WORKER_POLL_INTERVAL_MS: u64 = 500;

/// Default worker backoff after a processing error.
pub const DEFAULT_WORKER_ERROR_BACKOFF_SECS: u64 = 5;

/// Tunables for the transition pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// TTL of the read-through fence cache.
    pub fence_cache_ttl: Duration,

    /// TTL of cached device fingerprints.
    pub fingerprint_ttl: Duration,

    /// Window within which repeat fraud alerts for the same (user, fence)
    /// are suppressed.
    pub alert_dedupe_ttl: Duration,

    /// How long the event worker sleeps when the queue is empty.
    pub worker_poll_interval: Duration,

    /// How long the event worker backs off after a processing error.
    pub worker_error_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fence_cache_ttl: Duration::from_secs(DEFAULT_FENCE_CACHE_TTL_SECS),
            fingerprint_ttl: Duration::from_secs(DEFAULT_FINGERPRINT_TTL_SECS),
            alert_dedupe_ttl: Duration::from_secs(DEFAULT_ALERT_DEDUPE_TTL_SECS),
            worker_poll_interval: Duration::from_millis(DEFAULT_WORKER_POLL_INTERVAL_MS),
            worker_error_backoff: Duration::from_secs(DEFAULT_WORKER_ERROR_BACKOFF_SECS),
        }
    }
}

impl PipelineConfig {
    /// Sets the fence cache TTL.
    pub fn with_fence_cache_ttl(mut self, ttl: Duration) -> Self {
        self.fence_cache_ttl = ttl;
        self
    }

    /// Sets the fingerprint TTL.
    pub fn with_fingerprint_ttl(mut self, ttl: Duration) -> Self {
        self.fingerprint_ttl = ttl;
        self
    }

    /// Sets the alert-dedupe window.
    pub fn with_alert_dedupe_ttl(mut self, ttl: Duration) -> Self {
        self.alert_dedupe_ttl = ttl;
        self
    }

    /// Sets the worker poll interval.
    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    /// Sets the worker error backoff.
    pub fn with_worker_error_backoff(mut self, backoff: Duration) -> Self {
        self.worker_error_backoff = backoff;
        self
    }
}
