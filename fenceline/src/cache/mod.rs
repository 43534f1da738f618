//! TTL caches in front of the store.
//!
//! Both caches are injected instances owned by the engine, not module-level
//! singletons, so multiple engines can run side by side without shared
//! mutable state. Correctness never depends on them: the durable ledger and
//! index are the source of truth, caches are advisory.

mod fence_cache;
mod fingerprint;

pub use fence_cache::FenceCache;
pub use fingerprint::{FingerprintGuard, FingerprintMismatch};
