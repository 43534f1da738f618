//! Per-user serialization.
//!
//! Classification is a read-modify-write against the user's last open
//! record; two samples for the same user racing through it could both see
//! "no open record" and both try to ENTER. Handing out one async mutex per
//! user linearizes same-user samples while distinct users proceed fully in
//! parallel. The store's partial unique index backs this up: even a lost
//! race surfaces as a conflict error, never as a duplicate open record.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Registry of per-user locks.
///
/// Entries are created on first use and kept for the registry's lifetime;
/// a lock is a few pointers, so the registry stays small relative to the
/// ledger itself.
pub(crate) struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Returns the lock for a user, creating it on first use.
    pub(crate) fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }
}
