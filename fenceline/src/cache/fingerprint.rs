//! Device-fingerprint guard.
//!
//! Heuristic hand-off detection: each user's most recent device fingerprint
//! is cached with a 24 hour TTL. A sample carrying a different fingerprint
//! is a mismatch. The guard only observes; it never blocks or alters a
//! transition.
//!
//! Alert de-duplication uses a second cache with its own key space
//! (`user:fence`): however many mismatches occur, at most one alert per
//! `(user, fence)` pair is due within the dedupe window. The fraud audit
//! trail itself is never de-duplicated.
//!
//! The fingerprint entry is refreshed on ENTER/SWITCH and cleared on EXIT,
//! so a genuine exit-then-reentry with a new device does not register as a
//! hand-off.

use std::time::Duration;

use moka::future::Cache;

/// Upper bound on tracked users per cache.
const MAX_TRACKED_USERS: u64 = 100_000;

/// An observed fingerprint change for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintMismatch {
    /// The fingerprint that was cached for the user.
    pub previous: String,
    /// The fingerprint carried by the incoming sample.
    pub incoming: String,
    /// True when this is the first mismatch for the `(user, fence)` pair
    /// inside the dedupe window, i.e. an alert should be sent.
    pub alert_due: bool,
}

/// Per-user fingerprint cache plus alert de-duplication.
pub struct FingerprintGuard {
    prints: Cache<String, String>,
    alerts: Cache<String, ()>,
}

impl FingerprintGuard {
    /// Creates a guard with the given fingerprint and alert-dedupe TTLs.
    pub fn new(print_ttl: Duration, alert_ttl: Duration) -> Self {
        Self {
            prints: Cache::builder()
                .max_capacity(MAX_TRACKED_USERS)
                .time_to_live(print_ttl)
                .build(),
            alerts: Cache::builder()
                .max_capacity(MAX_TRACKED_USERS)
                .time_to_live(alert_ttl)
                .build(),
        }
    }

    /// Compares an incoming fingerprint against the cached one.
    ///
    /// Returns `None` when there is no cached baseline or the fingerprints
    /// match. On mismatch, returns the pair plus whether an alert is due
    /// for this `(user, fence)`; the dedupe slot is claimed immediately so
    /// concurrent mismatches cannot both be "due".
    ///
    /// The cached fingerprint is not updated here; refresh happens on
    /// ENTER/SWITCH via [`FingerprintGuard::refresh`].
    pub async fn observe(
        &self,
        user_id: &str,
        fence_id: i64,
        fingerprint: &str,
    ) -> Option<FingerprintMismatch> {
        let previous = self.prints.get(user_id).await?;
        if previous == fingerprint {
            return None;
        }

        let dedupe_key = format!("{user_id}:{fence_id}");
        let alert_due = self.alerts.get(&dedupe_key).await.is_none();
        if alert_due {
            self.alerts.insert(dedupe_key, ()).await;
        }

        Some(FingerprintMismatch {
            previous,
            incoming: fingerprint.to_string(),
            alert_due,
        })
    }

    /// Stores (or re-arms the TTL of) the user's fingerprint.
    pub async fn refresh(&self, user_id: &str, fingerprint: &str) {
        self.prints
            .insert(user_id.to_string(), fingerprint.to_string())
            .await;
    }

    /// Drops the user's fingerprint (on EXIT).
    pub async fn clear(&self, user_id: &str) {
        self.prints.invalidate(user_id).await;
    }
}

impl std::fmt::Debug for FingerprintGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintGuard")
            .field("tracked_users", &self.prints.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> FingerprintGuard {
        FingerprintGuard::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_no_baseline_no_mismatch() {
        let guard = guard();
        assert!(guard.observe("alice", 1, "print-a").await.is_none());
    }

    #[tokio::test]
    async fn test_matching_print_no_mismatch() {
        let guard = guard();
        guard.refresh("alice", "print-a").await;
        assert!(guard.observe("alice", 1, "print-a").await.is_none());
    }

    #[tokio::test]
    async fn test_mismatch_detected_with_alert() {
        let guard = guard();
        guard.refresh("alice", "print-a").await;

        let mismatch = guard.observe("alice", 1, "print-b").await.unwrap();
        assert_eq!(mismatch.previous, "print-a");
        assert_eq!(mismatch.incoming, "print-b");
        assert!(mismatch.alert_due);
    }

    #[tokio::test]
    async fn test_second_mismatch_alert_deduped() {
        let guard = guard();
        guard.refresh("alice", "print-a").await;

        let first = guard.observe("alice", 1, "print-b").await.unwrap();
        assert!(first.alert_due);

        let second = guard.observe("alice", 1, "print-c").await.unwrap();
        assert!(!second.alert_due);
    }

    #[tokio::test]
    async fn test_dedupe_is_per_fence() {
        let guard = guard();
        guard.refresh("alice", "print-a").await;

        assert!(guard.observe("alice", 1, "print-b").await.unwrap().alert_due);
        // Different fence, fresh dedupe slot.
        assert!(guard.observe("alice", 2, "print-b").await.unwrap().alert_due);
    }

    #[tokio::test]
    async fn test_dedupe_is_per_user() {
        let guard = guard();
        guard.refresh("alice", "print-a").await;
        guard.refresh("bob", "print-x").await;

        assert!(guard.observe("alice", 1, "print-b").await.unwrap().alert_due);
        assert!(guard.observe("bob", 1, "print-y").await.unwrap().alert_due);
    }

    #[tokio::test]
    async fn test_clear_removes_baseline() {
        let guard = guard();
        guard.refresh("alice", "print-a").await;
        guard.clear("alice").await;
        assert!(guard.observe("alice", 1, "print-b").await.is_none());
    }

    #[tokio::test]
    async fn test_print_expires_after_ttl() {
        let guard = FingerprintGuard::new(Duration::from_millis(30), Duration::from_secs(60));
        guard.refresh("alice", "print-a").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(guard.observe("alice", 1, "print-b").await.is_none());
    }
}
