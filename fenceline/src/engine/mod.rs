//! The transition engine.
//!
//! One entry point, [`TransitionEngine::process`], shared by every
//! transport adapter. Each sample is classified against the user's last
//! ledger state, freshly re-read on every call:
//!
//! | last open record | current fence | result | mutation |
//! |---|---|---|---|
//! | none           | none            | NONE   | no-op |
//! | none           | F               | ENTER  | open record, create edge |
//! | open in F      | none            | EXIT   | close record, delete edge |
//! | open in F      | F               | NONE   | no-op |
//! | open in F1     | F2              | SWITCH | close F1, open F2, move edge |
//!
//! Re-reading state every call makes classification idempotent: an
//! identical retried sample classifies as NONE instead of duplicating a
//! transition. Each non-NONE mutation commits as one store transaction;
//! the queue publish and notifier calls that follow are best-effort and
//! never unwind a commit.

mod locks;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{FenceCache, FingerprintGuard};
use crate::config::PipelineConfig;
use crate::fence::{resolve_membership, GeofenceArea, Membership};
use crate::geo::{Coordinate, GeoError};
use crate::notify::{LogNotifier, Notifier};
use crate::queue::{EventPublisher, EventQueue, TransitionData};
use crate::store::{LocationRecord, SqliteStore, StoreError};

use locks::UserLocks;

/// Classification of one processed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransitionKind {
    /// No containment change.
    None,
    /// The user entered a fence from outside.
    Enter,
    /// The user left the fence they were inside.
    Exit,
    /// The user moved directly from one fence into another.
    Switch,
}

impl TransitionKind {
    /// True for ENTER/EXIT/SWITCH, false for NONE.
    pub fn is_transition(&self) -> bool {
        !matches!(self, TransitionKind::None)
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionKind::None => "NONE",
            TransitionKind::Enter => "ENTER",
            TransitionKind::Exit => "EXIT",
            TransitionKind::Switch => "SWITCH",
        };
        f.write_str(s)
    }
}

/// One raw location sample from a transport adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    /// Authenticated user identity.
    pub user_id: String,
    /// Reported latitude in degrees.
    pub latitude: f64,
    /// Reported longitude in degrees.
    pub longitude: f64,
    /// Opaque client-supplied device identifier, if the transport has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_fingerprint: Option<String>,
    /// Device-reported sample time; ingest time is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Synchronous result returned to the submitting caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResult {
    /// What happened.
    pub event_type: TransitionKind,
    /// The affected ledger record: the record opened by ENTER/SWITCH, the
    /// record closed by EXIT, the still-open record for NONE-inside, or
    /// absent for NONE-outside.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<LocationRecord>,
    /// Fence details for the fence the user is now inside, enriched via
    /// the TTL fence cache (may lag fence edits by up to the TTL).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_fence: Option<GeofenceArea>,
}

/// Errors surfaced to the submitting caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The sample's coordinate is out of range; nothing was mutated.
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(#[from] GeoError),

    /// The sample carries no usable user identity; nothing was mutated.
    #[error("user id must not be empty")]
    MissingUserId,

    /// The store rejected or failed the mutation. No partial state was
    /// committed; resubmitting the sample is the recovery path.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The action a classification decided on, carrying the state it needs.
#[derive(Debug)]
enum Action {
    Stay(Option<LocationRecord>),
    Enter(GeofenceArea),
    Exit(LocationRecord),
    Switch(LocationRecord, GeofenceArea),
}

/// Pure classification of ledger state against resolved membership.
fn classify(open: Option<LocationRecord>, current: Option<GeofenceArea>) -> Action {
    match (open, current) {
        (None, None) => Action::Stay(None),
        (None, Some(fence)) => Action::Enter(fence),
        (Some(record), None) => Action::Exit(record),
        (Some(record), Some(fence)) => {
            if record.area_id == fence.id {
                Action::Stay(Some(record))
            } else {
                Action::Switch(record, fence)
            }
        }
    }
}

/// The geofence transition engine.
///
/// Owns its caches, its per-user lock registry, and its publisher; shares
/// the store. Multiple engines over the same store stay correct (the
/// durable ledger and its constraints are authoritative), they just don't
/// share cache warmth.
pub struct TransitionEngine {
    store: Arc<SqliteStore>,
    fence_cache: FenceCache,
    guard: FingerprintGuard,
    publisher: EventPublisher,
    notifier: Arc<dyn Notifier>,
    locks: UserLocks,
}

impl TransitionEngine {
    /// Creates an engine over `store` with a logging notifier.
    pub fn new(store: Arc<SqliteStore>, config: &PipelineConfig) -> Self {
        let fence_cache = FenceCache::new(Arc::clone(&store), config.fence_cache_ttl);
        let guard = FingerprintGuard::new(config.fingerprint_ttl, config.alert_dedupe_ttl);
        let publisher = EventPublisher::new(EventQueue::new(&store));
        Self {
            store,
            fence_cache,
            guard,
            publisher,
            notifier: Arc::new(LogNotifier),
            locks: UserLocks::new(),
        }
    }

    /// Replaces the notifier (e.g. with a real delivery channel).
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Processes one location sample.
    ///
    /// Validates, serializes per user, classifies against freshly-read
    /// ledger state, commits the mutation atomically, then publishes and
    /// notifies best-effort. Once the store transaction commits the
    /// transition is final, whatever happens to the caller's connection.
    ///
    /// # Errors
    ///
    /// Validation errors reject the sample before any mutation. Store
    /// errors mean nothing was committed; the caller may resubmit, which
    /// is safe because an already-applied sample re-classifies as NONE.
    pub async fn process(&self, update: LocationUpdate) -> Result<TransitionResult, EngineError> {
        let point = Coordinate::new(update.latitude, update.longitude)?;
        let user_id = update.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(EngineError::MissingUserId);
        }
        let at = update.timestamp.unwrap_or_else(Utc::now);
        let fingerprint = update.device_fingerprint.as_deref();

        let lock = self.locks.lock_for(&user_id);
        let _serialized = lock.lock().await;

        // Containment always uses live geometry, never the fence cache.
        let fences = self.store.load_fences()?;
        let membership = resolve_membership(point, &fences);
        let open = self.store.open_record(&user_id)?;

        self.run_fingerprint_guard(&user_id, fingerprint, &membership, open.as_ref(), &fences, at)
            .await;

        match classify(open, membership.current) {
            Action::Stay(record) => {
                let current_fence = match &record {
                    Some(r) => self.fence_details(r.area_id).await,
                    None => None,
                };
                Ok(TransitionResult {
                    event_type: TransitionKind::None,
                    record,
                    current_fence,
                })
            }
            Action::Enter(fence) => {
                let record = self.store.enter(&user_id, &fence, point, at)?;
                debug!(user = %user_id, area = fence.id, "transition: enter");
                if let Some(fp) = fingerprint {
                    self.guard.refresh(&user_id, fp).await;
                }
                self.publisher.publish(TransitionKind::Enter, &record);
                self.alert_owner(TransitionKind::Enter, &record, &fence).await;
                let current_fence = self.fence_details(fence.id).await;
                Ok(TransitionResult {
                    event_type: TransitionKind::Enter,
                    record: Some(record),
                    current_fence,
                })
            }
            Action::Exit(record) => {
                let closed = self.store.exit(&record, point, at)?;
                debug!(user = %user_id, area = closed.area_id, "transition: exit");
                self.guard.clear(&user_id).await;
                self.publisher.publish(TransitionKind::Exit, &closed);
                if let Some(fence) = fences.iter().find(|f| f.id == closed.area_id) {
                    self.alert_owner(TransitionKind::Exit, &closed, fence).await;
                }
                Ok(TransitionResult {
                    event_type: TransitionKind::Exit,
                    record: Some(closed),
                    current_fence: None,
                })
            }
            Action::Switch(record, fence) => {
                let (_closed, opened) = self.store.switch(&record, &fence, point, at)?;
                debug!(
                    user = %user_id,
                    from = record.area_id,
                    to = fence.id,
                    "transition: switch"
                );
                if let Some(fp) = fingerprint {
                    self.guard.refresh(&user_id, fp).await;
                }
                self.publisher.publish(TransitionKind::Switch, &opened);
                self.alert_owner(TransitionKind::Switch, &opened, &fence).await;
                let current_fence = self.fence_details(fence.id).await;
                Ok(TransitionResult {
                    event_type: TransitionKind::Switch,
                    record: Some(opened),
                    current_fence,
                })
            }
        }
    }

    /// Runs the fingerprint heuristic for one sample.
    ///
    /// Strictly observational: whatever happens here, the transition
    /// proceeds. A mismatch always lands in the fraud audit table; the
    /// notifier fires at most once per (user, fence) per dedupe window.
    /// Without a fence context (outside everything, nothing open) there is
    /// nothing to attribute the mismatch to and the sample is skipped.
    async fn run_fingerprint_guard(
        &self,
        user_id: &str,
        fingerprint: Option<&str>,
        membership: &Membership,
        open: Option<&LocationRecord>,
        fences: &[GeofenceArea],
        at: DateTime<Utc>,
    ) {
        let fingerprint = match fingerprint {
            Some(fp) => fp,
            None => return,
        };
        let fence_id = membership
            .current
            .as_ref()
            .map(|f| f.id)
            .or_else(|| open.map(|r| r.area_id));
        let fence_id = match fence_id {
            Some(id) => id,
            None => return,
        };

        let mismatch = match self.guard.observe(user_id, fence_id, fingerprint).await {
            Some(mismatch) => mismatch,
            None => return,
        };

        match self.store.append_fraud_event(
            user_id,
            fence_id,
            &mismatch.previous,
            &mismatch.incoming,
            at,
        ) {
            Ok(event) => {
                warn!(user = %user_id, fence = fence_id, "device fingerprint mismatch recorded");
                if mismatch.alert_due {
                    if let Some(fence) = fences.iter().find(|f| f.id == fence_id) {
                        if let Err(e) = self.notifier.notify_fraud(&event, &fence.owner_id).await {
                            warn!(error = %e, user = %user_id, "fraud alert delivery failed");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, user = %user_id, "failed to record fraud event"),
        }
    }

    /// Fire-and-forget transition alert to the fence owner.
    async fn alert_owner(&self, kind: TransitionKind, record: &LocationRecord, fence: &GeofenceArea) {
        let data = TransitionData::from_record(record);
        if let Err(e) = self
            .notifier
            .notify_transition(kind, &data, &record.user_id, &fence.owner_id)
            .await
        {
            warn!(error = %e, kind = %kind, user = %record.user_id, "transition alert delivery failed");
        }
    }

    /// Enrichment lookup through the fence cache. Advisory: a failure is
    /// logged and the result simply lacks fence details.
    async fn fence_details(&self, fence_id: i64) -> Option<GeofenceArea> {
        match self.fence_cache.get(fence_id).await {
            Ok(details) => details,
            Err(e) => {
                warn!(error = %e, fence = fence_id, "fence enrichment lookup failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for TransitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::haversine_distance_m;
    use crate::notify::{BoxFuture, NotifyError};
    use crate::store::FraudEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Notifier that counts invocations.
    #[derive(Default)]
    struct RecordingNotifier {
        transitions: AtomicUsize,
        frauds: AtomicUsize,
    }

    impl Notifier for RecordingNotifier {
        fn notify_transition<'a>(
            &'a self,
            _kind: TransitionKind,
            _data: &'a TransitionData,
            _subject_id: &'a str,
            _owner_id: &'a str,
        ) -> BoxFuture<'a, Result<(), NotifyError>> {
            self.transitions.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn notify_fraud<'a>(
            &'a self,
            _event: &'a FraudEvent,
            _owner_id: &'a str,
        ) -> BoxFuture<'a, Result<(), NotifyError>> {
            self.frauds.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    struct Setup {
        engine: TransitionEngine,
        store: Arc<SqliteStore>,
        queue: EventQueue,
        notifier: Arc<RecordingNotifier>,
        home: GeofenceArea,
        office: GeofenceArea,
    }

    /// Two non-overlapping 100 m fences ~157 km apart.
    fn setup() -> Setup {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let home = store
            .insert_fence("home", Coordinate::new(0.0, 0.0).unwrap(), 100.0, "owner-home")
            .unwrap();
        let office = store
            .insert_fence("office", Coordinate::new(1.0, 1.0).unwrap(), 100.0, "owner-office")
            .unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = TransitionEngine::new(Arc::clone(&store), &PipelineConfig::default())
            .with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>);
        let queue = EventQueue::new(&store);
        Setup {
            engine,
            store,
            queue,
            notifier,
            home,
            office,
        }
    }

    fn update(user: &str, lat: f64, lon: f64) -> LocationUpdate {
        LocationUpdate {
            user_id: user.to_string(),
            latitude: lat,
            longitude: lon,
            device_fingerprint: None,
            timestamp: None,
        }
    }

    fn update_with_print(user: &str, lat: f64, lon: f64, print: &str) -> LocationUpdate {
        LocationUpdate {
            device_fingerprint: Some(print.to_string()),
            ..update(user, lat, lon)
        }
    }

    #[test]
    fn test_classify_table() {
        let record = LocationRecord {
            id: 1,
            user_id: "alice".to_string(),
            area_id: 1,
            area_name: "home".to_string(),
            in_coordinate: Coordinate::new(0.0, 0.0).unwrap(),
            in_time: Utc::now(),
            out_coordinate: None,
            out_time: None,
            disconnected: false,
            switched: false,
        };
        let fence_same = GeofenceArea {
            id: 1,
            name: "home".to_string(),
            center: Coordinate::new(0.0, 0.0).unwrap(),
            radius_m: 100.0,
            owner_id: "o".to_string(),
            created_at: Utc::now(),
        };
        let fence_other = GeofenceArea {
            id: 2,
            ..fence_same.clone()
        };

        assert!(matches!(classify(None, None), Action::Stay(None)));
        assert!(matches!(
            classify(None, Some(fence_same.clone())),
            Action::Enter(_)
        ));
        assert!(matches!(
            classify(Some(record.clone()), None),
            Action::Exit(_)
        ));
        assert!(matches!(
            classify(Some(record.clone()), Some(fence_same)),
            Action::Stay(Some(_))
        ));
        assert!(matches!(
            classify(Some(record), Some(fence_other)),
            Action::Switch(_, _)
        ));
    }

    #[tokio::test]
    async fn test_enter_scenario() {
        let s = setup();
        let result = s.engine.process(update("alice", 0.0, 0.0)).await.unwrap();

        assert_eq!(result.event_type, TransitionKind::Enter);
        let record = result.record.unwrap();
        assert_eq!(record.area_id, s.home.id);
        assert!(record.is_open());
        assert_eq!(result.current_fence.unwrap().name, "home");

        assert!(s.store.edge_exists("alice", s.home.id).unwrap());
        assert_eq!(s.queue.len().unwrap(), 1);
        assert_eq!(s.notifier.transitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_identical_sample_is_idempotent() {
        let s = setup();
        let sample = update("alice", 0.0, 0.0);

        let first = s.engine.process(sample.clone()).await.unwrap();
        assert_eq!(first.event_type, TransitionKind::Enter);

        let second = s.engine.process(sample).await.unwrap();
        assert_eq!(second.event_type, TransitionKind::None);
        // Still reports where the user is.
        assert_eq!(second.record.unwrap().area_id, s.home.id);

        assert_eq!(s.store.records_for_user("alice").unwrap().len(), 1);
        assert_eq!(s.queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exit_scenario() {
        let s = setup();
        s.engine.process(update("alice", 0.0, 0.0)).await.unwrap();

        // ~150 m north of the fence center, outside the 100 m radius.
        let result = s.engine.process(update("alice", 0.00135, 0.0)).await.unwrap();

        assert_eq!(result.event_type, TransitionKind::Exit);
        let record = result.record.unwrap();
        assert!(!record.is_open());
        assert!(record.out_time.is_some());
        assert!(!record.switched);
        assert!(result.current_fence.is_none());

        assert!(s.store.open_record("alice").unwrap().is_none());
        assert!(!s.store.edge_exists("alice", s.home.id).unwrap());
        assert_eq!(s.queue.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_switch_scenario() {
        let s = setup();
        s.engine.process(update("alice", 0.0, 0.0)).await.unwrap();

        let result = s.engine.process(update("alice", 1.0, 1.0)).await.unwrap();

        assert_eq!(result.event_type, TransitionKind::Switch);
        let opened = result.record.unwrap();
        assert_eq!(opened.area_id, s.office.id);
        assert!(opened.is_open());

        let history = s.store.records_for_user("alice").unwrap();
        assert_eq!(history.len(), 2);
        let closed = history
            .iter()
            .find(|r| r.area_id == s.home.id)
            .unwrap();
        assert!(!closed.is_open());
        assert!(closed.switched);

        assert!(!s.store.edge_exists("alice", s.home.id).unwrap());
        assert!(s.store.edge_exists("alice", s.office.id).unwrap());
        assert_eq!(s.queue.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_outside_everywhere_is_none() {
        let s = setup();
        let result = s.engine.process(update("alice", 45.0, 45.0)).await.unwrap();
        assert_eq!(result.event_type, TransitionKind::None);
        assert!(result.record.is_none());
        assert!(result.current_fence.is_none());
        assert!(s.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_boundary_point_is_inside() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let center = Coordinate::new(0.0, 0.0).unwrap();
        let point = Coordinate::new(0.0, 0.001).unwrap();
        // Radius exactly equal to the point's distance: inclusive boundary.
        let radius = haversine_distance_m(center, point);
        store.insert_fence("edge", center, radius, "owner").unwrap();

        let engine = TransitionEngine::new(Arc::clone(&store), &PipelineConfig::default());
        let result = engine
            .process(update("alice", point.latitude, point.longitude))
            .await
            .unwrap();
        assert_eq!(result.event_type, TransitionKind::Enter);
    }

    #[tokio::test]
    async fn test_invalid_coordinate_rejected_before_mutation() {
        let s = setup();
        let result = s.engine.process(update("alice", 95.0, 0.0)).await;
        assert!(matches!(result, Err(EngineError::InvalidCoordinate(_))));

        assert!(s.store.records_for_user("alice").unwrap().is_empty());
        assert!(s.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_missing_user_rejected() {
        let s = setup();
        let result = s.engine.process(update("   ", 0.0, 0.0)).await;
        assert!(matches!(result, Err(EngineError::MissingUserId)));
    }

    #[tokio::test]
    async fn test_fraud_heuristic_with_dedupe() {
        let s = setup();

        // Enter with fingerprint A: no baseline yet, no fraud.
        s.engine
            .process(update_with_print("alice", 0.0, 0.0, "print-a"))
            .await
            .unwrap();
        assert!(s.store.fraud_events_for_user("alice").unwrap().is_empty());

        // Same fence with fingerprint B: mismatch, audit row, one alert.
        let result = s
            .engine
            .process(update_with_print("alice", 0.0, 0.0, "print-b"))
            .await
            .unwrap();
        assert_eq!(result.event_type, TransitionKind::None);
        assert_eq!(s.store.fraud_events_for_user("alice").unwrap().len(), 1);
        assert_eq!(s.notifier.frauds.load(Ordering::SeqCst), 1);

        // Another mismatch inside the window: audited again, no new alert.
        s.engine
            .process(update_with_print("alice", 0.0, 0.0, "print-c"))
            .await
            .unwrap();
        assert_eq!(s.store.fraud_events_for_user("alice").unwrap().len(), 2);
        assert_eq!(s.notifier.frauds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fraud_never_blocks_transition() {
        let s = setup();
        s.engine
            .process(update_with_print("alice", 0.0, 0.0, "print-a"))
            .await
            .unwrap();

        // Mismatched fingerprint on a switch: the switch still happens.
        let result = s
            .engine
            .process(update_with_print("alice", 1.0, 1.0, "print-b"))
            .await
            .unwrap();
        assert_eq!(result.event_type, TransitionKind::Switch);
        assert_eq!(s.store.fraud_events_for_user("alice").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exit_clears_fingerprint_baseline() {
        let s = setup();
        s.engine
            .process(update_with_print("alice", 0.0, 0.0, "print-a"))
            .await
            .unwrap();
        // Leave the fence: baseline is dropped.
        s.engine
            .process(update_with_print("alice", 45.0, 45.0, "print-a"))
            .await
            .unwrap();

        // Re-enter with a different device: genuine re-entry, no fraud.
        s.engine
            .process(update_with_print("alice", 0.0, 0.0, "print-b"))
            .await
            .unwrap();
        assert!(s.store.fraud_events_for_user("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_users_do_not_interfere() {
        let s = setup();
        s.engine.process(update("alice", 0.0, 0.0)).await.unwrap();
        s.engine.process(update("bob", 1.0, 1.0)).await.unwrap();

        assert_eq!(
            s.store.open_record("alice").unwrap().unwrap().area_id,
            s.home.id
        );
        assert_eq!(
            s.store.open_record("bob").unwrap().unwrap().area_id,
            s.office.id
        );
    }

    #[tokio::test]
    async fn test_concurrent_same_user_samples_yield_one_enter() {
        let s = setup();
        let engine = Arc::new(s.engine);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.process(update("alice", 0.0, 0.0)).await.unwrap()
            }));
        }

        let mut enters = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if result.event_type == TransitionKind::Enter {
                enters += 1;
            } else {
                assert_eq!(result.event_type, TransitionKind::None);
            }
        }
        assert_eq!(enters, 1);
        assert_eq!(s.store.records_for_user("alice").unwrap().len(), 1);
    }
}
