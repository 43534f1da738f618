//! Fenceline - geofence transition detection and event pipeline.
//!
//! This library ingests per-user location samples and decides whether the
//! user has entered, exited, or switched between named circular regions
//! ("fences"). Every detected transition updates a durable residency ledger
//! and a fast "who is inside now" index in one atomic step, then flows to
//! asynchronous consumers through a durable queue.
//!
//! # Architecture
//!
//! ```text
//! transport adapter ──► TransitionEngine ──► SqliteStore (atomic commit)
//!                          │      │                │
//!                          │      └─► FingerprintGuard (observe only)
//!                          │                        │
//!                          └─► MembershipResolver   └─► EventPublisher ──► EventQueue
//!                                                                             │
//!                                       EventWorker ◄─────────────────────────┘
//!                                           │
//!                                           └─► ReadModel (idempotent reconcile)
//! ```
//!
//! Transports are thin adapters: they translate their protocol into a
//! [`LocationUpdate`](engine::LocationUpdate) and relay the
//! [`TransitionResult`](engine::TransitionResult) back. All classification
//! lives in [`engine::TransitionEngine`].

pub mod cache;
pub mod config;
pub mod engine;
pub mod fence;
pub mod geo;
pub mod notify;
pub mod queue;
pub mod store;

pub use config::PipelineConfig;
pub use engine::{LocationUpdate, TransitionEngine, TransitionKind, TransitionResult};
pub use store::SqliteStore;
