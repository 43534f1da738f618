//! Circular geofences and membership resolution.
//!
//! A fence is a named circle: a center coordinate plus a radius in metres.
//! The membership resolver computes, for a single point, the full set of
//! containing fences and the one "current" fence a transition is evaluated
//! against. Both are pure functions of the inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

/// A circular geographic region.
///
/// Immutable on the sample-processing path; fence edits happen out of band
/// and become visible to payload enrichment only after the fence cache TTL
/// expires. Containment checks always use live geometry read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceArea {
    /// Store-assigned identifier.
    pub id: i64,
    /// Human-readable fence name.
    pub name: String,
    /// Center of the circle.
    pub center: Coordinate,
    /// Radius in metres, always > 0.
    pub radius_m: f64,
    /// Identity of the fence owner (recipient of transition alerts).
    pub owner_id: String,
    /// When the fence was created.
    pub created_at: DateTime<Utc>,
}

impl GeofenceArea {
    /// Distance from the fence center to `point`, in metres.
    pub fn distance_to(&self, point: Coordinate) -> f64 {
        self.center.distance_m(point)
    }

    /// Whether `point` lies inside the fence.
    ///
    /// The boundary is inclusive: a point at exactly `radius_m` from the
    /// center counts as inside.
    pub fn contains(&self, point: Coordinate) -> bool {
        self.distance_to(point) <= self.radius_m
    }
}

/// Result of resolving a point against a fence set.
#[derive(Debug, Clone)]
pub struct Membership {
    /// Every fence containing the point.
    pub contained: Vec<GeofenceArea>,
    /// The single fence the point is considered "in": the contained fence
    /// with the minimum center distance. Exact distance ties break to the
    /// smallest fence id so repeated resolution is deterministic.
    pub current: Option<GeofenceArea>,
}

impl Membership {
    /// True when the point is outside every fence.
    pub fn is_outside(&self) -> bool {
        self.current.is_none()
    }
}

/// Resolves which fences contain `point` and which one is current.
///
/// Pure function: no side effects, same output for the same inputs.
pub fn resolve_membership(point: Coordinate, fences: &[GeofenceArea]) -> Membership {
    let mut contained: Vec<GeofenceArea> = Vec::new();
    let mut current: Option<(f64, GeofenceArea)> = None;

    for fence in fences {
        let distance = fence.distance_to(point);
        if distance > fence.radius_m {
            continue;
        }
        contained.push(fence.clone());

        let closer = match &current {
            None => true,
            Some((best_distance, best)) => {
                distance < *best_distance || (distance == *best_distance && fence.id < best.id)
            }
        };
        if closer {
            current = Some((distance, fence.clone()));
        }
    }

    Membership {
        contained,
        current: current.map(|(_, fence)| fence),
    }
}
