//! Geographic coordinates and great-circle distance.
//!
//! Leaf module: pure math, no side effects. Distances use the haversine
//! formula on a spherical Earth model, which is accurate to well under a
//! metre at geofence scales (tens to thousands of metres).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in metres, as used by the haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Minimum valid latitude in degrees.
pub const MIN_LAT: f64 = -90.0;
/// Maximum valid latitude in degrees.
pub const MAX_LAT: f64 = 90.0;
/// Minimum valid longitude in degrees.
pub const MIN_LON: f64 = -180.0;
/// Maximum valid longitude in degrees.
pub const MAX_LON: f64 = 180.0;

/// Errors produced when constructing a [`Coordinate`].
#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    /// Latitude outside [-90, 90] degrees.
    #[error("invalid latitude: {0} (must be within [-90, 90])")]
    InvalidLatitude(f64),

    /// Longitude outside [-180, 180] degrees.
    #[error("invalid longitude: {0} (must be within [-180, 180])")]
    InvalidLongitude(f64),
}

/// A validated geographic coordinate in degrees.
///
/// Construction via [`Coordinate::new`] guarantees the latitude and
/// longitude are within range; everything downstream can rely on that.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees, [-90, 90].
    pub latitude: f64,
    /// Longitude in degrees, [-180, 180].
    pub longitude: f64,
}

impl Coordinate {
    /// Creates a coordinate, validating both components.
    ///
    /// # Errors
    ///
    /// Returns `GeoError` if either component is out of range or non-finite.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        if !latitude.is_finite() || !(MIN_LAT..=MAX_LAT).contains(&latitude) {
            return Err(GeoError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(MIN_LON..=MAX_LON).contains(&longitude) {
            return Err(GeoError::InvalidLongitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance to another coordinate, in metres.
    pub fn distance_m(&self, other: Coordinate) -> f64 {
        haversine_distance_m(*self, other)
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Great-circle distance between two coordinates in metres.
///
/// Haversine formula with a mean Earth radius of 6,371,000 m.
pub fn haversine_distance_m(a: Coordinate, b: Coordinate) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
