//! Queue wire format.
//!
//! Events are JSON objects with a `type` discriminator and a flattened
//! camelCase payload derived from the ledger record that the transition
//! committed. The event itself is not durable state: it only announces a
//! ledger change that has already happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::TransitionKind;
use crate::store::LocationRecord;

/// Payload of a queued transition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionData {
    /// The user the transition belongs to.
    pub user_id: String,
    /// The fence involved (the new fence for ENTER/SWITCH, the left fence
    /// for EXIT).
    pub area_id: i64,
    /// Fence name at transition time.
    pub area_name: String,
    /// Latitude at residency open.
    pub in_latitude: f64,
    /// Longitude at residency open.
    pub in_longitude: f64,
    /// When the residency opened.
    pub in_time: DateTime<Utc>,
    /// Latitude at residency close, for closed records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_latitude: Option<f64>,
    /// Longitude at residency close, for closed records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_longitude: Option<f64>,
    /// When the residency closed, for closed records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_time: Option<DateTime<Utc>>,
}

impl TransitionData {
    /// Flattens a ledger record into the wire payload.
    pub fn from_record(record: &LocationRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            area_id: record.area_id,
            area_name: record.area_name.clone(),
            in_latitude: record.in_coordinate.latitude,
            in_longitude: record.in_coordinate.longitude,
            in_time: record.in_time,
            out_latitude: record.out_coordinate.map(|c| c.latitude),
            out_longitude: record.out_coordinate.map(|c| c.longitude),
            out_time: record.out_time,
        }
    }
}

/// One queued transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// ENTER, EXIT, or SWITCH. NONE is never published.
    #[serde(rename = "type")]
    pub kind: TransitionKind,
    /// The flattened record payload.
    pub data: TransitionData,
}
