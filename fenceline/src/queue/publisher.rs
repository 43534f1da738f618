//! Best-effort transition publisher.

use tracing::{debug, warn};

use super::event::{TransitionData, TransitionEvent};
use super::EventQueue;
use crate::engine::TransitionKind;
use crate::store::LocationRecord;

/// Serializes committed transitions onto the durable queue.
///
/// Publishing happens after the store transaction has committed. A failure
/// here is logged and swallowed: the ledger already reflects the
/// transition and the synchronous caller still gets a correct result.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    queue: EventQueue,
}

impl EventPublisher {
    /// Creates a publisher appending to `queue`.
    pub fn new(queue: EventQueue) -> Self {
        Self { queue }
    }

    /// Publishes a committed transition. Best-effort; never fails the
    /// caller.
    pub fn publish(&self, kind: TransitionKind, record: &LocationRecord) {
        if !kind.is_transition() {
            return;
        }
        let event = TransitionEvent {
            kind,
            data: TransitionData::from_record(record),
        };
        let appended = serde_json::to_string(&event)
            .map_err(super::QueueError::from)
            .and_then(|payload| self.queue.push(&payload));
        match appended {
            Ok(id) => debug!(kind = %kind, user = %record.user_id, queue_id = id, "transition published"),
            Err(e) => warn!(kind = %kind, user = %record.user_id, error = %e, "transition publish failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::store::SqliteStore;
    use chrono::Utc;

    fn record() -> LocationRecord {
        LocationRecord {
            id: 1,
            user_id: "alice".to_string(),
            area_id: 7,
            area_name: "home".to_string(),
            in_coordinate: Coordinate::new(0.0, 0.0).unwrap(),
            in_time: Utc::now(),
            out_coordinate: None,
            out_time: None,
            disconnected: false,
            switched: false,
        }
    }

    #[test]
    fn test_publish_appends_event() {
        let store = SqliteStore::open_in_memory().unwrap();
        let queue = EventQueue::new(&store);
        let publisher = EventPublisher::new(queue.clone());

        publisher.publish(TransitionKind::Enter, &record());

        let payload = queue.pop().unwrap().unwrap();
        let event: TransitionEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(event.kind, TransitionKind::Enter);
        assert_eq!(event.data.user_id, "alice");
    }

    #[test]
    fn test_none_is_never_published() {
        let store = SqliteStore::open_in_memory().unwrap();
        let queue = EventQueue::new(&store);
        let publisher = EventPublisher::new(queue.clone());

        publisher.publish(TransitionKind::None, &record());
        assert!(queue.is_empty().unwrap());
    }
}
