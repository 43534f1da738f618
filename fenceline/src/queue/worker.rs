//! Long-running queue consumer.
//!
//! Single-consumer loop: pop the next event, reconcile it into the read
//! model, keep going. A processing error parks the already-popped event in
//! the dead-letter table, is logged, and is followed by a backoff sleep;
//! one bad event must never terminate the worker. Shutdown is cooperative
//! via a `CancellationToken`, the same pattern as any other long-lived
//! background task here.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::read_model::{ReadModel, ReadModelError, ReconcileOutcome};
use super::{EventQueue, QueueError, TransitionEvent};
use crate::config::PipelineConfig;

/// Errors from processing a single queued event.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The queue itself failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The popped payload was not a valid transition event. The payload
    /// itself is in the dead-letter table by the time this surfaces.
    #[error("malformed event payload: {source}")]
    Malformed {
        /// The deserialization failure.
        source: serde_json::Error,
    },

    /// Reconciliation into the read model failed.
    #[error(transparent)]
    ReadModel(#[from] ReadModelError),
}

/// The queue-draining worker.
pub struct EventWorker {
    queue: EventQueue,
    model: Arc<dyn ReadModel>,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl EventWorker {
    /// Creates a worker draining `queue` into `model`.
    pub fn new(queue: EventQueue, model: Arc<dyn ReadModel>, config: &PipelineConfig) -> Self {
        Self {
            queue,
            model,
            poll_interval: config.worker_poll_interval,
            error_backoff: config.worker_error_backoff,
        }
    }

    /// Processes at most one queued event.
    ///
    /// Returns `Ok(None)` when the queue is empty, otherwise the
    /// reconciliation outcome. The pop is destructive; an event whose
    /// parse or reconciliation fails is parked in the dead-letter table
    /// before the error is returned.
    pub fn tick(&self) -> Result<Option<ReconcileOutcome>, WorkerError> {
        let payload = match self.queue.pop()? {
            Some(payload) => payload,
            None => return Ok(None),
        };

        let result = self.process_payload(&payload);
        if let Err(e) = &result {
            self.park(&payload, e);
        }
        result.map(Some)
    }

    fn process_payload(&self, payload: &str) -> Result<ReconcileOutcome, WorkerError> {
        let event: TransitionEvent =
            serde_json::from_str(payload).map_err(|source| WorkerError::Malformed { source })?;

        let outcome = self.model.apply(&event)?;
        debug!(
            kind = %event.kind,
            user = %event.data.user_id,
            outcome = ?outcome,
            "event reconciled"
        );
        Ok(outcome)
    }

    /// Moves a failed event to the dead-letter table. If even that write
    /// fails, the payload is logged so the event is at least observable.
    fn park(&self, payload: &str, error: &WorkerError) {
        if let Err(e) = self.queue.push_dead_letter(payload, &error.to_string()) {
            warn!(error = %e, payload = %payload, "dead-letter write failed; event lost");
        }
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Drains the queue as fast as events arrive; sleeps the poll interval
    /// when empty and the error backoff after a failure.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("event worker starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.tick() {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    if !sleep_unless_cancelled(self.poll_interval, &shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "event processing failed; continuing after backoff");
                    if !sleep_unless_cancelled(self.error_backoff, &shutdown).await {
                        break;
                    }
                }
            }
        }
        info!("event worker stopped");
    }
}

/// Sleeps for `duration`, returning false if cancelled first.
async fn sleep_unless_cancelled(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
