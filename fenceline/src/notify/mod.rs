//! Notifier seam for outbound alerts.
//!
//! Formatting and delivery (email, push, whatever the deployment uses) is
//! an external collaborator. The pipeline hands it structured data through
//! the [`Notifier`] trait and moves on: calls happen after commit, are
//! never retried, and failures are logged by the caller, never escalated.
//!
//! The trait uses `Pin<Box<dyn Future>>` returns so it stays
//! dyn-compatible and implementations can be injected as `Arc<dyn
//! Notifier>`.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tracing::info;

use crate::engine::TransitionKind;
use crate::queue::TransitionData;
use crate::store::FraudEvent;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors a notifier implementation may report.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The downstream channel rejected or dropped the alert.
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Outbound alert channel.
///
/// `subject_id` is the user the alert is about, `owner_id` the fence owner
/// receiving it; resolving those identities to addresses is the
/// implementation's concern.
pub trait Notifier: Send + Sync {
    /// Announces a committed transition.
    fn notify_transition<'a>(
        &'a self,
        kind: TransitionKind,
        data: &'a TransitionData,
        subject_id: &'a str,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<(), NotifyError>>;

    /// Announces a detected device hand-off.
    fn notify_fraud<'a>(
        &'a self,
        event: &'a FraudEvent,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Notifier that writes structured log lines and nothing else.
///
/// The default wiring; useful on its own for development and as the
/// fallback when no delivery channel is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_transition<'a>(
        &'a self,
        kind: TransitionKind,
        data: &'a TransitionData,
        subject_id: &'a str,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            info!(
                kind = %kind,
                user = %subject_id,
                owner = %owner_id,
                area = %data.area_name,
                "transition alert"
            );
            Ok(())
        })
    }

    fn notify_fraud<'a>(
        &'a self,
        event: &'a FraudEvent,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            info!(
                user = %event.user_id,
                owner = %owner_id,
                fence = event.fence_id,
                "device hand-off alert"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_log_notifier_succeeds() {
        let notifier = LogNotifier;
        let event = FraudEvent {
            id: 1,
            user_id: "alice".to_string(),
            fence_id: 7,
            old_fingerprint: "a".to_string(),
            new_fingerprint: "b".to_string(),
            created_at: Utc::now(),
        };
        assert!(notifier.notify_fraud(&event, "owner-1").await.is_ok());
    }
}
