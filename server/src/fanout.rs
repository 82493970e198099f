//! Notification fan-out.
//!
//! Serializes a payload once and hands it to the [`PushDispatcher`] for every
//! subscription concurrently. Failures are collected per device and never
//! stop the remaining deliveries.

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::push::PushDispatcher;
use crate::types::PushSubscription;

/// Aggregated result of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Number of subscriptions targeted.
    pub total: usize,
    /// Deliveries the push service accepted.
    pub success_count: usize,
    /// One entry per failed delivery.
    pub errors: Vec<String>,
    /// Endpoints the push service reported as gone.
    pub expired_endpoints: Vec<String>,
}

impl FanOutReport {
    pub fn failure_count(&self) -> usize {
        self.total - self.success_count
    }
}

/// Delivers `payload` to every subscription.
pub async fn fan_out<P>(
    dispatcher: &dyn PushDispatcher,
    subscriptions: &[PushSubscription],
    payload: &P,
) -> FanOutReport
where
    P: Serialize + ?Sized,
{
    let total = subscriptions.len();
    if total == 0 {
        return FanOutReport::default();
    }

    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, total, "Failed to serialize notification payload");
            return FanOutReport {
                total,
                success_count: 0,
                errors: (1..=total)
                    .map(|n| format!("subscription {n}: failed to serialize payload: {e}"))
                    .collect(),
                expired_endpoints: Vec::new(),
            };
        }
    };

    let results = join_all(
        subscriptions
            .iter()
            .map(|subscription| dispatcher.send(subscription, &body)),
    )
    .await;

    let mut report = FanOutReport {
        total,
        ..FanOutReport::default()
    };

    for (n, (subscription, result)) in subscriptions.iter().zip(results).enumerate() {
        match result {
            Ok(()) => report.success_count += 1,
            Err(e) => {
                if e.is_expired() {
                    report.expired_endpoints.push(subscription.endpoint.clone());
                }
                report.errors.push(format!("subscription {}: {e}", n + 1));
            }
        }
    }

    debug!(
        total,
        succeeded = report.success_count,
        failed = report.failure_count(),
        expired = report.expired_endpoints.len(),
        "Fan-out complete"
    );

    report
}
