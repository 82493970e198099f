//! Alarm confirmation rendezvous.
//!
//! [`ConfirmationService::confirm_alarm`] runs on the alarm's request: it
//! resolves the owner and their devices, reserves the correlation key, pushes
//! a confirm/deny prompt to every device and then waits for one of them to
//! answer. Answers arrive on separate requests and are routed back through
//! [`ConfirmationService::submit_response`] or
//! [`ConfirmationService::submit_correlated_response`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::Directory;
use crate::error::{Result, ServerError};
use crate::fanout::fan_out;
use crate::pending::PendingSet;
use crate::push::PushDispatcher;
use crate::types::{ConfirmationOutcome, CorrelationKey, NotificationPayload};

/// Default time an alarm waits for a user to answer.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(15);

/// Coordinates confirmations between alarm requests and device responses.
#[derive(Clone)]
pub struct ConfirmationService {
    directory: Arc<dyn Directory>,
    dispatcher: Arc<dyn PushDispatcher>,
    pending: PendingSet,
    timeout: Duration,
}

impl ConfirmationService {
    pub fn new(directory: Arc<dyn Directory>, dispatcher: Arc<dyn PushDispatcher>) -> Self {
        Self {
            directory,
            dispatcher,
            pending: PendingSet::new(),
            timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Asks the alarm's owner to confirm a fire and waits for the answer.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotFound`] if the alarm is unknown, its owner is missing, or
    ///   the owner has no registered devices. Nothing is sent in that case.
    /// - [`ServerError::Conflict`] if the same alarm and timestamp is already
    ///   awaiting confirmation.
    /// - [`ServerError::Internal`] if the directory fails.
    ///
    /// A timeout is not an error: the outcome carries `confirmed: None`.
    pub async fn confirm_alarm(&self, alarm_id: &str, timestamp: i64) -> Result<ConfirmationOutcome> {
        let alarm = self
            .directory
            .alarm_by_serial(alarm_id)
            .await?
            .ok_or_else(|| ServerError::not_found(format!("alarm '{alarm_id}'")))?;

        let owner_id = alarm
            .owner
            .ok_or_else(|| ServerError::not_found(format!("owner of alarm '{alarm_id}'")))?;
        let owner = self
            .directory
            .user_by_id(owner_id)
            .await?
            .ok_or_else(|| ServerError::not_found(format!("user '{owner_id}'")))?
            .id;

        let subscriptions = self.directory.subscriptions_for(owner).await?;
        if subscriptions.is_empty() {
            return Err(ServerError::not_found(format!(
                "subscriptions for owner of alarm '{alarm_id}'"
            )));
        }

        let key = CorrelationKey::new(alarm_id, timestamp);
        let reservation = self.pending.reserve(key.clone(), owner, &alarm.location)?;

        let payload = NotificationPayload::confirmation_prompt(&alarm, &key);
        let report = fan_out(self.dispatcher.as_ref(), &subscriptions, &payload).await;

        for endpoint in &report.expired_endpoints {
            match self.directory.remove_subscription(endpoint).await {
                Ok(_) => debug!(user_id = %owner, "Pruned expired subscription"),
                Err(e) => warn!(error = %e, "Failed to prune expired subscription"),
            }
        }

        info!(
            correlation_key = %key,
            user_id = %owner,
            total = report.total,
            succeeded = report.success_count,
            "Awaiting alarm confirmation"
        );

        let confirmed = reservation.wait(self.timeout).await;

        info!(correlation_key = %key, confirmed = ?confirmed, "Alarm confirmation finished");

        Ok(ConfirmationOutcome {
            confirmed,
            location: alarm.location,
            total_subscriptions: report.total,
            successful_notifications: report.success_count,
            errors: report.errors,
        })
    }

    /// Resolves every confirmation waiting on `user_id`.
    ///
    /// Returns how many were resolved; zero is not an error.
    pub fn submit_response(&self, user_id: Uuid, confirmed: bool) -> usize {
        let resolved = self.pending.complete_for_user(user_id, confirmed);
        if resolved == 0 {
            debug!(user_id = %user_id, "Response matched no pending confirmation");
        }
        resolved
    }

    /// Resolves the confirmation for `key` if `user_id` owns it.
    pub fn submit_correlated_response(
        &self,
        user_id: Uuid,
        key: &CorrelationKey,
        confirmed: bool,
    ) -> bool {
        let resolved = self.pending.complete_matching(key, user_id, confirmed);
        if !resolved {
            debug!(user_id = %user_id, correlation_key = %key, "Response matched no pending confirmation");
        }
        resolved
    }
}
