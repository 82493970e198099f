//! Shared domain types for the Firewatch server.
//!
//! This module defines the records the server reads from the directory
//! (users, alarms, push subscriptions), the notification payload delivered to
//! devices, and the outcome returned to the alarm that asked for confirmation.
//! Field names on the wire use `camelCase` to match the JSON API contract.

use std::fmt;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Vibration pattern (milliseconds on/off) used for alarm prompts.
pub const ALARM_VIBRATION_PATTERN: [u32; 3] = [300, 200, 300];

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl User {
    /// Compares the candidate password against the stored one in constant time.
    pub fn verify_password(&self, candidate: &str) -> bool {
        self.password.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    /// Returns the identity this user acts as once authenticated.
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.id,
            username: self.username.clone(),
            is_admin: self.is_admin,
        }
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub is_admin: bool,
}

/// A physical alarm device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    /// Serial number printed on the device; used as the alarm identifier.
    pub serial: String,
    /// Human readable location label, e.g. "Kitchen".
    pub location: String,
    /// Owning user, if the alarm has been linked to an account.
    pub owner: Option<Uuid>,
}

/// Key material of a browser push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    /// Browser's P-256 ECDH public key (base64url).
    pub p256dh: String,
    /// Shared auth secret (base64url).
    pub auth: String,
}

/// A device's push subscription, in the shape the browser Push API emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    /// Push service endpoint URL.
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

/// Identifier of a notification action understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Confirm,
    Deny,
}

impl ActionKind {
    /// Parses an action identifier reported by a device.
    ///
    /// Returns `None` for anything other than `confirm` or `deny`.
    pub fn from_action_id(action: &str) -> Option<Self> {
        match action {
            "confirm" => Some(Self::Confirm),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }

    /// The `confirmed` value this action submits.
    pub fn confirmed(self) -> bool {
        matches!(self, Self::Confirm)
    }
}

/// A button shown on the notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: ActionKind,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl NotificationAction {
    fn button(action: ActionKind, title: &str) -> Self {
        Self {
            action,
            title: title.to_string(),
            kind: "button".to_string(),
        }
    }
}

/// The JSON document delivered to a device through the push service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub vibrate: Vec<u32>,
    /// Metadata the device echoes back when responding.
    pub data: serde_json::Value,
    pub actions: Vec<NotificationAction>,
}

impl NotificationPayload {
    /// Builds the confirm/deny prompt for a triggered alarm.
    pub fn confirmation_prompt(alarm: &Alarm, key: &CorrelationKey) -> Self {
        let triggered_at = DateTime::from_timestamp(key.timestamp, 0)
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| key.timestamp.to_string());

        Self {
            title: "Fire alarm triggered".to_string(),
            body: format!(
                "The alarm in {} went off at {}. Is there a fire?",
                alarm.location, triggered_at
            ),
            vibrate: ALARM_VIBRATION_PATTERN.to_vec(),
            data: json!({
                "alarmId": key.alarm_id,
                "timestamp": key.timestamp,
                "location": alarm.location,
                "correlationKey": key.to_string(),
            }),
            actions: vec![
                NotificationAction::button(ActionKind::Confirm, "Yes, there is a fire"),
                NotificationAction::button(ActionKind::Deny, "No, false alarm"),
            ],
        }
    }
}

/// Identifies one confirmation cycle: an alarm and the moment it fired.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub alarm_id: String,
    pub timestamp: i64,
}

impl CorrelationKey {
    pub fn new(alarm_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            alarm_id: alarm_id.into(),
            timestamp,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alarm_id, self.timestamp)
    }
}

/// Answer returned to the alarm that requested confirmation.
///
/// `confirmed` is `None` when nobody answered before the timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationOutcome {
    pub confirmed: Option<bool>,
    pub location: String,
    pub total_subscriptions: usize,
    pub successful_notifications: usize,
    pub errors: Vec<String>,
}
