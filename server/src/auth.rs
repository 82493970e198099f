//! Request authentication.
//!
//! Two kinds of callers reach the server:
//!
//! - **Alarm devices** trigger confirmations. Each alarm holds an Ed25519 key
//!   pair; its public key is registered through `FIREWATCH_ALARM_KEYS`. The
//!   device signs the canonical message `"{alarmId}:{timestamp}"` and sends the
//!   base64 signature in the `X-Alarm-Signature` header.
//! - **Users** respond to prompts and manage their devices. They present a
//!   session token (see [`crate::session`]) as `Authorization: Bearer <token>`.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use firewatch_server::auth::{signing_message, verify_alarm_signature, AuthError};
//!
//! let keys: HashMap<String, String> = HashMap::new();
//! let message = signing_message("A1", 1_700_000_000);
//! assert_eq!(message, "A1:1700000000");
//!
//! let result = verify_alarm_signature("A1", "c2ln", message.as_bytes(), &keys);
//! assert!(matches!(result, Err(AuthError::UnknownAlarm(_))));
//! ```

use std::collections::HashMap;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::prelude::*;
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use thiserror::Error;
use tracing::trace;

use crate::session::SessionStore;
use crate::types::Identity;

/// Header carrying the alarm device's signature.
pub const HEADER_ALARM_SIGNATURE: &str = "X-Alarm-Signature";

const BEARER_PREFIX: &str = "Bearer ";

/// Errors that can occur while authenticating a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential was supplied in the named header.
    #[error("missing credential: {0}")]
    MissingCredential(String),

    /// The bearer token is unknown or expired.
    #[error("invalid or expired token")]
    InvalidToken,

    /// No public key is registered for this alarm serial.
    #[error("unknown alarm: {0}")]
    UnknownAlarm(String),

    /// The signature did not verify against the alarm's public key.
    #[error("invalid signature")]
    InvalidSignature,

    /// Base64 decoding failed for the specified field.
    #[error("invalid base64 encoding for {0}")]
    InvalidBase64(String),

    /// The registered public key bytes are malformed.
    #[error("invalid public key format")]
    InvalidPublicKey,
}

impl AuthError {
    pub fn missing_credential(header: impl Into<String>) -> Self {
        Self::MissingCredential(header.into())
    }

    pub fn unknown_alarm(serial: impl Into<String>) -> Self {
        Self::UnknownAlarm(serial.into())
    }

    pub fn invalid_base64(field: impl Into<String>) -> Self {
        Self::InvalidBase64(field.into())
    }

    /// Returns `true` if this error indicates malformed input data.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::InvalidBase64(_) | Self::InvalidPublicKey)
    }
}

/// Builds the message an alarm signs when triggering a confirmation.
pub fn signing_message(alarm_id: &str, timestamp: i64) -> String {
    format!("{alarm_id}:{timestamp}")
}

/// Verifies an alarm device's Ed25519 signature.
///
/// # Arguments
///
/// * `alarm_id` - Serial of the signing alarm
/// * `signature_base64` - The base64-encoded Ed25519 signature
/// * `message` - The exact bytes that were signed
/// * `alarm_keys` - Map of alarm serial to base64-encoded public key
///
/// # Errors
///
/// See [`AuthError`]; any error means the trigger must be rejected.
pub fn verify_alarm_signature(
    alarm_id: &str,
    signature_base64: &str,
    message: &[u8],
    alarm_keys: &HashMap<String, String>,
) -> Result<(), AuthError> {
    let public_key_base64 = alarm_keys
        .get(alarm_id)
        .ok_or_else(|| AuthError::unknown_alarm(alarm_id))?;

    let public_key_bytes = BASE64_STANDARD
        .decode(public_key_base64)
        .map_err(|_| AuthError::invalid_base64("public_key"))?;

    let public_key_array: [u8; PUBLIC_KEY_LENGTH] = public_key_bytes
        .try_into()
        .map_err(|_| AuthError::InvalidPublicKey)?;

    let verifying_key =
        VerifyingKey::from_bytes(&public_key_array).map_err(|_| AuthError::InvalidPublicKey)?;

    let signature_bytes = BASE64_STANDARD
        .decode(signature_base64)
        .map_err(|_| AuthError::invalid_base64("signature"))?;

    let signature_array: [u8; SIGNATURE_LENGTH] = signature_bytes
        .try_into()
        .map_err(|_| AuthError::InvalidSignature)?;

    let signature = Signature::from_bytes(&signature_array);

    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| AuthError::InvalidSignature)
}

/// Extracts the bearer token from the `Authorization` header.
///
/// An absent or empty header is a missing credential; a header that is not a
/// bearer token is treated as an invalid one.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::missing_credential("Authorization"))?;

    let token = value
        .strip_prefix(BEARER_PREFIX)
        .map(str::trim)
        .ok_or(AuthError::InvalidToken)?;

    if token.is_empty() {
        return Err(AuthError::missing_credential("Authorization"));
    }
    Ok(token)
}

/// Resolves the request's bearer token to the identity it was issued for.
pub fn authenticate(headers: &HeaderMap, sessions: &SessionStore) -> Result<Identity, AuthError> {
    let token = bearer_token(headers)?;
    let session = sessions
        .validate_session(token)
        .ok_or(AuthError::InvalidToken)?;
    trace!(user_id = %session.identity.user_id, "Request authenticated");
    Ok(session.identity)
}
