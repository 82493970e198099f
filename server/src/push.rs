//! Web push delivery (RFC 8030).
//!
//! Payloads are encrypted with `aes128gcm` (RFC 8291) and authenticated with
//! a VAPID JWT (RFC 8292) using the `web-push` crate. The HTTP request itself
//! goes out through a shared `reqwest::Client` so connections are pooled
//! across a fan-out.
//!
//! The VAPID private key is the raw 32-byte P-256 scalar, base64url encoded.
//! Browsers need the matching uncompressed public key as their
//! `applicationServerKey`; [`derive_vapid_public_key`] computes it.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use p256::ecdsa::SigningKey;
use thiserror::Error;
use tracing::{debug, info, warn};
use web_push::{
    ContentEncoding, SubscriptionInfo, Urgency, VapidSignatureBuilder, WebPushMessageBuilder,
};

use crate::types::PushSubscription;

/// Seconds a push service may hold an undelivered alarm prompt.
pub const DEFAULT_PUSH_TTL_SECS: u32 = 60;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Reasons a single delivery can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The push service reports the subscription no longer exists (410).
    #[error("subscription expired")]
    Gone,

    /// The push service is throttling this sender (429).
    #[error("rate limited by push service")]
    RateLimited,

    /// The push service refused the message.
    #[error("push service returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The request never produced a response.
    #[error("push request failed: {0}")]
    Transport(String),

    /// Encrypting or signing the message failed.
    #[error("failed to build push message: {0}")]
    Message(String),

    /// The VAPID key is not a valid P-256 scalar.
    #[error("invalid VAPID key: {0}")]
    InvalidVapidKey(String),
}

impl PushError {
    /// Returns `true` if the subscription should be discarded.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Gone)
    }
}

/// Sends one payload to one device.
#[async_trait]
pub trait PushDispatcher: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError>;
}

/// Computes the base64url uncompressed public key for a VAPID private key.
///
/// # Errors
///
/// Returns [`PushError::InvalidVapidKey`] unless `private_key_b64` decodes to
/// a valid 32-byte P-256 scalar.
pub fn derive_vapid_public_key(private_key_b64: &str) -> Result<String, PushError> {
    let bytes = BASE64URL
        .decode(private_key_b64.trim_end_matches('='))
        .map_err(|_| PushError::InvalidVapidKey("not base64url".to_string()))?;

    if bytes.len() != 32 {
        return Err(PushError::InvalidVapidKey(format!(
            "expected 32-byte scalar, got {} bytes",
            bytes.len()
        )));
    }

    let signing_key = SigningKey::from_bytes(bytes.as_slice().into())
        .map_err(|_| PushError::InvalidVapidKey("not a valid P-256 scalar".to_string()))?;
    let public_bytes = signing_key.verifying_key().to_encoded_point(false);
    Ok(BASE64URL.encode(public_bytes.as_bytes()))
}

/// [`PushDispatcher`] that speaks the Web Push protocol.
#[derive(Debug, Clone)]
pub struct WebPushDispatcher {
    client: reqwest::Client,
    vapid_private_key: String,
    subject: String,
    ttl: u32,
}

impl WebPushDispatcher {
    /// Creates a dispatcher signing with `vapid_private_key` on behalf of
    /// `subject` (a `mailto:` or `https:` contact URI).
    ///
    /// # Errors
    ///
    /// Returns [`PushError::InvalidVapidKey`] if the key is malformed, or
    /// [`PushError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        vapid_private_key: impl Into<String>,
        subject: impl Into<String>,
    ) -> Result<Self, PushError> {
        let vapid_private_key = vapid_private_key.into();
        derive_vapid_public_key(&vapid_private_key)?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PushError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            vapid_private_key,
            subject: subject.into(),
            ttl: DEFAULT_PUSH_TTL_SECS,
        })
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    fn build_message(
        &self,
        subscription: &PushSubscription,
        payload: &[u8],
    ) -> Result<web_push::WebPushMessage, PushError> {
        let sub_info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        );

        let mut sig_builder = VapidSignatureBuilder::from_base64(&self.vapid_private_key, &sub_info)
            .map_err(|e| PushError::InvalidVapidKey(e.to_string()))?;
        sig_builder.add_claim("sub", self.subject.as_str());
        let signature = sig_builder
            .build()
            .map_err(|e| PushError::Message(e.to_string()))?;

        let mut builder = WebPushMessageBuilder::new(&sub_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        builder.set_ttl(self.ttl);
        builder.set_urgency(Urgency::High);

        builder.build().map_err(|e| PushError::Message(e.to_string()))
    }
}

#[async_trait]
impl PushDispatcher for WebPushDispatcher {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        let message = self.build_message(subscription, payload)?;

        let mut request = self
            .client
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());

        if let Some(urgency) = message.urgency {
            request = request.header("Urgency", urgency.to_string());
        }

        if let Some(topic) = message.topic {
            request = request.header("Topic", topic);
        }

        if let Some(push_payload) = message.payload {
            request = request
                .header("Content-Encoding", push_payload.content_encoding.to_str())
                .header("Content-Type", "application/octet-stream");

            for (key, value) in &push_payload.crypto_headers {
                request = request.header(*key, value.as_str());
            }

            request = request.body(push_payload.content);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;
        let status = response.status().as_u16();

        match status {
            200..=299 => {
                debug!(status, "Push delivered");
                Ok(())
            }
            410 => {
                info!("Push subscription expired (410 Gone)");
                Err(PushError::Gone)
            }
            429 => {
                warn!("Push service rate limited (429)");
                Err(PushError::RateLimited)
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                warn!(status, "Push service rejected message");
                Err(PushError::Rejected { status, body })
            }
        }
    }
}
