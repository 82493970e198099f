//! HTTP route handlers for the Firewatch server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /confirm` - Alarm asks its owner to confirm a fire (long poll)
//! - `GET /response` - A device answers a pending confirmation
//! - `POST /login` - Exchange credentials for a session token
//! - `POST /subscriptions` - Register a device's push subscription
//! - `POST /alarms` - Link an alarm to the caller's account
//! - `GET /push/public-key` - VAPID key browsers subscribe with
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration (including auth settings)
//! - The confirmation service, which owns the directory, push dispatcher and
//!   pending confirmations
//! - Session store for user tokens
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use firewatch_server::config::Config;
//! use firewatch_server::directory::MemoryDirectory;
//! use firewatch_server::push::WebPushDispatcher;
//! use firewatch_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let dispatcher = WebPushDispatcher::new(&config.vapid_private_key, &config.vapid_subject)
//!         .expect("invalid VAPID key");
//!     let state = AppState::new(config, Arc::new(MemoryDirectory::new()), Arc::new(dispatcher));
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{authenticate, signing_message, verify_alarm_signature, HEADER_ALARM_SIGNATURE};
use crate::config::Config;
use crate::confirm::ConfirmationService;
use crate::directory::Directory;
use crate::error::{Result, ServerError};
use crate::push::PushDispatcher;
use crate::session::{SessionStore, SessionStoreConfig};
use crate::types::{ActionKind, Alarm, ConfirmationOutcome, CorrelationKey, Identity, PushSubscription};

// ============================================================================
// Constants
// ============================================================================

/// Body returned by `/response` regardless of whether anything was resolved.
pub const RESPONSE_RECEIVED: &str = "Response received";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Cloned for each request handler; every field is a cheap handle onto
/// server-wide resources.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Confirmation rendezvous and the collaborators it drives.
    pub confirmations: ConfirmationService,

    /// Session tokens issued by `/login`.
    pub sessions: SessionStore,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates a new application state with the given configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Server configuration parsed from environment variables
    /// * `directory` - Store holding users, alarms and subscriptions
    /// * `dispatcher` - Delivers push messages to devices
    #[must_use]
    pub fn new(
        config: Config,
        directory: Arc<dyn Directory>,
        dispatcher: Arc<dyn PushDispatcher>,
    ) -> Self {
        let confirmations =
            ConfirmationService::new(directory, dispatcher).with_timeout(config.confirm_timeout);
        let sessions = SessionStore::new(SessionStoreConfig {
            ttl: config.session_ttl,
            ..SessionStoreConfig::default()
        });
        Self::with_components(config, confirmations, sessions)
    }

    /// Creates application state from pre-built components.
    ///
    /// Useful for testing or when a custom session store is needed.
    #[must_use]
    pub fn with_components(
        config: Config,
        confirmations: ConfirmationService,
        sessions: SessionStore,
    ) -> Self {
        Self {
            config: Arc::new(config),
            confirmations,
            sessions,
            start_time: Instant::now(),
        }
    }

    fn directory(&self) -> &Arc<dyn Directory> {
        self.confirmations.directory()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("pending", &self.confirmations.pending().len())
            .field("sessions", &self.sessions)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// # Arguments
///
/// * `state` - Shared application state
///
/// # Returns
///
/// An axum `Router` serving the endpoints listed in the module docs, with
/// request tracing and a CORS policy that lets browser clients call the API.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-alarm-signature"),
        ]);

    Router::new()
        .route("/confirm", get(get_confirm))
        .route("/response", get(get_response))
        .route("/login", post(post_login))
        .route("/subscriptions", post(post_subscription))
        .route("/alarms", post(post_alarm))
        .route("/push/public-key", get(get_public_key))
        .route("/health", get(get_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Caller resolution
// ============================================================================

/// Resolves the session behind the request's bearer token.
fn require_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity> {
    authenticate(headers, &state.sessions).map_err(|err| {
        debug!(error = %err, "Authentication failed");
        ServerError::from(err)
    })
}

/// Like [`require_identity`], but with auth disabled an anonymous caller may
/// act for any user.
fn responder_identity(state: &AppState, headers: &HeaderMap) -> Result<Option<Identity>> {
    match require_identity(state, headers) {
        Ok(identity) => Ok(Some(identity)),
        Err(_) if state.config.unsafe_no_auth => Ok(None),
        Err(err) => Err(err),
    }
}

// ============================================================================
// GET /confirm - Alarm Confirmation
// ============================================================================

/// Query parameters for `/confirm`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmParams {
    pub alarm_id: Option<String>,
    pub timestamp: Option<String>,
}

impl ConfirmParams {
    fn parse(&self) -> Result<(&str, i64)> {
        let alarm_id = self
            .alarm_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ServerError::bad_request("missing alarmId"))?;

        let raw = self
            .timestamp
            .as_deref()
            .map(str::trim)
            .filter(|ts| !ts.is_empty())
            .ok_or_else(|| ServerError::bad_request("missing timestamp"))?;

        let timestamp = raw
            .parse::<i64>()
            .map_err(|_| ServerError::bad_request(format!("invalid timestamp '{raw}'")))?;

        Ok((alarm_id, timestamp))
    }
}

/// GET /confirm - Ask the alarm's owner whether there is a fire.
///
/// # Authentication
///
/// Unless `unsafe_no_auth` is enabled, the request must carry an
/// `X-Alarm-Signature` header: the base64 Ed25519 signature of
/// `"{alarmId}:{timestamp}"` made with the alarm's registered key.
///
/// # Responses
///
/// - `200 OK` - `{confirmed, location, totalSubscriptions, successfulNotifications, errors}`;
///   `confirmed` is `null` if nobody answered in time
/// - `400 Bad Request` - Missing or invalid parameters
/// - `401 Unauthorized` - Signature missing or invalid
/// - `404 Not Found` - Unknown alarm, unowned alarm or no registered devices
/// - `409 Conflict` - The same alarm and timestamp is already waiting
async fn get_confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ConfirmParams>,
) -> Result<Json<ConfirmationOutcome>> {
    let (alarm_id, timestamp) = params.parse()?;

    if !state.config.unsafe_no_auth {
        let signature = headers
            .get(HEADER_ALARM_SIGNATURE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                debug!(alarm_id = %alarm_id, "Missing X-Alarm-Signature header");
                ServerError::unauthorized("missing X-Alarm-Signature header")
            })?;

        let message = signing_message(alarm_id, timestamp);
        if let Err(err) =
            verify_alarm_signature(alarm_id, signature, message.as_bytes(), &state.config.alarm_keys)
        {
            warn!(alarm_id = %alarm_id, error = %err, "Alarm signature verification failed");
            return Err(err.into());
        }
    }

    info!(alarm_id = %alarm_id, timestamp, "Alarm confirmation requested");

    let outcome = state.confirmations.confirm_alarm(alarm_id, timestamp).await?;
    Ok(Json(outcome))
}

// ============================================================================
// GET /response - Device Response
// ============================================================================

/// Query parameters for `/response`.
///
/// Values are kept as strings so malformed input can be logged and ignored
/// instead of rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseParams {
    pub confirmed: Option<String>,
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub alarm_id: Option<String>,
    pub timestamp: Option<String>,
}

impl ResponseParams {
    /// The answer carried by the request, from `action` or `confirmed`.
    fn answer(&self) -> Option<bool> {
        if let Some(action) = self.action.as_deref() {
            return match ActionKind::from_action_id(action) {
                Some(kind) => Some(kind.confirmed()),
                None => {
                    warn!(action = %action, "Ignoring unknown notification action");
                    None
                }
            };
        }

        match self.confirmed.as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("true") => Some(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Some(false),
            other => {
                warn!(confirmed = ?other, "Ignoring response without a valid answer");
                None
            }
        }
    }

    /// The exact confirmation this response targets, if the device echoed it.
    fn correlation_key(&self) -> Option<CorrelationKey> {
        let alarm_id = self.alarm_id.as_deref()?.trim();
        let timestamp = self.timestamp.as_deref()?.trim().parse().ok()?;
        (!alarm_id.is_empty()).then(|| CorrelationKey::new(alarm_id, timestamp))
    }
}

/// Picks the user the response is submitted for.
///
/// A regular user may only answer for themselves; admins and anonymous
/// callers (auth disabled) may name any user.
fn responding_user(caller: Option<&Identity>, requested: Option<&str>) -> Option<Uuid> {
    let requested = match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(user_id = %raw, "Ignoring response with malformed userId");
                return None;
            }
        },
        None => None,
    };

    match (caller, requested) {
        (Some(identity), None) => Some(identity.user_id),
        (Some(identity), Some(id)) if id == identity.user_id || identity.is_admin => Some(id),
        (Some(identity), Some(id)) => {
            warn!(
                caller = %identity.user_id,
                requested = %id,
                "Ignoring response submitted for another user"
            );
            None
        }
        (None, Some(id)) => Some(id),
        (None, None) => {
            warn!("Ignoring anonymous response without userId");
            None
        }
    }
}

/// GET /response - Deliver a device's answer to a pending confirmation.
///
/// # Query Parameters
///
/// - `confirmed` - `true` or `false`
/// - `action` - `confirm` or `deny`; takes precedence over `confirmed`
/// - `userId` - Responding user; defaults to the caller
/// - `alarmId`, `timestamp` - Target one confirmation instead of all of the
///   user's pending ones
///
/// # Responses
///
/// - `200 OK` - `"Response received"`, whether or not anything was waiting
/// - `401 Unauthorized` / `422 Unprocessable Entity` - Invalid or missing token
async fn get_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ResponseParams>,
) -> Result<&'static str> {
    let caller = responder_identity(&state, &headers)?;

    let Some(confirmed) = params.answer() else {
        return Ok(RESPONSE_RECEIVED);
    };
    let Some(user_id) = responding_user(caller.as_ref(), params.user_id.as_deref()) else {
        return Ok(RESPONSE_RECEIVED);
    };

    match params.correlation_key() {
        Some(key) => {
            let resolved = state
                .confirmations
                .submit_correlated_response(user_id, &key, confirmed);
            info!(user_id = %user_id, correlation_key = %key, confirmed, resolved, "Response received");
        }
        None => {
            let resolved = state.confirmations.submit_response(user_id, confirmed);
            info!(user_id = %user_id, confirmed, resolved, "Response received");
        }
    }

    Ok(RESPONSE_RECEIVED)
}

// ============================================================================
// POST /login - Session Issuance
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

/// Response body for a successful login.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
}

/// POST /login - Exchange a username and password for a session token.
///
/// # Responses
///
/// - `200 OK` - `{token, expiresIn}`
/// - `401 Unauthorized` - Unknown user or wrong password
/// - `422 Unprocessable Entity` - Body is not `{username, password}`
async fn post_login(State(state): State<AppState>, body: Bytes) -> Result<Json<LoginResponse>> {
    let request: LoginRequest = serde_json::from_slice(&body)
        .map_err(|e| ServerError::unprocessable(format!("invalid login request: {e}")))?;

    let user = state
        .directory()
        .user_by_username(&request.username)
        .await?
        .filter(|user| user.verify_password(&request.password))
        .ok_or_else(|| {
            info!(username = %request.username, "Login rejected");
            ServerError::unauthorized("invalid username or password")
        })?;

    let token = state.sessions.create_session(user.identity())?;
    info!(user_id = %user.id, "Session issued");

    Ok(Json(LoginResponse {
        token,
        expires_in: state.sessions.ttl().as_secs(),
    }))
}

// ============================================================================
// POST /subscriptions - Device Registration
// ============================================================================

/// POST /subscriptions - Register the caller's device for push notifications.
///
/// The body is the JSON the browser's `PushSubscription.toJSON()` produces.
///
/// # Responses
///
/// - `201 Created`
/// - `409 Conflict` - Endpoint already registered
/// - `422 Unprocessable Entity` - Malformed subscription or missing token
async fn post_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let identity = require_identity(&state, &headers)?;

    let subscription: PushSubscription = serde_json::from_slice(&body)
        .map_err(|e| ServerError::unprocessable(format!("invalid subscription: {e}")))?;
    if subscription.endpoint.trim().is_empty()
        || subscription.keys.p256dh.is_empty()
        || subscription.keys.auth.is_empty()
    {
        return Err(ServerError::unprocessable(
            "subscription endpoint and keys must not be empty",
        ));
    }

    state
        .directory()
        .add_subscription(identity.user_id, subscription)
        .await?;
    info!(user_id = %identity.user_id, "Device subscribed");

    Ok(StatusCode::CREATED)
}

// ============================================================================
// POST /alarms - Alarm Linking
// ============================================================================

#[derive(Debug, Deserialize)]
struct LinkAlarmRequest {
    serial: String,
    location: String,
}

/// POST /alarms - Link an alarm to the caller's account.
///
/// # Responses
///
/// - `201 Created` - The linked alarm
/// - `409 Conflict` - Alarm owned by another user
/// - `422 Unprocessable Entity` - Body is not `{serial, location}` or missing token
async fn post_alarm(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Alarm>)> {
    let identity = require_identity(&state, &headers)?;

    let request: LinkAlarmRequest = serde_json::from_slice(&body)
        .map_err(|e| ServerError::unprocessable(format!("invalid alarm: {e}")))?;
    let serial = request.serial.trim();
    let location = request.location.trim();
    if serial.is_empty() || location.is_empty() {
        return Err(ServerError::unprocessable(
            "serial and location must not be empty",
        ));
    }

    let alarm = state
        .directory()
        .link_alarm(serial, location, identity.user_id)
        .await?;
    info!(user_id = %identity.user_id, serial = %alarm.serial, "Alarm linked");

    Ok((StatusCode::CREATED, Json(alarm)))
}

// ============================================================================
// GET /push/public-key - VAPID Key
// ============================================================================

/// Response body for the VAPID public key endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    pub public_key: String,
}

/// GET /push/public-key - The `applicationServerKey` browsers subscribe with.
///
/// No authentication required.
async fn get_public_key(State(state): State<AppState>) -> Json<PublicKeyResponse> {
    Json(PublicKeyResponse {
        public_key: state.config.vapid_public_key.clone(),
    })
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Confirmations currently waiting for an answer.
    pub pending_confirmations: usize,

    /// Live session tokens.
    pub active_sessions: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// Returns server health status and statistics.
/// No authentication required.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "pendingConfirmations": 1,
///   "activeSessions": 3,
///   "uptimeSeconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed();

    Json(HealthResponse {
        status: "ok".to_string(),
        pending_confirmations: state.confirmations.pending().len(),
        active_sessions: state.sessions.len(),
        uptime_seconds: uptime.as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use base64::prelude::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::directory::MemoryDirectory;
    use crate::push::PushError;
    use crate::types::{SubscriptionKeys, User};

    const VAPID_PUBLIC_KEY: &str = "BTestPublicKey";

    #[derive(Default)]
    struct CountingDispatcher {
        sent: Mutex<usize>,
    }

    impl CountingDispatcher {
        fn sent(&self) -> usize {
            *self.sent.lock().unwrap()
        }
    }

    #[async_trait]
    impl PushDispatcher for CountingDispatcher {
        async fn send(
            &self,
            _subscription: &PushSubscription,
            _payload: &[u8],
        ) -> std::result::Result<(), PushError> {
            *self.sent.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct TestApp {
        state: AppState,
        directory: Arc<MemoryDirectory>,
        dispatcher: Arc<CountingDispatcher>,
        user: User,
    }

    impl TestApp {
        fn router(&self) -> Router {
            create_router(self.state.clone())
        }

        fn token_for(&self, user: &User) -> String {
            self.state.sessions.create_session(user.identity()).unwrap()
        }
    }

    /// Creates a test configuration with authentication disabled.
    fn test_config_no_auth() -> Config {
        Config {
            alarm_keys: HashMap::new(),
            port: 8080,
            unsafe_no_auth: true,
            vapid_private_key: String::new(),
            vapid_public_key: VAPID_PUBLIC_KEY.to_string(),
            vapid_subject: "mailto:test@example.com".to_string(),
            confirm_timeout: Duration::from_millis(100),
            session_ttl: Duration::from_secs(60),
            directory_file: None,
        }
    }

    /// Creates a test configuration with authentication enabled.
    fn test_config_with_auth(public_key_base64: &str) -> Config {
        Config {
            alarm_keys: HashMap::from([("A1".to_string(), public_key_base64.to_string())]),
            unsafe_no_auth: false,
            ..test_config_no_auth()
        }
    }

    /// Creates a test signing key and returns (signing_key, public_key_base64).
    fn create_test_keypair() -> (SigningKey, String) {
        let mut seed_bytes = [0u8; 32];
        for (i, byte) in seed_bytes.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_add(42);
        }
        let signing_key = SigningKey::from_bytes(&seed_bytes);
        let public_key_base64 = BASE64_STANDARD.encode(signing_key.verifying_key().to_bytes());
        (signing_key, public_key_base64)
    }

    fn sign(key: &SigningKey, alarm_id: &str, timestamp: i64) -> String {
        let message = signing_message(alarm_id, timestamp);
        BASE64_STANDARD.encode(key.sign(message.as_bytes()).to_bytes())
    }

    fn user(name: &str, is_admin: bool) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            password: format!("{name}-pw"),
            is_admin,
        }
    }

    /// App with user `u1` owning alarm `A1` and one registered device.
    async fn test_app(config: Config) -> TestApp {
        let directory = Arc::new(MemoryDirectory::new());
        let dispatcher = Arc::new(CountingDispatcher::default());
        let owner = user("u1", false);
        directory.insert_user(owner.clone()).await;
        directory.link_alarm("A1", "Kitchen", owner.id).await.unwrap();
        directory
            .add_subscription(
                owner.id,
                PushSubscription {
                    endpoint: "https://push.example.com/u1".to_string(),
                    keys: SubscriptionKeys {
                        p256dh: "k".to_string(),
                        auth: "a".to_string(),
                    },
                },
            )
            .await
            .unwrap();

        let state = AppState::new(config, directory.clone(), dispatcher.clone());
        TestApp {
            state,
            directory,
            dispatcher,
            user: owner,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn get(app: Router, uri: &str, token: Option<&str>) -> axum::response::Response {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        app.oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post_json(
        app: Router,
        uri: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> axum::response::Response {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        app.oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap()
    }

    async fn until_pending(state: &AppState) {
        for _ in 0..200 {
            if !state.confirmations.pending().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("confirmation never became pending");
    }

    // ========================================================================
    // Health and public key tests
    // ========================================================================

    #[tokio::test]
    async fn health_returns_ok_status() {
        let app = test_app(test_config_no_auth()).await;

        let response = get(app.router(), "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let health: HealthResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.pending_confirmations, 0);
        assert_eq!(health.active_sessions, 0);
    }

    #[tokio::test]
    async fn health_uses_camel_case_fields() {
        let app = test_app(test_config_no_auth()).await;
        app.token_for(&app.user);

        let json = body_json(get(app.router(), "/health", None).await).await;
        assert_eq!(json["activeSessions"], 1);
        assert!(json.get("uptimeSeconds").is_some());
        assert!(json.get("pendingConfirmations").is_some());
    }

    #[tokio::test]
    async fn public_key_is_served_without_auth() {
        let app = test_app(test_config_with_auth("unused")).await;

        let response = get(app.router(), "/push/public-key", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["publicKey"], VAPID_PUBLIC_KEY);
    }

    // ========================================================================
    // GET /confirm tests
    // ========================================================================

    #[tokio::test]
    async fn confirm_rejects_missing_params() {
        let app = test_app(test_config_no_auth()).await;

        let response = get(app.router(), "/confirm?timestamp=1", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "bad_request");

        let response = get(app.router(), "/confirm?alarmId=A1", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = get(app.router(), "/confirm?alarmId=A1&timestamp=noon", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.dispatcher.sent(), 0);
    }

    #[tokio::test]
    async fn confirm_unknown_alarm_is_not_found() {
        let app = test_app(test_config_no_auth()).await;

        let response = get(app.router(), "/confirm?alarmId=A9&timestamp=1", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "not_found");
    }

    #[tokio::test]
    async fn confirm_times_out_with_null() {
        let app = test_app(test_config_no_auth()).await;

        let response = get(app.router(), "/confirm?alarmId=A1&timestamp=1", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert!(json["confirmed"].is_null());
        assert_eq!(json["location"], "Kitchen");
        assert_eq!(json["totalSubscriptions"], 1);
        assert_eq!(json["successfulNotifications"], 1);
        assert_eq!(json["errors"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn confirm_with_auth_requires_signature() {
        let (_, public_key) = create_test_keypair();
        let app = test_app(test_config_with_auth(&public_key)).await;

        let response = get(app.router(), "/confirm?alarmId=A1&timestamp=1", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.dispatcher.sent(), 0);
    }

    #[tokio::test]
    async fn confirm_with_auth_rejects_signature_for_other_timestamp() {
        let (signing_key, public_key) = create_test_keypair();
        let app = test_app(test_config_with_auth(&public_key)).await;

        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .uri("/confirm?alarmId=A1&timestamp=2")
                    .header(HEADER_ALARM_SIGNATURE, sign(&signing_key, "A1", 1))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.dispatcher.sent(), 0);
    }

    #[tokio::test]
    async fn confirm_with_auth_accepts_valid_signature() {
        let (signing_key, public_key) = create_test_keypair();
        let app = test_app(test_config_with_auth(&public_key)).await;

        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .uri("/confirm?alarmId=A1&timestamp=5")
                    .header(HEADER_ALARM_SIGNATURE, sign(&signing_key, "A1", 5))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.dispatcher.sent(), 1);
    }

    #[tokio::test]
    async fn confirm_resolves_with_owner_response() {
        let mut config = test_config_no_auth();
        config.confirm_timeout = Duration::from_secs(5);
        let app = test_app(config).await;
        let token = app.token_for(&app.user);

        let router = app.router();
        let waiter = tokio::spawn(async move {
            get(router, "/confirm?alarmId=A1&timestamp=1700000000", None).await
        });
        until_pending(&app.state).await;

        let response = get(app.router(), "/response?action=deny", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(waiter.await.unwrap()).await;
        assert_eq!(json["confirmed"], false);
    }

    #[tokio::test]
    async fn confirm_duplicate_in_flight_is_conflict() {
        let mut config = test_config_no_auth();
        config.confirm_timeout = Duration::from_secs(5);
        let app = test_app(config).await;

        let router = app.router();
        let waiter =
            tokio::spawn(async move { get(router, "/confirm?alarmId=A1&timestamp=7", None).await });
        until_pending(&app.state).await;

        let response = get(app.router(), "/confirm?alarmId=A1&timestamp=7", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        app.state.confirmations.submit_response(app.user.id, true);
        assert_eq!(body_json(waiter.await.unwrap()).await["confirmed"], true);
    }

    // ========================================================================
    // GET /response tests
    // ========================================================================

    #[tokio::test]
    async fn response_requires_token_when_auth_enabled() {
        let app = test_app(test_config_with_auth("unused")).await;

        let response = get(app.router(), "/response?confirmed=true", None).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = get(app.router(), "/response?confirmed=true", Some("bogus")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn response_without_pending_is_still_ok() {
        let app = test_app(test_config_with_auth("unused")).await;
        let token = app.token_for(&app.user);

        let response = get(app.router(), "/response?confirmed=true", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], RESPONSE_RECEIVED.as_bytes());
    }

    #[tokio::test]
    async fn response_for_another_user_is_ignored() {
        let app = test_app(test_config_with_auth("unused")).await;
        let other = user("u2", false);
        app.directory.insert_user(other.clone()).await;
        let token = app.token_for(&other);

        let _reservation = app
            .state
            .confirmations
            .pending()
            .reserve(CorrelationKey::new("A1", 1), app.user.id, "Kitchen")
            .unwrap();

        let uri = format!("/response?confirmed=true&userId={}", app.user.id);
        let response = get(app.router(), &uri, Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.state.confirmations.pending().len(), 1);
    }

    #[tokio::test]
    async fn admin_may_respond_for_any_user() {
        let app = test_app(test_config_with_auth("unused")).await;
        let admin = user("root", true);
        app.directory.insert_user(admin.clone()).await;
        let token = app.token_for(&admin);

        let _reservation = app
            .state
            .confirmations
            .pending()
            .reserve(CorrelationKey::new("A1", 1), app.user.id, "Kitchen")
            .unwrap();

        let uri = format!("/response?confirmed=true&userId={}", app.user.id);
        get(app.router(), &uri, Some(&token)).await;
        assert!(app.state.confirmations.pending().is_empty());
    }

    #[tokio::test]
    async fn unknown_action_submits_nothing() {
        let app = test_app(test_config_with_auth("unused")).await;
        let token = app.token_for(&app.user);
        let _reservation = app
            .state
            .confirmations
            .pending()
            .reserve(CorrelationKey::new("A1", 1), app.user.id, "Kitchen")
            .unwrap();

        let response = get(app.router(), "/response?action=snooze", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.state.confirmations.pending().len(), 1);
    }

    #[tokio::test]
    async fn correlated_response_targets_one_key() {
        let app = test_app(test_config_with_auth("unused")).await;
        let token = app.token_for(&app.user);
        let pending = app.state.confirmations.pending();
        let _first = pending
            .reserve(CorrelationKey::new("A1", 1), app.user.id, "Kitchen")
            .unwrap();
        let _second = pending
            .reserve(CorrelationKey::new("A1", 2), app.user.id, "Kitchen")
            .unwrap();

        let uri = "/response?action=confirm&alarmId=A1&timestamp=2";
        get(app.router(), uri, Some(&token)).await;

        assert!(pending.contains(&CorrelationKey::new("A1", 1)));
        assert!(!pending.contains(&CorrelationKey::new("A1", 2)));
    }

    #[test]
    fn responding_user_rules() {
        let alice = user("alice", false).identity();
        let admin = user("root", true).identity();
        let target = Uuid::new_v4();
        let target_str = target.to_string();

        assert_eq!(responding_user(Some(&alice), None), Some(alice.user_id));
        assert_eq!(responding_user(Some(&alice), Some(&target_str)), None);
        assert_eq!(responding_user(Some(&admin), Some(&target_str)), Some(target));
        assert_eq!(responding_user(None, Some(&target_str)), Some(target));
        assert_eq!(responding_user(None, None), None);
        assert_eq!(responding_user(Some(&admin), Some("not-a-uuid")), None);
    }

    #[test]
    fn response_params_answer_prefers_action() {
        let params = ResponseParams {
            confirmed: Some("true".to_string()),
            action: Some("deny".to_string()),
            ..ResponseParams::default()
        };
        assert_eq!(params.answer(), Some(false));

        let params = ResponseParams {
            confirmed: Some("FALSE".to_string()),
            ..ResponseParams::default()
        };
        assert_eq!(params.answer(), Some(false));

        let params = ResponseParams {
            confirmed: Some("maybe".to_string()),
            ..ResponseParams::default()
        };
        assert_eq!(params.answer(), None);
    }

    // ========================================================================
    // Login, subscription and alarm tests
    // ========================================================================

    #[tokio::test]
    async fn login_issues_token() {
        let app = test_app(test_config_with_auth("unused")).await;

        let response = post_json(
            app.router(),
            "/login",
            None,
            serde_json::json!({"username": "u1", "password": "u1-pw"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let login: LoginResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(login.expires_in, 60);
        assert!(app.state.sessions.validate_session(&login.token).is_some());
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let app = test_app(test_config_with_auth("unused")).await;

        let response = post_json(
            app.router(),
            "/login",
            None,
            serde_json::json!({"username": "u1", "password": "wrong"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = post_json(
            app.router(),
            "/login",
            None,
            serde_json::json!({"username": "nobody", "password": "x"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_rejects_missing_fields() {
        let app = test_app(test_config_with_auth("unused")).await;

        let response = post_json(
            app.router(),
            "/login",
            None,
            serde_json::json!({"username": "u1"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn subscription_registration() {
        let app = test_app(test_config_with_auth("unused")).await;
        let token = app.token_for(&app.user);
        let body = serde_json::json!({
            "endpoint": "https://push.example.com/new",
            "expirationTime": null,
            "keys": {"p256dh": "BKey", "auth": "c2VjcmV0"}
        });

        let response = post_json(app.router(), "/subscriptions", Some(&token), body.clone()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            app.directory.subscriptions_for(app.user.id).await.unwrap().len(),
            2
        );

        let response = post_json(app.router(), "/subscriptions", Some(&token), body).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn subscription_requires_session_and_valid_body() {
        let app = test_app(test_config_no_auth()).await;
        let token = app.token_for(&app.user);

        let response = post_json(
            app.router(),
            "/subscriptions",
            None,
            serde_json::json!({"endpoint": "https://push.example.com/x", "keys": {"p256dh": "a", "auth": "b"}}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = post_json(
            app.router(),
            "/subscriptions",
            Some(&token),
            serde_json::json!({"endpoint": "https://push.example.com/x"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn alarm_linking() {
        let app = test_app(test_config_with_auth("unused")).await;
        let other = user("u2", false);
        app.directory.insert_user(other.clone()).await;

        let token = app.token_for(&other);
        let response = post_json(
            app.router(),
            "/alarms",
            Some(&token),
            serde_json::json!({"serial": "B7", "location": "Garage"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let alarm: Alarm = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(alarm.owner, Some(other.id));

        let response = post_json(
            app.router(),
            "/alarms",
            Some(&token),
            serde_json::json!({"serial": "A1", "location": "Garage"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = post_json(
            app.router(),
            "/alarms",
            Some(&token),
            serde_json::json!({"serial": " ", "location": "Garage"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn app_state_debug_impl() {
        let state = AppState::new(
            test_config_no_auth(),
            Arc::new(MemoryDirectory::new()),
            Arc::new(CountingDispatcher::default()),
        );
        let debug = format!("{state:?}");
        assert!(debug.contains("AppState"));
        assert!(debug.contains("<Config>"));
    }
}
