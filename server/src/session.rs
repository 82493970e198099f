//! Session token store for authenticated users.
//!
//! Users log in with a username and password and receive an opaque session
//! token. The token is presented as a bearer credential on every
//! authenticated request and resolves to the caller's [`Identity`].
//!
//! # Token Format
//!
//! Session tokens are 32 bytes of cryptographically secure random data,
//! base64-url encoded without padding, resulting in 43 character tokens.
//!
//! # Thread Safety
//!
//! The [`SessionStore`] uses interior mutability with [`RwLock`] for
//! thread-safe access across async tasks. Locks are never held across an
//! `.await`.
//!
//! # Example
//!
//! ```rust
//! use firewatch_server::session::{SessionStore, SessionStoreConfig};
//! use firewatch_server::types::Identity;
//! use uuid::Uuid;
//!
//! let store = SessionStore::new(SessionStoreConfig::default());
//! let identity = Identity {
//!     user_id: Uuid::new_v4(),
//!     username: "alice".to_string(),
//!     is_admin: false,
//! };
//!
//! let token = store.create_session(identity).expect("store has capacity");
//! let session = store.validate_session(&token).expect("fresh session is valid");
//! assert_eq!(session.identity.username, "alice");
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::Identity;

/// Default session TTL (1 hour).
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Longest session lifetime accepted (30 days).
pub const MAX_TTL_SECS: u64 = 30 * 24 * 3600;

/// Maximum number of concurrent sessions.
const DEFAULT_MAX_CAPACITY: usize = 10_000;

/// Size of the random token in bytes.
const TOKEN_BYTES: usize = 32;

/// Expected length of base64-url encoded token (43 characters).
const TOKEN_LENGTH: usize = 43;

/// Errors that can occur during session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session store has reached maximum capacity.
    #[error("session store at maximum capacity ({max_capacity} sessions)")]
    AtCapacity {
        /// The maximum number of sessions allowed.
        max_capacity: usize,
    },

    /// The session token was not found or has expired.
    #[error("session not found or expired")]
    NotFound,

    /// The session token format is invalid.
    #[error("invalid session token format")]
    InvalidToken,
}

/// Configuration for the session store.
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Maximum number of concurrent sessions.
    pub max_capacity: usize,

    /// Time-to-live for new sessions.
    pub ttl: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_MAX_CAPACITY,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
        }
    }
}

impl SessionStoreConfig {
    pub fn new(max_capacity: usize, ttl: Duration) -> Self {
        Self { max_capacity, ttl }
    }
}

/// An authenticated user session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Who the token was issued to.
    pub identity: Identity,

    /// When the session was created.
    pub created_at: Instant,

    /// When the session expires.
    pub expires_at: Instant,
}

impl Session {
    fn new(identity: Identity, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            identity,
            created_at: now,
            expires_at: now
                .checked_add(ttl)
                .unwrap_or_else(|| now + Duration::from_secs(MAX_TTL_SECS)),
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Returns the remaining time until expiration, or zero if expired.
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Thread-safe in-memory session store.
///
/// Cloning the store yields another handle to the same sessions.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    config: SessionStoreConfig,
}

impl SessionStore {
    pub fn new(config: SessionStoreConfig) -> Self {
        debug!(
            max_capacity = config.max_capacity,
            ttl_secs = config.ttl.as_secs(),
            "Creating new session store"
        );
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Session>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a new session and returns its token.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AtCapacity`] if the store is full.
    pub fn create_session(&self, identity: Identity) -> Result<String, SessionError> {
        let token = generate_session_token();

        let mut sessions = self.write();

        if sessions.len() >= self.config.max_capacity {
            let before = sessions.len();
            sessions.retain(|_, session| !session.is_expired());
            if sessions.len() < before {
                debug!(
                    removed = before - sessions.len(),
                    "Dropped expired sessions to make room"
                );
            }
        }

        if sessions.len() >= self.config.max_capacity {
            warn!(
                capacity = sessions.len(),
                max_capacity = self.config.max_capacity,
                "Session store at capacity, rejecting new session"
            );
            return Err(SessionError::AtCapacity {
                max_capacity: self.config.max_capacity,
            });
        }

        trace!(
            user_id = %identity.user_id,
            ttl_secs = self.config.ttl.as_secs(),
            "Creating new session"
        );

        sessions.insert(token.clone(), Session::new(identity, self.config.ttl));

        Ok(token)
    }

    /// Validates a session token and returns the session if it is live.
    ///
    /// An expired session is removed on access.
    pub fn validate_session(&self, token: &str) -> Option<Session> {
        if token.len() != TOKEN_LENGTH {
            trace!(token_len = token.len(), "Invalid token length");
            return None;
        }

        {
            let sessions = self.read();
            match sessions.get(token) {
                Some(session) if !session.is_expired() => {
                    trace!(
                        user_id = %session.identity.user_id,
                        remaining_secs = session.remaining_ttl().as_secs(),
                        "Session validated"
                    );
                    return Some(session.clone());
                }
                Some(_) => {}
                None => {
                    trace!("Session token not found");
                    return None;
                }
            }
        }

        self.write().remove(token);
        trace!("Removed expired session during validation");
        None
    }

    /// Removes a session from the store, returning it if it existed.
    pub fn remove_session(&self, token: &str) -> Option<Session> {
        let removed = self.write().remove(token);
        if let Some(ref session) = removed {
            trace!(user_id = %session.identity.user_id, "Session removed");
        }
        removed
    }

    /// Number of sessions held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// The configured session lifetime.
    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Removes all expired sessions, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut sessions = self.write();
        let initial_len = sessions.len();

        sessions.retain(|_, session| !session.is_expired());

        let removed = initial_len - sessions.len();
        if removed > 0 {
            debug!(
                removed_count = removed,
                remaining_count = sessions.len(),
                "Cleaned up expired sessions"
            );
        }
        removed
    }

    /// Spawns a background task that periodically sweeps expired sessions.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                interval.tick().await;
                store.cleanup_expired();
            }
        })
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionStoreConfig::default())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("session_count", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Generates a 43-character base64url session token from 32 random bytes.
fn generate_session_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
