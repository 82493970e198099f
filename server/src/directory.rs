//! User, alarm and subscription directory.
//!
//! The confirmation flow only needs point lookups (alarm by serial, user by
//! id or username, subscriptions by owner) plus the few mutations the HTTP
//! surface exposes. [`Directory`] captures that contract so the backing store
//! can be swapped; [`MemoryDirectory`] is the implementation the server ships
//! with, optionally seeded from a JSON file at startup.
//!
//! # Seed file
//!
//! ```json
//! {
//!   "users": [{ "username": "alice", "password": "secret", "isAdmin": false }],
//!   "alarms": [{ "serial": "A1", "location": "Kitchen", "owner": "alice" }],
//!   "subscriptions": [{
//!     "owner": "alice",
//!     "endpoint": "https://push.example.com/abc",
//!     "keys": { "p256dh": "...", "auth": "..." }
//!   }]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Alarm, PushSubscription, User};

/// Errors reported by a [`Directory`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The write collides with an existing record.
    #[error("{0} already exists")]
    Conflict(String),

    /// The backing store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Lookups and mutations the server performs against its data store.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn alarm_by_serial(&self, serial: &str) -> Result<Option<Alarm>, StoreError>;

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// All push subscriptions registered by `owner`, in registration order.
    async fn subscriptions_for(&self, owner: Uuid) -> Result<Vec<PushSubscription>, StoreError>;

    /// Registers a device subscription.
    ///
    /// Fails with [`StoreError::Conflict`] if the endpoint is already
    /// registered and with [`StoreError::NotFound`] if `owner` is unknown.
    async fn add_subscription(
        &self,
        owner: Uuid,
        subscription: PushSubscription,
    ) -> Result<(), StoreError>;

    /// Drops the subscription with this endpoint. Returns whether one existed.
    async fn remove_subscription(&self, endpoint: &str) -> Result<bool, StoreError>;

    /// Links an alarm to `owner`, creating it if needed.
    ///
    /// Re-linking by the current owner updates the location. Fails with
    /// [`StoreError::Conflict`] if another user owns the alarm.
    async fn link_alarm(
        &self,
        serial: &str,
        location: &str,
        owner: Uuid,
    ) -> Result<Alarm, StoreError>;
}

#[derive(Debug, Clone)]
struct OwnedSubscription {
    owner: Uuid,
    subscription: PushSubscription,
}

#[derive(Debug, Default)]
struct DirectoryInner {
    users: HashMap<Uuid, User>,
    alarms: HashMap<String, Alarm>,
    subscriptions: Vec<OwnedSubscription>,
}

/// In-memory [`Directory`].
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    inner: RwLock<DirectoryInner>,
}

/// JSON document used to pre-populate a [`MemoryDirectory`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectorySeed {
    pub users: Vec<SeedUser>,
    pub alarms: Vec<SeedAlarm>,
    pub subscriptions: Vec<SeedSubscription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedUser {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// An alarm entry; `owner` is a username.
#[derive(Debug, Deserialize)]
pub struct SeedAlarm {
    pub serial: String,
    pub location: String,
    #[serde(default)]
    pub owner: Option<String>,
}

/// A subscription entry; `owner` is a username.
#[derive(Debug, Deserialize)]
pub struct SeedSubscription {
    pub owner: String,
    #[serde(flatten)]
    pub subscription: PushSubscription,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from a parsed seed, resolving owner usernames.
    pub fn from_seed(seed: DirectorySeed) -> anyhow::Result<Self> {
        let mut inner = DirectoryInner::default();
        let mut ids_by_name = HashMap::new();

        for user in seed.users {
            if ids_by_name.contains_key(&user.username) {
                bail!("duplicate username '{}' in seed", user.username);
            }
            let id = user.id.unwrap_or_else(Uuid::new_v4);
            ids_by_name.insert(user.username.clone(), id);
            inner.users.insert(
                id,
                User {
                    id,
                    username: user.username,
                    password: user.password,
                    is_admin: user.is_admin,
                },
            );
        }

        let resolve = |name: &str| {
            ids_by_name
                .get(name)
                .copied()
                .with_context(|| format!("seed references unknown user '{name}'"))
        };

        for alarm in seed.alarms {
            let owner = alarm.owner.as_deref().map(resolve).transpose()?;
            inner.alarms.insert(
                alarm.serial.clone(),
                Alarm {
                    serial: alarm.serial,
                    location: alarm.location,
                    owner,
                },
            );
        }

        for entry in seed.subscriptions {
            let owner = resolve(&entry.owner)?;
            if inner
                .subscriptions
                .iter()
                .any(|s| s.subscription.endpoint == entry.subscription.endpoint)
            {
                bail!("duplicate subscription endpoint '{}' in seed", entry.subscription.endpoint);
            }
            inner.subscriptions.push(OwnedSubscription {
                owner,
                subscription: entry.subscription,
            });
        }

        info!(
            users = inner.users.len(),
            alarms = inner.alarms.len(),
            subscriptions = inner.subscriptions.len(),
            "Directory seeded"
        );

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Reads and parses a seed file.
    pub fn from_seed_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read directory file {}", path.display()))?;
        let seed: DirectorySeed = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse directory file {}", path.display()))?;
        Self::from_seed(seed)
    }

    /// Adds or replaces a user record.
    pub async fn insert_user(&self, user: User) {
        self.inner.write().await.users.insert(user.id, user);
    }

    /// Adds or replaces an alarm record.
    pub async fn insert_alarm(&self, alarm: Alarm) {
        self.inner
            .write()
            .await
            .alarms
            .insert(alarm.serial.clone(), alarm);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn alarm_by_serial(&self, serial: &str) -> Result<Option<Alarm>, StoreError> {
        Ok(self.inner.read().await.alarms.get(serial).cloned())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn subscriptions_for(&self, owner: Uuid) -> Result<Vec<PushSubscription>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.owner == owner)
            .map(|s| s.subscription.clone())
            .collect())
    }

    async fn add_subscription(
        &self,
        owner: Uuid,
        subscription: PushSubscription,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        if !inner.users.contains_key(&owner) {
            return Err(StoreError::NotFound(format!("user '{owner}'")));
        }
        if inner
            .subscriptions
            .iter()
            .any(|s| s.subscription.endpoint == subscription.endpoint)
        {
            return Err(StoreError::Conflict("subscription".to_string()));
        }

        debug!(user_id = %owner, "Subscription registered");
        inner.subscriptions.push(OwnedSubscription {
            owner,
            subscription,
        });
        Ok(())
    }

    async fn remove_subscription(&self, endpoint: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.subscriptions.len();
        inner
            .subscriptions
            .retain(|s| s.subscription.endpoint != endpoint);
        Ok(inner.subscriptions.len() != before)
    }

    async fn link_alarm(
        &self,
        serial: &str,
        location: &str,
        owner: Uuid,
    ) -> Result<Alarm, StoreError> {
        let mut inner = self.inner.write().await;

        if !inner.users.contains_key(&owner) {
            return Err(StoreError::NotFound(format!("user '{owner}'")));
        }

        let alarm = inner
            .alarms
            .entry(serial.to_string())
            .or_insert_with(|| Alarm {
                serial: serial.to_string(),
                location: location.to_string(),
                owner: None,
            });

        match alarm.owner {
            Some(existing) if existing != owner => {
                Err(StoreError::Conflict(format!("owner for alarm '{serial}'")))
            }
            _ => {
                alarm.owner = Some(owner);
                alarm.location = location.to_string();
                debug!(serial = %serial, user_id = %owner, "Alarm linked");
                Ok(alarm.clone())
            }
        }
    }
}
