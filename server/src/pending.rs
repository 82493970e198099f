//! In-flight alarm confirmations.
//!
//! A confirmation request reserves its [`CorrelationKey`] in the
//! [`PendingSet`] and then waits on the returned [`Reservation`]. Responses
//! arriving on other requests complete the entry through the set. Every
//! completion path (response, timeout, dropped waiter) goes through a single
//! remove-if-present on the shared map, so an entry is resolved at most once
//! and whichever path removes it first wins.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use firewatch_server::pending::PendingSet;
//! use firewatch_server::types::CorrelationKey;
//! use uuid::Uuid;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pending = PendingSet::new();
//! let owner = Uuid::new_v4();
//! let key = CorrelationKey::new("A1", 1_700_000_000);
//!
//! let reservation = pending.reserve(key.clone(), owner, "Kitchen").unwrap();
//! assert_eq!(pending.complete_for_user(owner, true), 1);
//! assert_eq!(reservation.wait(Duration::from_secs(1)).await, Some(true));
//! assert!(!pending.contains(&key));
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::types::CorrelationKey;

/// Errors that can occur when registering a confirmation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingError {
    /// A confirmation for this alarm and timestamp is already in flight.
    #[error("confirmation already pending for {0}")]
    Duplicate(CorrelationKey),
}

/// One in-flight confirmation cycle.
#[derive(Debug)]
struct PendingConfirmation {
    /// Distinguishes this entry from a later one reusing the same key.
    ticket: Uuid,
    owner: Uuid,
    location: String,
    sink: oneshot::Sender<bool>,
}

type Entries = HashMap<CorrelationKey, PendingConfirmation>;

/// Shared set of confirmations waiting for a response.
///
/// Cloning is cheap; all clones refer to the same set.
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    entries: Arc<Mutex<Entries>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new confirmation under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PendingError::Duplicate`] if `key` is already pending.
    pub fn reserve(
        &self,
        key: CorrelationKey,
        owner: Uuid,
        location: impl Into<String>,
    ) -> Result<Reservation, PendingError> {
        let (sink, receiver) = oneshot::channel();
        let ticket = Uuid::new_v4();

        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return Err(PendingError::Duplicate(key));
        }
        entries.insert(
            key.clone(),
            PendingConfirmation {
                ticket,
                owner,
                location: location.into(),
                sink,
            },
        );
        drop(entries);

        debug!(correlation_key = %key, user_id = %owner, "Confirmation pending");

        Ok(Reservation {
            set: self.clone(),
            key,
            ticket,
            receiver,
        })
    }

    /// Removes the entry for `key` only if it still belongs to `ticket`.
    fn take_ticket(&self, key: &CorrelationKey, ticket: Uuid) -> Option<PendingConfirmation> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.ticket == ticket => entries.remove(key),
            _ => None,
        }
    }

    /// Completes the entry for `key` with `confirmed`.
    ///
    /// Returns `false` if no such entry is pending.
    pub fn complete(&self, key: &CorrelationKey, confirmed: bool) -> bool {
        let entry = self.lock().remove(key);
        match entry {
            Some(entry) => deliver(key, entry, confirmed),
            None => false,
        }
    }

    /// Completes `key` only if it is owned by `owner`.
    pub fn complete_matching(&self, key: &CorrelationKey, owner: Uuid, confirmed: bool) -> bool {
        let entry = {
            let mut entries = self.lock();
            match entries.get(key) {
                Some(entry) if entry.owner == owner => entries.remove(key),
                _ => None,
            }
        };
        match entry {
            Some(entry) => deliver(key, entry, confirmed),
            None => false,
        }
    }

    /// Completes every entry owned by `owner`. Returns how many were resolved.
    pub fn complete_for_user(&self, owner: Uuid, confirmed: bool) -> usize {
        let taken: Vec<(CorrelationKey, PendingConfirmation)> = {
            let mut entries = self.lock();
            let keys: Vec<CorrelationKey> = entries
                .iter()
                .filter(|(_, entry)| entry.owner == owner)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        let mut delivered = 0;
        for (key, entry) in taken {
            trace!(correlation_key = %key, location = %entry.location, "Resolving by user");
            if deliver(&key, entry, confirmed) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Returns `true` if a confirmation for `key` is pending.
    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of pending confirmations.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn deliver(key: &CorrelationKey, entry: PendingConfirmation, confirmed: bool) -> bool {
    let delivered = entry.sink.send(confirmed).is_ok();
    debug!(
        correlation_key = %key,
        user_id = %entry.owner,
        confirmed,
        delivered,
        "Confirmation resolved"
    );
    delivered
}

/// Handle held by the request waiting on a confirmation.
///
/// Dropping the reservation without waiting removes its entry.
#[derive(Debug)]
pub struct Reservation {
    set: PendingSet,
    key: CorrelationKey,
    ticket: Uuid,
    receiver: oneshot::Receiver<bool>,
}

impl Reservation {
    /// Waits up to `timeout` for a response.
    ///
    /// Returns `Some(confirmed)` if a response arrived and `None` on timeout.
    /// If a response claims the entry at the same moment the timeout fires,
    /// the response wins.
    pub async fn wait(mut self, timeout: Duration) -> Option<bool> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(confirmed)) => Some(confirmed),
            Ok(Err(_)) => None,
            Err(_) => {
                if self.set.take_ticket(&self.key, self.ticket).is_some() {
                    debug!(correlation_key = %self.key, "Confirmation timed out");
                    None
                } else {
                    // A responder removed the entry first; its value is in flight.
                    (&mut self.receiver).await.ok()
                }
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.set.take_ticket(&self.key, self.ticket).is_some() {
            debug!(correlation_key = %self.key, "Confirmation abandoned");
        }
    }
}
