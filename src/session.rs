//! Session-scoped state and the user-switch transition.
//!
//! [`SessionContext`] holds what used to be ambient, page-global flags (the
//! "user declined this session" marker and the last known user). It is
//! created when a browser session starts, handed to the orchestrator, and
//! dropped with it.
//!
//! [`on_user_change`] is the single place that decides which notifications
//! must be purged when the signed-in user changes.

use crate::store::NotificationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The signed-in user as reported by the auth gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: Option<String>,
}

impl UserContext {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    pub fn signed_out() -> Self {
        Self { user_id: None }
    }
}

/// State that lives exactly as long as one browser session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    started_at: DateTime<Utc>,
    declined: bool,
    last_known_user: Option<String>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            declined: false,
            last_known_user: None,
        }
    }

    /// Start a session that already knows who was signed in (session restore).
    pub fn restored(last_known_user: Option<String>) -> Self {
        Self {
            last_known_user,
            ..Self::new()
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the user declined notifications earlier in this session.
    pub fn has_declined(&self) -> bool {
        self.declined
    }

    /// Record that the user declined; no prompt is shown again this session.
    pub fn mark_declined(&mut self) {
        self.declined = true;
    }

    pub fn last_known_user(&self) -> Option<&str> {
        self.last_known_user.as_deref()
    }

    pub(crate) fn set_last_known_user(&mut self, user_id: Option<String>) {
        self.last_known_user = user_id;
    }
}

/// Store change required by a user transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMutation {
    /// Nothing to purge.
    None,
    /// Purge every record owned by this user.
    PurgeUser(String),
    /// Purge everything (full logout).
    PurgeAll,
}

impl StoreMutation {
    /// Apply the mutation. Returns the number of records removed.
    pub fn apply(&self, store: &mut NotificationStore) -> usize {
        match self {
            Self::None => 0,
            Self::PurgeUser(user_id) => store.clear_for_user(user_id),
            Self::PurgeAll => store.clear_all(),
        }
    }
}

/// Decide what to purge when the signed-in user moves from `old` to `new`.
///
/// - same user (or null to null): nothing
/// - null to a user (login): nothing; there is no previous owner
/// - user A to user B: purge A's records
/// - user A to null (logout): purge everything
pub fn on_user_change(old: Option<&str>, new: Option<&str>) -> StoreMutation {
    match (old, new) {
        (Some(a), Some(b)) if a == b => StoreMutation::None,
        (Some(a), Some(_)) => StoreMutation::PurgeUser(a.to_owned()),
        (Some(_), None) => StoreMutation::PurgeAll,
        (None, _) => StoreMutation::None,
    }
}
