//! Registry of live notifications, keyed by owning user.
//!
//! The store is process-wide shared state ([`SharedNotificationStore`]).
//! Any component that surfaces a notification may [`add`](NotificationStore::add)
//! to it, but purges driven by a user switch belong to the orchestrator
//! alone.
//!
//! Callers that add from an async context must use
//! [`add_if_current`](NotificationStore::add_if_current): the session may have
//! changed while they were suspended.

use crate::error::{NotifyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A notification currently shown to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Caller-generated identifier, unique for the lifetime of the store.
    pub id: String,
    /// User whose session surfaced the notification.
    pub owner_user_id: String,
    /// When the notification was surfaced.
    pub created_at: DateTime<Utc>,
    /// Deduplication key; a newer record with the same tag replaces the old.
    pub tag: String,
}

impl NotificationRecord {
    /// Build a record with a fresh random id and the current timestamp.
    pub fn new(owner_user_id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: owner_user_id.into(),
            created_at: Utc::now(),
            tag: tag.into(),
        }
    }
}

/// Thread-safe handle to the process-wide store.
pub type SharedNotificationStore = Arc<Mutex<NotificationStore>>;

/// In-memory registry of live notifications.
#[derive(Debug, Default)]
pub struct NotificationStore {
    records: HashMap<String, NotificationRecord>,
}

impl NotificationStore {
    /// Wrap `self` for sharing across components.
    #[must_use]
    pub fn into_shared(self) -> SharedNotificationStore {
        Arc::new(Mutex::new(self))
    }

    /// Create an empty [`SharedNotificationStore`].
    #[must_use]
    pub fn default_shared() -> SharedNotificationStore {
        Self::default().into_shared()
    }

    /// Insert a record.
    ///
    /// A live record with the same owner and tag is replaced and returned.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::DuplicateId`] if `record.id` is already present.
    pub fn add(&mut self, record: NotificationRecord) -> Result<Option<NotificationRecord>> {
        if self.records.contains_key(&record.id) {
            return Err(NotifyError::DuplicateId(record.id));
        }

        let stale_id = self
            .records
            .values()
            .find(|r| r.owner_user_id == record.owner_user_id && r.tag == record.tag)
            .map(|r| r.id.clone());
        let replaced = stale_id.and_then(|id| self.records.remove(&id));

        self.records.insert(record.id.clone(), record);
        Ok(replaced)
    }

    /// Insert a record only if its owner is still the signed-in user.
    ///
    /// Returns `Ok(false)` (and drops the record) when the session moved on.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::DuplicateId`] if `record.id` is already present.
    pub fn add_if_current(
        &mut self,
        record: NotificationRecord,
        current_user: Option<&str>,
    ) -> Result<bool> {
        if current_user != Some(record.owner_user_id.as_str()) {
            tracing::debug!(
                id = %record.id,
                owner = %record.owner_user_id,
                "dropping notification for a session that is no longer current"
            );
            return Ok(false);
        }
        self.add(record)?;
        Ok(true)
    }

    /// Remove a single record. Returns it if it was present.
    pub fn dismiss(&mut self, id: &str) -> Option<NotificationRecord> {
        self.records.remove(id)
    }

    /// Remove every record owned by `user_id`. Returns the number removed.
    pub fn clear_for_user(&mut self, user_id: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.owner_user_id != user_id);
        before - self.records.len()
    }

    /// Remove every record. Returns the number removed.
    pub fn clear_all(&mut self) -> usize {
        let removed = self.records.len();
        self.records.clear();
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records owned by `user_id`.
    pub fn count_for_user(&self, user_id: &str) -> usize {
        self.records
            .values()
            .filter(|r| r.owner_user_id == user_id)
            .count()
    }

    /// Records owned by `user_id`, oldest first.
    pub fn records_for(&self, user_id: &str) -> Vec<NotificationRecord> {
        let mut out: Vec<_> = self
            .records
            .values()
            .filter(|r| r.owner_user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }
}
