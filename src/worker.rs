//! The long-lived worker as seen from the page.
//!
//! The worker is a separately scheduled runtime owned by the host. The page
//! never calls into it directly: it posts [`WorkerMessage`]s through a
//! [`WorkerPeer`] and observes [`WorkerEvent`]s about its installation.
//! Installing, unregistering and cache management go through [`WorkerHost`].

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

/// Messages the page sends to the worker.
///
/// Serialized as `{"type":"SET_IDENTITY","userId":...}` and
/// `{"type":"CHECK_NOW"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Act on behalf of this user from now on (`None` = nobody).
    SetIdentity {
        #[serde(rename = "userId")]
        user_id: Option<String>,
    },
    /// Run the check logic now, outside the worker's own schedule.
    CheckNow,
}

/// Opaque identifier of one worker generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerVersionToken(String);

impl WorkerVersionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerVersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Installation events reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A new worker version started installing.
    UpdateFound { version: WorkerVersionToken },
    /// A worker version finished installing and is waiting to take over.
    Installed { version: WorkerVersionToken },
    /// A different worker took control of the page.
    ControllerChange { version: WorkerVersionToken },
}

/// Message-passing view of the worker.
#[async_trait]
pub trait WorkerPeer: Send + Sync + 'static {
    /// Whether a worker currently controls the page.
    fn has_controller(&self) -> bool;

    /// Post a message to the controlling worker.
    ///
    /// Returns [`crate::NotifyError::WorkerUnavailable`] when no worker
    /// controls the page.
    async fn post(&self, message: WorkerMessage) -> Result<()>;

    /// Tags of the periodic-sync registrations already in place.
    ///
    /// Returns [`crate::NotifyError::CapabilityUnavailable`] when the
    /// platform has no periodic sync.
    async fn periodic_sync_tags(&self) -> Result<Vec<String>>;

    /// Ask the platform to wake the worker every `min_interval` under `tag`.
    async fn register_periodic_sync(&self, tag: &str, min_interval: Duration) -> Result<()>;

    /// Subscribe to installation events.
    fn subscribe_lifecycle(&self) -> broadcast::Receiver<WorkerEvent>;
}

/// Installation and cache management for the worker.
#[async_trait]
pub trait WorkerHost: Send + Sync + 'static {
    /// Whether a worker currently controls the page.
    fn has_controller(&self) -> bool;

    /// Install (or re-validate) the worker script.
    async fn register(&self, script_url: &str) -> Result<()>;

    /// Remove every worker registration. Returns how many were removed.
    async fn unregister_all(&self) -> Result<usize>;

    /// Names of every cache the worker created.
    async fn cache_names(&self) -> Result<Vec<String>>;

    /// Delete one named cache. Returns `false` if it did not exist.
    async fn delete_cache(&self, name: &str) -> Result<bool>;

    /// Reload the page so the new controller serves it.
    fn reload(&self);
}
