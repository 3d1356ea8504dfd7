//! Background sync coordination with the long-lived worker.
//!
//! [`BackgroundSyncCoordinator`] owns three conversations with the worker:
//! the periodic wake-up registration, the identity of the user the worker
//! acts for, and on-demand checks.

use crate::config::SyncConfig;
use crate::error::{NotifyError, Result};
use crate::worker::{WorkerMessage, WorkerPeer};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Snapshot of the coordinator's registration state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRegistration {
    /// Whether a periodic wake-up is registered with the platform.
    pub active: bool,
    /// Identity most recently delivered to the worker.
    pub last_sent_user_id: Option<String>,
}

/// Result of a [`send_identity`](BackgroundSyncCoordinator::send_identity) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityDelivery {
    /// The worker accepted the message.
    Delivered,
    /// A newer identity message replaced this one before it resolved.
    Superseded,
}

#[derive(Default)]
struct IdentityState {
    generation: u64,
    in_flight: Option<AbortHandle>,
    /// `None` until an identity has been delivered at least once.
    last_sent: Option<Option<String>>,
}

pub struct BackgroundSyncCoordinator {
    peer: Arc<dyn WorkerPeer>,
    tag: String,
    min_interval: Duration,
    /// `Some(active)` once registration was attempted with a cacheable outcome.
    periodic: tokio::sync::Mutex<Option<bool>>,
    /// Outcome of the last completed registration attempt.
    periodic_active: AtomicBool,
    identity: Mutex<IdentityState>,
}

impl BackgroundSyncCoordinator {
    pub fn new(peer: Arc<dyn WorkerPeer>, config: &SyncConfig) -> Self {
        Self {
            peer,
            tag: config.tag.clone(),
            min_interval: config.min_interval(),
            periodic: tokio::sync::Mutex::new(None),
            periodic_active: AtomicBool::new(false),
            identity: Mutex::new(IdentityState::default()),
        }
    }

    /// Register the periodic wake-up, once.
    ///
    /// Repeated and concurrent calls share the first registration. A
    /// platform without periodic sync is logged and yields an inactive
    /// registration; identity sync and immediate checks keep working.
    pub async fn register_periodic_sync(&self) -> SyncRegistration {
        let mut periodic = self.periodic.lock().await;
        if let Some(active) = *periodic {
            return self.snapshot(active);
        }

        let active = match self.try_register().await {
            Ok(()) => {
                info!(tag = %self.tag, "periodic sync registered");
                *periodic = Some(true);
                true
            }
            Err(NotifyError::CapabilityUnavailable(reason)) => {
                info!(tag = %self.tag, reason = %reason, "periodic sync unavailable on this platform");
                *periodic = Some(false);
                false
            }
            Err(e) => {
                warn!(tag = %self.tag, error = %e, "periodic sync registration failed");
                false
            }
        };
        self.periodic_active.store(active, Ordering::SeqCst);
        self.snapshot(active)
    }

    async fn try_register(&self) -> Result<()> {
        let tags = self.peer.periodic_sync_tags().await?;
        if tags.iter().any(|t| t == &self.tag) {
            debug!(tag = %self.tag, "periodic sync already registered by worker");
            return Ok(());
        }
        self.peer
            .register_periodic_sync(&self.tag, self.min_interval)
            .await
    }

    /// Tell the worker which user it acts for (`None` after logout).
    ///
    /// Only one identity message is in flight at a time: a call made while
    /// an earlier one is still unresolved aborts the earlier one, which then
    /// reports [`IdentityDelivery::Superseded`].
    ///
    /// # Errors
    ///
    /// Returns the peer's error (typically [`NotifyError::WorkerUnavailable`]).
    pub async fn send_identity(&self, user_id: Option<String>) -> Result<IdentityDelivery> {
        let (generation, handle) = {
            let mut state = self.identity.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = state.in_flight.take() {
                debug!("superseding in-flight identity message");
                previous.abort();
            }
            state.generation += 1;

            let peer = Arc::clone(&self.peer);
            let message = WorkerMessage::SetIdentity {
                user_id: user_id.clone(),
            };
            let handle = tokio::spawn(async move { peer.post(message).await });
            state.in_flight = Some(handle.abort_handle());
            (state.generation, handle)
        };

        let outcome = handle.await;

        let mut state = self.identity.lock().unwrap_or_else(|e| e.into_inner());
        let current = state.generation == generation;
        if current {
            state.in_flight = None;
        }

        match outcome {
            Ok(Ok(())) => {
                if current {
                    debug!(user = ?user_id, "identity delivered to worker");
                    state.last_sent = Some(user_id);
                }
                Ok(IdentityDelivery::Delivered)
            }
            Ok(Err(e)) => Err(e),
            Err(join) if join.is_cancelled() => Ok(IdentityDelivery::Superseded),
            Err(join) => Err(NotifyError::Worker(format!(
                "identity delivery task failed: {join}"
            ))),
        }
    }

    /// Identity last delivered, or `None` if none was ever delivered.
    pub fn last_sent_identity(&self) -> Option<Option<String>> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_sent
            .clone()
    }

    /// Whether the worker's view of the user differs from `current`.
    ///
    /// Nothing delivered yet counts as stale once somebody is signed in.
    pub fn identity_is_stale(&self, current: Option<&str>) -> bool {
        match self.last_sent_identity() {
            Some(sent) => sent.as_deref() != current,
            None => current.is_some(),
        }
    }

    /// Whether the worker was explicitly told about a different user than
    /// `current` and is still acting for them.
    pub fn identity_conflicts(&self, current: Option<&str>) -> bool {
        self.last_sent_identity()
            .is_some_and(|sent| sent.as_deref() != current)
    }

    /// Ask the worker to run its check now.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::WorkerUnavailable`] when no worker controls the
    /// page, or the peer's error if the post fails.
    pub async fn request_immediate_check(&self) -> Result<()> {
        if !self.peer.has_controller() {
            return Err(NotifyError::WorkerUnavailable);
        }
        self.peer.post(WorkerMessage::CheckNow).await
    }

    /// Current registration snapshot.
    ///
    /// `active` reflects the last completed registration attempt; an attempt
    /// still in progress is not reported until it finishes.
    pub fn registration(&self) -> SyncRegistration {
        self.snapshot(self.periodic_active.load(Ordering::SeqCst))
    }

    /// Abort any in-flight identity message.
    pub fn shutdown(&self) {
        let mut state = self.identity.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(in_flight) = state.in_flight.take() {
            in_flight.abort();
        }
    }

    fn snapshot(&self, active: bool) -> SyncRegistration {
        SyncRegistration {
            active,
            last_sent_user_id: self.last_sent_identity().flatten(),
        }
    }
}
