//! Notification permission negotiation.
//!
//! [`PermissionNegotiator`] wraps a [`PermissionPlatform`] (the host's native
//! permission primitive) and guarantees that at most one native prompt is on
//! screen at a time: concurrent callers of [`PermissionNegotiator::request`]
//! all await the same pending result.
//!
//! A platform without notification support is not an error here. Its status
//! reads as [`PermissionState::Denied`] and requests resolve to the same.

use crate::error::{NotifyError, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Notification permission as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    /// The user has not been asked yet (or dismissed the prompt).
    #[default]
    Unrequested,
    /// Notifications may be shown.
    Granted,
    /// The user (or platform policy) refused.
    Denied,
}

impl PermissionState {
    /// Whether this state is a final answer from the user.
    #[must_use]
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Unrequested)
    }
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unrequested => "unrequested",
            Self::Granted => "granted",
            Self::Denied => "denied",
        })
    }
}

/// The host's native notification permission primitive.
#[async_trait]
pub trait PermissionPlatform: Send + Sync + 'static {
    /// Current grant state without prompting.
    ///
    /// Returns [`NotifyError::CapabilityUnavailable`] when the platform has no
    /// notification support at all.
    fn status(&self) -> Result<PermissionState>;

    /// Show the native prompt and resolve with the user's answer.
    async fn request_permission(&self) -> Result<PermissionState>;
}

type PendingRequest = Shared<BoxFuture<'static, PermissionState>>;

/// How often to look again while the platform shows a prompt it did not
/// receive from us.
const IN_FLIGHT_POLL: Duration = Duration::from_millis(250);

/// Process-wide permission negotiator.
///
/// Share one instance behind an `Arc`; every clone observes the same pending
/// prompt and the same settled answer.
pub struct PermissionNegotiator {
    platform: Arc<dyn PermissionPlatform>,
    /// Last explicit answer obtained through [`request`](Self::request).
    settled: Mutex<Option<PermissionState>>,
    pending: Mutex<Option<PendingRequest>>,
}

impl PermissionNegotiator {
    pub fn new(platform: Arc<dyn PermissionPlatform>) -> Self {
        Self {
            platform,
            settled: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Current permission state. Never prompts and never mutates.
    ///
    /// An explicit answer obtained earlier in this process is not regressed
    /// to [`PermissionState::Unrequested`] by a platform that forgets it.
    pub fn check_status(&self) -> PermissionState {
        let reported = match self.platform.status() {
            Ok(state) => state,
            Err(NotifyError::CapabilityUnavailable(reason)) => {
                debug!(reason = %reason, "notifications unsupported, treating as denied");
                return PermissionState::Denied;
            }
            Err(e) => {
                warn!(error = %e, "permission status query failed");
                PermissionState::Unrequested
            }
        };

        if reported.is_settled() {
            return reported;
        }
        self.settled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(reported)
    }

    /// Whether a native prompt is currently pending.
    pub fn is_request_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Ask the user for permission.
    ///
    /// Concurrent callers share a single native prompt and all receive its
    /// result. Never fails: platform errors are logged and collapse to the
    /// best known state.
    pub async fn request(&self) -> PermissionState {
        if matches!(
            self.platform.status(),
            Err(NotifyError::CapabilityUnavailable(_))
        ) {
            return PermissionState::Denied;
        }

        let request = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.as_ref() {
                Some(existing) => {
                    debug!("permission prompt already pending, joining it");
                    existing.clone()
                }
                None => {
                    let request = self.start_request();
                    *pending = Some(request.clone());
                    request
                }
            }
        };

        let state = request.clone().await;

        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.as_ref().is_some_and(|p| p.ptr_eq(&request)) {
                *pending = None;
            }
        }

        if state.is_settled() {
            let mut settled = self.settled.lock().unwrap_or_else(|e| e.into_inner());
            if *settled != Some(state) {
                info!(%state, "notification permission settled");
            }
            *settled = Some(state);
        }
        state
    }

    fn start_request(&self) -> PendingRequest {
        let platform = Arc::clone(&self.platform);
        async move {
            loop {
                match platform.request_permission().await {
                    Ok(state) => return state,
                    Err(NotifyError::CapabilityUnavailable(_)) => return PermissionState::Denied,
                    Err(NotifyError::PermissionRequestInFlight) => {
                        // Another prompt is on screen. Its answer is ours too.
                        debug!("platform reports a prompt already on screen, waiting for it");
                        tokio::time::sleep(IN_FLIGHT_POLL).await;
                        if let Ok(state) = platform.status() {
                            if state.is_settled() {
                                return state;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "permission request failed");
                        return platform.status().unwrap_or(PermissionState::Denied);
                    }
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl fmt::Debug for PermissionNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionNegotiator")
            .field("settled", &self.settled)
            .field("pending", &self.is_request_pending())
            .finish_non_exhaustive()
    }
}
