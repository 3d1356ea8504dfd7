//! Install/update lifecycle of the long-lived worker.
//!
//! ```text
//! Unregistered → Registering → Active ⇄ UpdateAvailable → Updating
//! ```
//!
//! In production the worker is registered once at start. In development it
//! is torn down instead (registrations and caches purged) so live reload
//! always serves fresh code.
//!
//! The reload on controller change is guarded by a latch: only the first
//! controller change after a load that already had a controller reloads the
//! page, and never twice for the same worker version.

use crate::config::{DeploymentMode, WorkerConfig};
use crate::worker::{WorkerEvent, WorkerHost, WorkerVersionToken};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of the worker from the page's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unregistered,
    Registering,
    Active,
    UpdateAvailable,
    Updating,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Active => "active",
            Self::UpdateAvailable => "update_available",
            Self::Updating => "updating",
        })
    }
}

/// Events published for the surrounding UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The worker script was registered.
    Registered,
    /// Registration failed; the app keeps working without background delivery.
    RegistrationFailed { reason: String },
    /// Development mode removed existing registrations and caches.
    DevelopmentReset(RefreshSummary),
    /// A new version is installed and waiting. The UI may offer a refresh.
    UpdateAvailable { version: WorkerVersionToken },
    /// The page is reloading to pick up a new controller.
    Reloading { version: WorkerVersionToken },
}

/// Outcome of [`WorkerLifecycleController::force_refresh_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub unregistered: usize,
    pub caches_deleted: usize,
}

pub struct WorkerLifecycleController {
    host: Arc<dyn WorkerHost>,
    mode: DeploymentMode,
    script_url: String,
    state: WorkerState,
    started: bool,
    had_controller_at_load: bool,
    reload_armed: bool,
    reloaded_versions: HashSet<WorkerVersionToken>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl WorkerLifecycleController {
    /// Create a controller for the current page load.
    ///
    /// Whether a controller is present is sampled here, once.
    pub fn new(host: Arc<dyn WorkerHost>, config: &WorkerConfig) -> Self {
        let had_controller_at_load = host.has_controller();
        let (events, _) = broadcast::channel(16);
        Self {
            host,
            mode: config.deployment,
            script_url: config.script_url.clone(),
            state: if had_controller_at_load {
                WorkerState::Active
            } else {
                WorkerState::Unregistered
            },
            started: false,
            had_controller_at_load,
            reload_armed: true,
            reloaded_versions: HashSet::new(),
            events,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Whether a controller change can still trigger a reload on this page.
    pub fn is_reload_armed(&self) -> bool {
        self.reload_armed && self.had_controller_at_load
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Run the start-up action for the configured mode. Only the first call
    /// does anything.
    pub async fn start(&mut self) {
        if self.started {
            debug!("worker lifecycle already started");
            return;
        }
        self.started = true;

        match self.mode {
            DeploymentMode::Production => self.register().await,
            DeploymentMode::Development => {
                let summary = self.force_refresh_all().await;
                self.state = WorkerState::Unregistered;
                info!(
                    unregistered = summary.unregistered,
                    caches_deleted = summary.caches_deleted,
                    "development mode: worker removed"
                );
                self.emit(LifecycleEvent::DevelopmentReset(summary));
            }
        }
    }

    async fn register(&mut self) {
        let previous = self.state;
        self.state = WorkerState::Registering;
        match self.host.register(&self.script_url).await {
            Ok(()) => {
                info!(script = %self.script_url, "worker registered");
                self.state = WorkerState::Active;
                self.emit(LifecycleEvent::Registered);
            }
            Err(e) => {
                warn!(script = %self.script_url, error = %e, "worker registration failed");
                self.state = if previous == WorkerState::Active {
                    previous
                } else {
                    WorkerState::Unregistered
                };
                self.emit(LifecycleEvent::RegistrationFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// React to one installation event from the host.
    pub fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::UpdateFound { version } => {
                debug!(%version, "worker version installing");
            }
            WorkerEvent::Installed { version } => self.on_installed(version),
            WorkerEvent::ControllerChange { version } => self.on_controller_change(version),
        }
    }

    fn on_installed(&mut self, version: WorkerVersionToken) {
        if !self.host.has_controller() {
            debug!(%version, "first worker install, nothing to update");
            return;
        }
        if self.state == WorkerState::Updating {
            return;
        }
        info!(%version, "worker update available");
        self.state = WorkerState::UpdateAvailable;
        self.emit(LifecycleEvent::UpdateAvailable { version });
    }

    fn on_controller_change(&mut self, version: WorkerVersionToken) {
        if !self.had_controller_at_load {
            debug!(%version, "controller installed on a fresh page, not reloading");
            self.state = WorkerState::Active;
            return;
        }
        if !self.reload_armed || self.reloaded_versions.contains(&version) {
            debug!(%version, "reload latch already released");
            return;
        }

        self.reload_armed = false;
        self.reloaded_versions.insert(version.clone());
        self.state = WorkerState::Updating;
        info!(%version, "new worker took control, reloading");
        self.emit(LifecycleEvent::Reloading { version });
        self.host.reload();
    }

    /// Remove every worker registration and delete every cache.
    ///
    /// Safe to call repeatedly and when nothing is registered. Host failures
    /// are logged and skipped.
    pub async fn force_refresh_all(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();

        match self.host.unregister_all().await {
            Ok(n) => summary.unregistered = n,
            Err(e) => warn!(error = %e, "failed to unregister workers"),
        }

        let names = match self.host.cache_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to list caches");
                Vec::new()
            }
        };
        for name in names {
            match self.host.delete_cache(&name).await {
                Ok(true) => summary.caches_deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(cache = %name, error = %e, "failed to delete cache"),
            }
        }
        summary
    }

    /// Start, then follow installation events until cancelled or the event
    /// source closes.
    pub fn run(
        mut self,
        mut worker_events: broadcast::Receiver<WorkerEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.start().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("worker lifecycle cancelled");
                        break;
                    }
                    received = worker_events.recv() => match received {
                        Ok(event) => self.handle_event(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "worker lifecycle lagged behind events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
