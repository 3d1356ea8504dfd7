//! Top-level notification controller.
//!
//! ```text
//!            (delay)                 (granted)
//! Idle ──────────────▶ AwaitingPermissionDecision ──────────▶ ActiveMonitoring
//!  ▲                                                              │
//!  └───────────────────────── user switch ◀──────────────────────┘
//! ```
//!
//! The orchestrator runs as one tokio task and handles its inputs strictly in
//! order. Session signals and data-changed signals arrive through an
//! [`OrchestratorHandle`]; timers and the pending prompt are owned by the
//! task itself, so dropping the task releases all of them.
//!
//! A user switch purges the previous user's notifications before anything
//! else is done for the new user.

use crate::config::NotifyConfig;
use crate::error::{NotifyError, Result};
use crate::permissions::{PermissionNegotiator, PermissionState};
use crate::prompt::{PromptOutcome, PromptStrategy};
use crate::session::{SessionContext, UserContext, on_user_change};
use crate::store::{NotificationRecord, SharedNotificationStore};
use crate::sync::{BackgroundSyncCoordinator, IdentityDelivery};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tag of the notification shown right after permission is granted.
pub const PERMISSION_CONFIRMATION_TAG: &str = "notifications-enabled";

/// Shows notifications to the user. Content rendering is the host's job.
pub trait NotificationSurface: Send + Sync + 'static {
    fn show(&self, record: &NotificationRecord) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorPhase {
    #[default]
    Idle,
    AwaitingPermissionDecision,
    ActiveMonitoring,
}

impl fmt::Display for OrchestratorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::AwaitingPermissionDecision => "awaiting_permission_decision",
            Self::ActiveMonitoring => "active_monitoring",
        })
    }
}

/// Inputs from collaborators outside the subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Login, logout or session restore.
    UserChanged(UserContext),
    /// Server-visible business data changed.
    DataChanged,
}

/// Why a foreground check ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckReason {
    Activated,
    Periodic,
    DataChanged,
}

impl fmt::Display for CheckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Activated => "activated",
            Self::Periodic => "periodic",
            Self::DataChanged => "data_changed",
        })
    }
}

/// Collaborators the orchestrator drives.
pub struct OrchestratorParts {
    pub negotiator: Arc<PermissionNegotiator>,
    pub store: SharedNotificationStore,
    pub coordinator: Arc<BackgroundSyncCoordinator>,
    pub strategy: Arc<dyn PromptStrategy>,
    pub surface: Arc<dyn NotificationSurface>,
}

/// Cloneable handle used to feed signals into a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    signals: mpsc::UnboundedSender<SessionSignal>,
    phase: watch::Receiver<OrchestratorPhase>,
    cancel: CancellationToken,
}

impl OrchestratorHandle {
    /// Forward a session change from the auth gate.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Channel`] once the orchestrator has stopped.
    pub fn user_changed(&self, context: UserContext) -> Result<()> {
        self.send(SessionSignal::UserChanged(context))
    }

    /// Forward a data-changed broadcast from the data layer.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Channel`] once the orchestrator has stopped.
    pub fn data_changed(&self) -> Result<()> {
        self.send(SessionSignal::DataChanged)
    }

    fn send(&self, signal: SessionSignal) -> Result<()> {
        self.signals
            .send(signal)
            .map_err(|e| NotifyError::Channel(format!("orchestrator stopped: {e}")))
    }

    pub fn phase(&self) -> OrchestratorPhase {
        *self.phase.borrow()
    }

    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<OrchestratorPhase> {
        self.phase.clone()
    }

    /// Tear the orchestrator down. Timers and listeners are released and no
    /// further check or sync is scheduled.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct PendingPrompt {
    generation: u64,
    task: JoinHandle<PromptOutcome>,
}

enum Wake {
    Signal(SessionSignal),
    PromptTimer,
    MonitorTick,
    PromptResolved {
        generation: u64,
        outcome: std::result::Result<PromptOutcome, JoinError>,
    },
    Stop,
}

pub struct NotificationOrchestrator {
    parts: OrchestratorParts,
    session: SessionContext,
    prompt_delay: Duration,
    check_interval: Duration,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    phase_tx: watch::Sender<OrchestratorPhase>,
    cancel: CancellationToken,
    current_user: Option<String>,
    /// Bumped on every user change; stale prompt results are ignored.
    generation: u64,
    prompt_deadline: Option<Instant>,
    prompt: Option<PendingPrompt>,
    monitor: Option<Interval>,
}

impl NotificationOrchestrator {
    pub fn new(
        parts: OrchestratorParts,
        config: &NotifyConfig,
        session: SessionContext,
    ) -> (Self, OrchestratorHandle) {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(OrchestratorPhase::Idle);
        let cancel = CancellationToken::new();

        let orchestrator = Self {
            parts,
            session,
            prompt_delay: config.permission.prompt_delay(),
            check_interval: config.monitoring.check_interval(),
            signals,
            phase_tx,
            cancel: cancel.clone(),
            current_user: None,
            generation: 0,
            prompt_deadline: None,
            prompt: None,
            monitor: None,
        };
        let handle = OrchestratorHandle {
            signals: signals_tx,
            phase: phase_rx,
            cancel,
        };
        (orchestrator, handle)
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<SessionContext> {
        tokio::spawn(self.run())
    }

    /// Process inputs until shut down. Returns the session context so the
    /// caller decides when the session ends.
    pub async fn run(mut self) -> SessionContext {
        info!("notification orchestrator started");
        loop {
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Stop,
                signal = self.signals.recv() => match signal {
                    Some(signal) => Wake::Signal(signal),
                    None => Wake::Stop,
                },
                (generation, outcome) = poll_prompt(&mut self.prompt) => {
                    Wake::PromptResolved { generation, outcome }
                }
                () = sleep_until_opt(self.prompt_deadline) => Wake::PromptTimer,
                () = tick_opt(&mut self.monitor) => Wake::MonitorTick,
            };

            match wake {
                Wake::Stop => break,
                Wake::Signal(SessionSignal::UserChanged(context)) => {
                    self.on_user_changed(context.user_id).await;
                }
                Wake::Signal(SessionSignal::DataChanged) => self.on_data_changed().await,
                Wake::PromptTimer => self.on_prompt_timer().await,
                Wake::MonitorTick => self.run_check(CheckReason::Periodic).await,
                Wake::PromptResolved {
                    generation,
                    outcome,
                } => {
                    self.prompt = None;
                    match outcome {
                        Ok(outcome) => self.on_prompt_resolved(generation, outcome).await,
                        Err(e) => {
                            warn!(error = %e, "permission prompt task failed");
                            self.set_phase(OrchestratorPhase::Idle);
                        }
                    }
                }
            }
        }

        self.teardown().await;
        self.session
    }

    /// Release timers and the pending prompt, then settle every user change
    /// that was queued before shutdown so no purge or identity is lost.
    async fn teardown(&mut self) {
        self.prompt_deadline = None;
        self.monitor = None;
        self.abort_prompt();
        self.signals.close();

        while let Ok(signal) = self.signals.try_recv() {
            if let SessionSignal::UserChanged(context) = signal {
                if self.switch_user(context.user_id) {
                    self.push_identity(self.current_user.clone()).await;
                }
            }
        }

        self.parts.coordinator.shutdown();
        self.set_phase(OrchestratorPhase::Idle);
        info!("notification orchestrator stopped");
    }

    fn abort_prompt(&mut self) {
        if let Some(pending) = self.prompt.take() {
            debug!(generation = pending.generation, "abandoning pending permission prompt");
            pending.task.abort();
        }
    }

    async fn on_user_changed(&mut self, new_user: Option<String>) {
        if !self.switch_user(new_user) {
            return;
        }
        match self.current_user.clone() {
            None => {
                info!("user signed out");
                self.push_identity(None).await;
            }
            Some(user) => {
                info!(user = %user, "user signed in");
                self.evaluate_permission().await;
            }
        }
    }

    /// Purge the previous user's notifications and reset per-user state.
    /// Returns `false` when the signal names the user already signed in.
    fn switch_user(&mut self, new_user: Option<String>) -> bool {
        let old_user = self.current_user.take();
        if old_user == new_user {
            debug!(user = ?new_user, "session signal for the current user");
            self.current_user = new_user;
            return false;
        }

        // Purge before anything else happens for the new user. A restored
        // session still owns whatever its last known user left behind.
        let previous_owner = old_user
            .as_deref()
            .or(self.session.last_known_user())
            .map(str::to_owned);
        let mutation = on_user_change(previous_owner.as_deref(), new_user.as_deref());
        let removed = {
            let mut store = self.parts.store.lock().unwrap_or_else(|e| e.into_inner());
            mutation.apply(&mut store)
        };
        if removed > 0 {
            info!(removed, previous = ?previous_owner, "purged notifications of previous user");
        }

        self.generation += 1;
        self.prompt_deadline = None;
        self.monitor = None;
        self.abort_prompt();
        self.current_user = new_user.clone();
        self.session.set_last_known_user(new_user);
        self.set_phase(OrchestratorPhase::Idle);
        true
    }

    async fn evaluate_permission(&mut self) {
        let status = self.parts.negotiator.check_status();
        if status == PermissionState::Granted {
            self.enter_active_monitoring().await;
            return;
        }

        // Not monitoring yet: only correct a worker that still acts for
        // somebody else.
        if self
            .parts
            .coordinator
            .identity_conflicts(self.current_user.as_deref())
        {
            self.push_identity(self.current_user.clone()).await;
        }

        if status == PermissionState::Denied {
            debug!("notifications denied, not monitoring");
            return;
        }
        if self.session.has_declined() {
            debug!("user declined notifications this session, not prompting");
            return;
        }

        debug!(delay_ms = self.prompt_delay.as_millis() as u64, "arming permission prompt");
        self.prompt_deadline = Some(Instant::now() + self.prompt_delay);
    }

    async fn on_prompt_timer(&mut self) {
        self.prompt_deadline = None;
        if self.current_user.is_none() || self.session.has_declined() {
            return;
        }
        match self.parts.negotiator.check_status() {
            PermissionState::Unrequested => {}
            // Answered elsewhere while the timer ran.
            PermissionState::Granted => {
                self.enter_active_monitoring().await;
                return;
            }
            PermissionState::Denied => return,
        }

        self.set_phase(OrchestratorPhase::AwaitingPermissionDecision);
        let strategy = Arc::clone(&self.parts.strategy);
        let negotiator = Arc::clone(&self.parts.negotiator);
        self.prompt = Some(PendingPrompt {
            generation: self.generation,
            task: tokio::spawn(async move { strategy.prompt(&negotiator).await }),
        });
    }

    async fn on_prompt_resolved(&mut self, generation: u64, outcome: PromptOutcome) {
        if generation != self.generation {
            debug!(?outcome, "ignoring prompt result from a previous session");
            return;
        }

        match outcome {
            PromptOutcome::Granted => {
                self.confirm_grant();
                self.enter_active_monitoring().await;
            }
            PromptOutcome::Denied => {
                info!("notification permission denied");
                self.set_phase(OrchestratorPhase::Idle);
            }
            PromptOutcome::Declined => {
                info!("notification prompt declined for this session");
                self.session.mark_declined();
                self.set_phase(OrchestratorPhase::Idle);
            }
        }
    }

    /// Surface a confirmation notification right after the grant.
    fn confirm_grant(&self) {
        let Some(user) = self.current_user.as_deref() else {
            return;
        };
        let record = NotificationRecord::new(user, PERMISSION_CONFIRMATION_TAG);
        let added = {
            let mut store = self.parts.store.lock().unwrap_or_else(|e| e.into_inner());
            store.add_if_current(record.clone(), self.current_user.as_deref())
        };
        match added {
            Ok(true) => {
                if let Err(e) = self.parts.surface.show(&record) {
                    warn!(error = %e, "failed to show confirmation notification");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to record confirmation notification"),
        }
    }

    async fn enter_active_monitoring(&mut self) {
        if self.current_user.is_none() {
            return;
        }
        self.set_phase(OrchestratorPhase::ActiveMonitoring);

        let registration = self.parts.coordinator.register_periodic_sync().await;
        debug!(active = registration.active, "periodic sync registration");
        self.push_identity(self.current_user.clone()).await;
        self.run_check(CheckReason::Activated).await;

        let mut monitor =
            tokio::time::interval_at(Instant::now() + self.check_interval, self.check_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.monitor = Some(monitor);
        info!(
            user = ?self.current_user,
            interval_ms = self.check_interval.as_millis() as u64,
            "notification monitoring active"
        );
    }

    async fn on_data_changed(&mut self) {
        if *self.phase_tx.borrow() != OrchestratorPhase::ActiveMonitoring {
            debug!("data changed while not monitoring");
            return;
        }
        self.run_check(CheckReason::DataChanged).await;
    }

    async fn run_check(&self, reason: CheckReason) {
        // The worker may have taken control, or an earlier send failed,
        // since identity was last pushed.
        if self
            .parts
            .coordinator
            .identity_is_stale(self.current_user.as_deref())
        {
            self.push_identity(self.current_user.clone()).await;
        }
        match self.parts.coordinator.request_immediate_check().await {
            Ok(()) => debug!(%reason, "foreground check requested"),
            Err(NotifyError::WorkerUnavailable) => {
                debug!(%reason, "no controlling worker, skipping check");
            }
            Err(e) => warn!(%reason, error = %e, "foreground check failed"),
        }
    }

    async fn push_identity(&self, user_id: Option<String>) {
        match self.parts.coordinator.send_identity(user_id.clone()).await {
            Ok(IdentityDelivery::Delivered) => {}
            Ok(IdentityDelivery::Superseded) => debug!(user = ?user_id, "identity superseded"),
            Err(NotifyError::WorkerUnavailable) => {
                debug!(user = ?user_id, "no controlling worker for identity");
            }
            Err(e) => warn!(user = ?user_id, error = %e, "failed to send identity to worker"),
        }
    }

    fn set_phase(&self, phase: OrchestratorPhase) {
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            debug!(from = %current, to = %phase, "orchestrator phase");
            *current = phase;
            true
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn poll_prompt(
    prompt: &mut Option<PendingPrompt>,
) -> (u64, std::result::Result<PromptOutcome, JoinError>) {
    match prompt {
        Some(pending) => {
            let outcome = (&mut pending.task).await;
            (pending.generation, outcome)
        }
        None => std::future::pending().await,
    }
}
