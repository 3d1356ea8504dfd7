//! In-process platform implementations.
//!
//! [`LoopbackWorker`] stands in for the host's worker runtime: posted
//! messages land in a [`WorkerInbox`], installs and controller changes are
//! driven by hand, and reloads are counted instead of performed.

use crate::error::{NotifyError, Result};
use crate::orchestrator::NotificationSurface;
use crate::permissions::{PermissionPlatform, PermissionState};
use crate::store::NotificationRecord;
use crate::worker::{WorkerEvent, WorkerHost, WorkerMessage, WorkerPeer, WorkerVersionToken};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Permission platform with a scripted answer.
pub struct StaticPermissionPlatform {
    supported: bool,
    answer: Mutex<PermissionState>,
    current: Mutex<PermissionState>,
    prompts: AtomicUsize,
}

impl StaticPermissionPlatform {
    /// Undecided platform whose prompt resolves to `answer`.
    pub fn answering(answer: PermissionState) -> Arc<Self> {
        Arc::new(Self {
            supported: true,
            answer: Mutex::new(answer),
            current: Mutex::new(PermissionState::Unrequested),
            prompts: AtomicUsize::new(0),
        })
    }

    /// Platform where the user already decided `state` in an earlier session.
    pub fn decided(state: PermissionState) -> Arc<Self> {
        let platform = Self::answering(state);
        *platform.current.lock().unwrap_or_else(|e| e.into_inner()) = state;
        platform
    }

    /// Platform without notification support.
    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self {
            supported: false,
            answer: Mutex::new(PermissionState::Denied),
            current: Mutex::new(PermissionState::Denied),
            prompts: AtomicUsize::new(0),
        })
    }

    /// Number of native prompts shown so far.
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn set_answer(&self, answer: PermissionState) {
        *self.answer.lock().unwrap_or_else(|e| e.into_inner()) = answer;
    }
}

#[async_trait]
impl PermissionPlatform for StaticPermissionPlatform {
    fn status(&self) -> Result<PermissionState> {
        if !self.supported {
            return Err(NotifyError::CapabilityUnavailable(
                "notifications unsupported".to_owned(),
            ));
        }
        Ok(*self.current.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn request_permission(&self) -> Result<PermissionState> {
        if !self.supported {
            return Err(NotifyError::CapabilityUnavailable(
                "notifications unsupported".to_owned(),
            ));
        }
        self.prompts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let answer = *self.answer.lock().unwrap_or_else(|e| e.into_inner());
        if answer.is_settled() {
            *self.current.lock().unwrap_or_else(|e| e.into_inner()) = answer;
        }
        Ok(answer)
    }
}

/// One observable interaction with the loopback worker, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCall {
    PeriodicSyncRegistered { tag: String },
    Posted(WorkerMessage),
}

/// Callback run synchronously when a message reaches the worker.
pub type PostObserver = Box<dyn Fn(&WorkerMessage) + Send + Sync>;

#[derive(Default)]
struct LoopbackState {
    controller: Option<WorkerVersionToken>,
    live_registrations: usize,
    register_calls: usize,
    registration_failure: Option<String>,
    periodic_unsupported: bool,
    periodic_tags: Vec<String>,
    caches: BTreeSet<String>,
    calls: Vec<WorkerCall>,
}

/// Receiving end of messages posted to a [`LoopbackWorker`].
pub struct WorkerInbox {
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl WorkerInbox {
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.rx.recv().await
    }

    /// Every message received so far, without waiting.
    pub fn drain(&mut self) -> Vec<WorkerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            out.push(message);
        }
        out
    }
}

/// In-process worker runtime implementing both [`WorkerPeer`] and [`WorkerHost`].
pub struct LoopbackWorker {
    inbox_tx: mpsc::UnboundedSender<WorkerMessage>,
    state: Mutex<LoopbackState>,
    events: broadcast::Sender<WorkerEvent>,
    reloads: AtomicUsize,
    observer: Mutex<Option<PostObserver>>,
}

impl LoopbackWorker {
    /// A worker with no registration and no controller.
    pub fn new() -> (Arc<Self>, WorkerInbox) {
        let (inbox_tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(32);
        let worker = Arc::new(Self {
            inbox_tx,
            state: Mutex::new(LoopbackState::default()),
            events,
            reloads: AtomicUsize::new(0),
            observer: Mutex::new(None),
        });
        (worker, WorkerInbox { rx })
    }

    /// A worker that already controls the page as `version`.
    pub fn controlling(version: &str) -> (Arc<Self>, WorkerInbox) {
        let (worker, inbox) = Self::new();
        {
            let mut state = worker.lock_state();
            state.controller = Some(WorkerVersionToken::new(version));
            state.live_registrations = 1;
        }
        (worker, inbox)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Announce that `version` was downloaded and installed.
    pub fn install(&self, version: WorkerVersionToken) {
        let _ = self.events.send(WorkerEvent::UpdateFound {
            version: version.clone(),
        });
        let _ = self.events.send(WorkerEvent::Installed { version });
    }

    /// Make `version` the controlling worker and announce the change.
    pub fn activate(&self, version: WorkerVersionToken) {
        {
            let mut state = self.lock_state();
            state.controller = Some(version.clone());
            state.live_registrations = state.live_registrations.max(1);
        }
        let _ = self.events.send(WorkerEvent::ControllerChange { version });
    }

    /// Whether a worker currently controls the page.
    pub fn is_controlled(&self) -> bool {
        self.lock_state().controller.is_some()
    }

    pub fn seed_cache(&self, name: &str) {
        self.lock_state().caches.insert(name.to_owned());
    }

    pub fn cache_list(&self) -> Vec<String> {
        self.lock_state().caches.iter().cloned().collect()
    }

    /// Number of `register` calls made by the page.
    pub fn registration_count(&self) -> usize {
        self.lock_state().register_calls
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Make every subsequent `register` call fail with `reason`.
    pub fn fail_registration(&self, reason: &str) {
        self.lock_state().registration_failure = Some(reason.to_owned());
    }

    pub fn set_periodic_sync_supported(&self, supported: bool) {
        self.lock_state().periodic_unsupported = !supported;
    }

    /// Interactions in the order they happened.
    pub fn calls(&self) -> Vec<WorkerCall> {
        self.lock_state().calls.clone()
    }

    /// Messages posted so far.
    pub fn posted(&self) -> Vec<WorkerMessage> {
        self.lock_state()
            .calls
            .iter()
            .filter_map(|c| match c {
                WorkerCall::Posted(m) => Some(m.clone()),
                WorkerCall::PeriodicSyncRegistered { .. } => None,
            })
            .collect()
    }

    /// Install a callback that sees each message as it is delivered.
    pub fn on_post(&self, observer: PostObserver) {
        *self.observer.lock().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl WorkerPeer for LoopbackWorker {
    fn has_controller(&self) -> bool {
        self.is_controlled()
    }

    async fn post(&self, message: WorkerMessage) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.controller.is_none() {
                return Err(NotifyError::WorkerUnavailable);
            }
            state.calls.push(WorkerCall::Posted(message.clone()));
        }
        if let Some(observer) = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            observer(&message);
        }
        // Nobody draining the inbox is not an error for a loopback.
        let _ = self.inbox_tx.send(message);
        Ok(())
    }

    async fn periodic_sync_tags(&self) -> Result<Vec<String>> {
        let state = self.lock_state();
        if state.periodic_unsupported {
            return Err(NotifyError::CapabilityUnavailable(
                "periodic sync unsupported".to_owned(),
            ));
        }
        Ok(state.periodic_tags.clone())
    }

    async fn register_periodic_sync(&self, tag: &str, _min_interval: Duration) -> Result<()> {
        let mut state = self.lock_state();
        if state.periodic_unsupported {
            return Err(NotifyError::CapabilityUnavailable(
                "periodic sync unsupported".to_owned(),
            ));
        }
        state.periodic_tags.push(tag.to_owned());
        state.calls.push(WorkerCall::PeriodicSyncRegistered {
            tag: tag.to_owned(),
        });
        Ok(())
    }

    fn subscribe_lifecycle(&self) -> broadcast::Receiver<WorkerEvent> {
        self.subscribe_events()
    }
}

#[async_trait]
impl WorkerHost for LoopbackWorker {
    fn has_controller(&self) -> bool {
        self.is_controlled()
    }

    async fn register(&self, script_url: &str) -> Result<()> {
        let mut state = self.lock_state();
        state.register_calls += 1;
        if let Some(reason) = &state.registration_failure {
            return Err(NotifyError::Worker(format!(
                "cannot register {script_url}: {reason}"
            )));
        }
        state.live_registrations = 1;
        Ok(())
    }

    async fn unregister_all(&self) -> Result<usize> {
        let mut state = self.lock_state();
        let removed = state.live_registrations;
        state.live_registrations = 0;
        state.periodic_tags.clear();
        Ok(removed)
    }

    async fn cache_names(&self) -> Result<Vec<String>> {
        Ok(self.cache_list())
    }

    async fn delete_cache(&self, name: &str) -> Result<bool> {
        Ok(self.lock_state().caches.remove(name))
    }

    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        tracing::info!("loopback page reload");
    }
}

/// Surface that logs and remembers every notification shown.
#[derive(Default)]
pub struct RecordingSurface {
    shown: Mutex<Vec<NotificationRecord>>,
}

impl RecordingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn shown(&self) -> Vec<NotificationRecord> {
        self.shown.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl NotificationSurface for RecordingSurface {
    fn show(&self, record: &NotificationRecord) -> Result<()> {
        tracing::info!(id = %record.id, tag = %record.tag, owner = %record.owner_user_id, "notification shown");
        self.shown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}
