//! Integration tests: orchestrator behavior across login, logout and user
//! switches, driven against the loopback worker with a paused clock.
//!
//! One time unit is one second here: the prompt delay is 3 s and the
//! periodic check interval 15 s.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use shelfwatch::config::NotifyConfig;
use shelfwatch::orchestrator::{
    NotificationOrchestrator, OrchestratorHandle, OrchestratorParts, OrchestratorPhase,
    PERMISSION_CONFIRMATION_TAG,
};
use shelfwatch::permissions::{PermissionNegotiator, PermissionState};
use shelfwatch::platform::stub::{
    LoopbackWorker, RecordingSurface, StaticPermissionPlatform, WorkerCall, WorkerInbox,
};
use shelfwatch::prompt::{ModalPresenter, ModalPrompt, NativePrompt, PromptStrategy};
use shelfwatch::session::{SessionContext, UserContext};
use shelfwatch::store::{NotificationRecord, NotificationStore, SharedNotificationStore};
use shelfwatch::sync::BackgroundSyncCoordinator;
use shelfwatch::worker::{WorkerMessage, WorkerPeer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    handle: OrchestratorHandle,
    task: JoinHandle<SessionContext>,
    worker: Arc<LoopbackWorker>,
    _inbox: WorkerInbox,
    platform: Arc<StaticPermissionPlatform>,
    store: SharedNotificationStore,
    surface: Arc<RecordingSurface>,
}

fn test_config() -> NotifyConfig {
    let mut config = NotifyConfig::default();
    config.permission.prompt_delay_ms = 3_000;
    config.monitoring.check_interval_ms = 15_000;
    config
}

fn start(
    platform: Arc<StaticPermissionPlatform>,
    worker: (Arc<LoopbackWorker>, WorkerInbox),
    store: SharedNotificationStore,
    session: SessionContext,
    strategy: Arc<dyn PromptStrategy>,
) -> Harness {
    let (worker, inbox) = worker;
    let config = test_config();
    let surface = RecordingSurface::new();
    let parts = OrchestratorParts {
        negotiator: Arc::new(PermissionNegotiator::new(platform.clone())),
        store: Arc::clone(&store),
        coordinator: Arc::new(BackgroundSyncCoordinator::new(
            Arc::clone(&worker) as Arc<dyn WorkerPeer>,
            &config.sync,
        )),
        strategy,
        surface: surface.clone(),
    };
    let (orchestrator, handle) = NotificationOrchestrator::new(parts, &config, session);
    Harness {
        handle,
        task: orchestrator.spawn(),
        worker,
        _inbox: inbox,
        platform,
        store,
        surface,
    }
}

fn harness(platform: Arc<StaticPermissionPlatform>) -> Harness {
    start(
        platform,
        LoopbackWorker::controlling("v1"),
        NotificationStore::default_shared(),
        SessionContext::new(),
        Arc::new(NativePrompt),
    )
}

/// Let spawned tasks drain their ready work without advancing the clock.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

fn login(h: &Harness, user: &str) {
    h.handle.user_changed(UserContext::signed_in(user)).unwrap();
}

fn logout(h: &Harness) {
    h.handle.user_changed(UserContext::signed_out()).unwrap();
}

fn check_count(worker: &LoopbackWorker) -> usize {
    worker
        .posted()
        .iter()
        .filter(|m| **m == WorkerMessage::CheckNow)
        .count()
}

fn identity(user: Option<&str>) -> WorkerMessage {
    WorkerMessage::SetIdentity {
        user_id: user.map(str::to_owned),
    }
}

fn add_records(store: &SharedNotificationStore, user: &str, tags: &[&str]) {
    let mut store = store.lock().unwrap();
    for tag in tags {
        store.add(NotificationRecord::new(user, *tag)).unwrap();
    }
}

/// Record `count_for_user(watched)` every time `trigger` reaches the worker.
fn watch_store_on(
    h: &Harness,
    trigger: WorkerMessage,
    watched: &'static str,
) -> Arc<Mutex<Vec<usize>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&h.store);
    let sink = Arc::clone(&seen);
    h.worker.on_post(Box::new(move |message| {
        if *message == trigger {
            let count = store.lock().unwrap().count_for_user(watched);
            sink.lock().unwrap().push(count);
        }
    }));
    seen
}

// ---------------------------------------------------------------------------
// Permission flow
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn alice_is_prompted_once_after_delay_then_monitored() {
    let h = harness(StaticPermissionPlatform::answering(PermissionState::Granted));

    login(&h, "alice");
    settle().await;
    assert_eq!(h.handle.phase(), OrchestratorPhase::Idle);

    advance(2_999).await;
    assert_eq!(h.platform.prompt_count(), 0, "prompt must wait for the delay");

    advance(2).await;
    assert_eq!(h.platform.prompt_count(), 1);
    assert_eq!(h.handle.phase(), OrchestratorPhase::ActiveMonitoring);
    assert_eq!(
        h.worker.calls(),
        vec![
            WorkerCall::PeriodicSyncRegistered {
                tag: "inventory-check".to_owned()
            },
            WorkerCall::Posted(identity(Some("alice"))),
            WorkerCall::Posted(WorkerMessage::CheckNow),
        ]
    );

    let shown = h.surface.shown();
    assert_eq!(shown.len(), 1, "grant is confirmed with one notification");
    assert_eq!(shown[0].tag, PERMISSION_CONFIRMATION_TAG);
    assert_eq!(shown[0].owner_user_id, "alice");

    advance(60_000).await;
    assert_eq!(h.platform.prompt_count(), 1, "no second prompt");
}

#[tokio::test(start_paused = true)]
async fn granted_at_start_skips_the_delay() {
    let h = harness(StaticPermissionPlatform::decided(PermissionState::Granted));

    login(&h, "alice");
    settle().await;

    assert_eq!(h.handle.phase(), OrchestratorPhase::ActiveMonitoring);
    assert_eq!(h.platform.prompt_count(), 0);
    assert_eq!(check_count(&h.worker), 1);
    assert!(h.surface.shown().is_empty(), "no confirmation without a fresh grant");
}

#[tokio::test(start_paused = true)]
async fn denied_never_monitors() {
    let h = harness(StaticPermissionPlatform::decided(PermissionState::Denied));

    login(&h, "alice");
    advance(30_000).await;

    assert_eq!(h.handle.phase(), OrchestratorPhase::Idle);
    assert_eq!(h.platform.prompt_count(), 0);
    assert!(h.worker.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsupported_platform_behaves_as_denied() {
    let h = harness(StaticPermissionPlatform::unsupported());

    login(&h, "alice");
    advance(30_000).await;

    assert_eq!(h.handle.phase(), OrchestratorPhase::Idle);
    assert!(h.worker.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn prompt_denial_returns_to_idle() {
    let h = harness(StaticPermissionPlatform::answering(PermissionState::Denied));

    login(&h, "alice");
    advance(3_100).await;

    assert_eq!(h.platform.prompt_count(), 1);
    assert_eq!(h.handle.phase(), OrchestratorPhase::Idle);
    assert_eq!(check_count(&h.worker), 0);
}

#[tokio::test(start_paused = true)]
async fn dismissed_prompt_is_not_repeated_this_session() {
    let h = harness(StaticPermissionPlatform::answering(
        PermissionState::Unrequested,
    ));

    login(&h, "alice");
    advance(3_100).await;
    assert_eq!(h.platform.prompt_count(), 1);

    for _ in 0..3 {
        logout(&h);
        settle().await;
        login(&h, "alice");
        advance(10_000).await;
    }
    assert_eq!(h.platform.prompt_count(), 1);
    assert_eq!(h.handle.phase(), OrchestratorPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn declined_session_never_arms_the_prompt() {
    let mut session = SessionContext::new();
    session.mark_declined();
    let h = start(
        StaticPermissionPlatform::answering(PermissionState::Granted),
        LoopbackWorker::controlling("v1"),
        NotificationStore::default_shared(),
        session,
        Arc::new(NativePrompt),
    );

    login(&h, "alice");
    advance(10_000).await;
    login(&h, "bob");
    advance(10_000).await;

    assert_eq!(h.platform.prompt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn user_switch_cancels_pending_prompt_timer() {
    let h = harness(StaticPermissionPlatform::answering(PermissionState::Granted));

    login(&h, "alice");
    advance(1_000).await;
    login(&h, "bob");

    // alice's timer would have fired at 3 s.
    advance(2_500).await;
    assert_eq!(h.platform.prompt_count(), 0);

    // bob's fires at 4 s.
    advance(600).await;
    assert_eq!(h.platform.prompt_count(), 1);
    assert!(h.worker.posted().contains(&identity(Some("bob"))));
    assert!(!h.worker.posted().contains(&identity(Some("alice"))));
}

#[tokio::test(start_paused = true)]
async fn logout_before_delay_issues_no_prompt() {
    let h = harness(StaticPermissionPlatform::answering(PermissionState::Granted));

    login(&h, "alice");
    advance(2_000).await;
    logout(&h);
    advance(30_000).await;

    assert_eq!(h.platform.prompt_count(), 0);
}

struct GatedModal {
    open: Notify,
}

#[async_trait]
impl ModalPresenter for GatedModal {
    async fn confirm(&self) -> bool {
        self.open.notified().await;
        true
    }
}

#[tokio::test(start_paused = true)]
async fn prompt_answered_after_logout_does_not_revive_old_session() {
    let modal = Arc::new(GatedModal {
        open: Notify::new(),
    });
    let h = start(
        StaticPermissionPlatform::answering(PermissionState::Granted),
        LoopbackWorker::controlling("v1"),
        NotificationStore::default_shared(),
        SessionContext::new(),
        Arc::new(ModalPrompt::new(modal.clone())),
    );

    login(&h, "alice");
    advance(3_100).await;
    assert_eq!(
        h.handle.phase(),
        OrchestratorPhase::AwaitingPermissionDecision
    );

    logout(&h);
    settle().await;
    modal.open.notify_one();
    settle().await;

    assert_eq!(h.handle.phase(), OrchestratorPhase::Idle);
    assert_eq!(check_count(&h.worker), 0);
    assert!(h.surface.shown().is_empty());
    assert!(!h.worker.posted().contains(&identity(Some("alice"))));
}

// ---------------------------------------------------------------------------
// Purge ordering
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn logout_purges_records_before_identity_is_cleared() {
    let h = harness(StaticPermissionPlatform::decided(PermissionState::Granted));
    login(&h, "alice");
    settle().await;
    add_records(&h.store, "alice", &["low-stock", "daily-sales"]);
    let seen = watch_store_on(&h, identity(None), "alice");

    logout(&h);
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![0]);
    assert!(h.store.lock().unwrap().is_empty());
    assert_eq!(h.worker.posted().last(), Some(&identity(None)));
    assert_eq!(h.handle.phase(), OrchestratorPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn switch_purges_previous_user_before_new_identity() {
    let h = harness(StaticPermissionPlatform::decided(PermissionState::Granted));
    login(&h, "alice");
    settle().await;
    add_records(&h.store, "alice", &["low-stock", "reorder"]);
    let seen = watch_store_on(&h, identity(Some("bob")), "alice");

    login(&h, "bob");
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![0]);
    assert_eq!(h.handle.phase(), OrchestratorPhase::ActiveMonitoring);
    assert_eq!(h.store.lock().unwrap().count_for_user("alice"), 0);
}

#[tokio::test(start_paused = true)]
async fn logout_queued_before_shutdown_still_purges_and_clears_identity() {
    let h = harness(StaticPermissionPlatform::decided(PermissionState::Granted));
    login(&h, "alice");
    settle().await;
    add_records(&h.store, "alice", &["low-stock", "reorder"]);

    logout(&h);
    h.handle.shutdown();
    let session = h.task.await.unwrap();

    assert_eq!(h.worker.posted().last(), Some(&identity(None)));
    assert!(h.store.lock().unwrap().is_empty());
    assert_eq!(session.last_known_user(), None);
}

#[tokio::test(start_paused = true)]
async fn restored_session_purges_last_known_users_records() {
    let store = NotificationStore::default_shared();
    add_records(&store, "alice", &["low-stock"]);
    let h = start(
        StaticPermissionPlatform::decided(PermissionState::Granted),
        LoopbackWorker::controlling("v1"),
        Arc::clone(&store),
        SessionContext::restored(Some("alice".to_owned())),
        Arc::new(NativePrompt),
    );

    login(&h, "bob");
    settle().await;

    assert_eq!(store.lock().unwrap().count_for_user("alice"), 0);
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn data_changes_check_without_moving_the_periodic_schedule() {
    let h = harness(StaticPermissionPlatform::decided(PermissionState::Granted));
    login(&h, "alice");
    settle().await;
    assert_eq!(check_count(&h.worker), 1);

    advance(5_000).await;
    h.handle.data_changed().unwrap();
    advance(500).await;
    h.handle.data_changed().unwrap();
    settle().await;
    assert_eq!(check_count(&h.worker), 3, "each signal checks immediately");

    advance(9_400).await; // t = 14.9 s
    assert_eq!(check_count(&h.worker), 3);
    advance(200).await; // t = 15.1 s
    assert_eq!(check_count(&h.worker), 4, "periodic check still due at 15 s");
    advance(15_000).await; // t = 30.1 s
    assert_eq!(check_count(&h.worker), 5);
}

#[tokio::test(start_paused = true)]
async fn data_change_outside_monitoring_is_ignored() {
    let h = harness(StaticPermissionPlatform::answering(PermissionState::Granted));
    login(&h, "alice");
    settle().await;

    h.handle.data_changed().unwrap();
    settle().await;
    assert_eq!(check_count(&h.worker), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_worker_does_not_block_monitoring() {
    let h = start(
        StaticPermissionPlatform::decided(PermissionState::Granted),
        LoopbackWorker::new(),
        NotificationStore::default_shared(),
        SessionContext::new(),
        Arc::new(NativePrompt),
    );

    login(&h, "alice");
    settle().await;
    h.handle.data_changed().unwrap();
    advance(16_000).await;

    assert_eq!(h.handle.phase(), OrchestratorPhase::ActiveMonitoring);
    assert!(h.worker.posted().is_empty());
    assert_eq!(
        h.worker.calls(),
        vec![WorkerCall::PeriodicSyncRegistered {
            tag: "inventory-check".to_owned()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn worker_taking_control_late_learns_identity_before_checks() {
    let h = start(
        StaticPermissionPlatform::decided(PermissionState::Granted),
        LoopbackWorker::new(),
        NotificationStore::default_shared(),
        SessionContext::new(),
        Arc::new(NativePrompt),
    );
    login(&h, "alice");
    settle().await;
    assert!(h.worker.posted().is_empty());

    h.worker.activate(shelfwatch::worker::WorkerVersionToken::new("v1"));
    h.handle.data_changed().unwrap();
    settle().await;
    assert_eq!(
        h.worker.posted(),
        vec![identity(Some("alice")), WorkerMessage::CheckNow]
    );

    advance(15_000).await;
    assert_eq!(
        h.worker.posted(),
        vec![
            identity(Some("alice")),
            WorkerMessage::CheckNow,
            WorkerMessage::CheckNow
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn periodic_sync_unavailable_still_sends_identity_and_checks() {
    let (worker, inbox) = LoopbackWorker::controlling("v1");
    worker.set_periodic_sync_supported(false);
    let h = start(
        StaticPermissionPlatform::decided(PermissionState::Granted),
        (worker, inbox),
        NotificationStore::default_shared(),
        SessionContext::new(),
        Arc::new(NativePrompt),
    );

    login(&h, "alice");
    settle().await;

    assert_eq!(
        h.worker.posted(),
        vec![identity(Some("alice")), WorkerMessage::CheckNow]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_timers() {
    let h = harness(StaticPermissionPlatform::decided(PermissionState::Granted));
    login(&h, "alice");
    settle().await;
    assert_eq!(check_count(&h.worker), 1);

    h.handle.shutdown();
    let session = h.task.await.unwrap();
    assert_eq!(session.last_known_user(), Some("alice"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(check_count(&h.worker), 1, "no check after teardown");
    assert!(h.handle.data_changed().is_err());
    assert_eq!(h.handle.phase(), OrchestratorPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_prompt_delay_never_prompts() {
    let h = harness(StaticPermissionPlatform::answering(PermissionState::Granted));
    login(&h, "alice");
    advance(1_000).await;

    h.handle.shutdown();
    h.task.await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.platform.prompt_count(), 0);
}
