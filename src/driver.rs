//! Headless stdin/stdout driver for the notification subsystem.
//!
//! Reads newline-delimited JSON [`DriverCommand`]s from stdin, feeds them to
//! an orchestrator and lifecycle controller wired against the in-process
//! [`LoopbackWorker`], and writes every worker message, lifecycle event and
//! phase change to stdout as a [`DriverOutput`] JSON line.
//!
//! Stdout is reserved for the JSON protocol; diagnostics go to stderr.

use crate::config::NotifyConfig;
use crate::error::{NotifyError, Result};
use crate::lifecycle::{LifecycleEvent, WorkerLifecycleController};
use crate::orchestrator::{NotificationOrchestrator, OrchestratorParts, OrchestratorPhase};
use crate::permissions::{PermissionNegotiator, PermissionState};
use crate::platform::stub::{LoopbackWorker, RecordingSurface, StaticPermissionPlatform};
use crate::prompt::strategy_for;
use crate::session::{SessionContext, UserContext};
use crate::store::NotificationStore;
use crate::sync::BackgroundSyncCoordinator;
use crate::worker::{WorkerHost, WorkerMessage, WorkerPeer, WorkerVersionToken};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

/// Commands accepted on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverCommand {
    Login { user_id: String },
    Logout,
    DataChanged,
    /// Simulate a new worker version finishing its install.
    InstallWorker { version: String },
    /// Simulate a worker version taking control of the page.
    ActivateWorker { version: String },
    Shutdown,
}

/// Lines written to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverOutput {
    WorkerMessage { message: WorkerMessage },
    Lifecycle { event: LifecycleEvent },
    Phase { phase: OrchestratorPhase },
    Error { message: String },
}

type SharedWriter = Arc<Mutex<BufWriter<tokio::io::Stdout>>>;

/// Run the driver until stdin closes or a `shutdown` command arrives.
///
/// `permission_answer` is what the simulated native prompt answers.
pub async fn run_stdio_driver(
    config: NotifyConfig,
    permission_answer: PermissionState,
) -> Result<()> {
    let (worker, mut inbox) = LoopbackWorker::new();
    let platform = StaticPermissionPlatform::answering(permission_answer);

    let coordinator = Arc::new(BackgroundSyncCoordinator::new(
        Arc::clone(&worker) as Arc<dyn WorkerPeer>,
        &config.sync,
    ));
    let parts = OrchestratorParts {
        negotiator: Arc::new(PermissionNegotiator::new(platform)),
        store: NotificationStore::default_shared(),
        coordinator,
        strategy: strategy_for(config.permission.strategy, None),
        surface: RecordingSurface::new(),
    };
    let (orchestrator, handle) = NotificationOrchestrator::new(parts, &config, SessionContext::new());

    let lifecycle =
        WorkerLifecycleController::new(Arc::clone(&worker) as Arc<dyn WorkerHost>, &config.worker);
    let mut lifecycle_rx = lifecycle.subscribe();
    let lifecycle_cancel = CancellationToken::new();
    let lifecycle_task = lifecycle.run(worker.subscribe_lifecycle(), lifecycle_cancel.clone());

    let writer: SharedWriter = Arc::new(Mutex::new(BufWriter::new(tokio::io::stdout())));

    // Forwarders run until `flush` is cancelled, then write out whatever is
    // still queued and stop.
    let flush = CancellationToken::new();

    let message_writer = Arc::clone(&writer);
    let message_flush = flush.clone();
    let message_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                received = inbox.recv() => match received {
                    Some(message) => {
                        emit(&message_writer, &DriverOutput::WorkerMessage { message }).await;
                    }
                    None => break,
                },
                _ = message_flush.cancelled() => {
                    for message in inbox.drain() {
                        emit(&message_writer, &DriverOutput::WorkerMessage { message }).await;
                    }
                    break;
                }
            }
        }
    });

    let lifecycle_writer = Arc::clone(&writer);
    let lifecycle_flush = flush.clone();
    let lifecycle_forwarder = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                received = lifecycle_rx.recv() => match received {
                    Ok(event) => emit(&lifecycle_writer, &DriverOutput::Lifecycle { event }).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "lifecycle forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = lifecycle_flush.cancelled() => {
                    while let Ok(event) = lifecycle_rx.try_recv() {
                        emit(&lifecycle_writer, &DriverOutput::Lifecycle { event }).await;
                    }
                    break;
                }
            }
        }
    });

    let phase_writer = Arc::clone(&writer);
    let phase_flush = flush.clone();
    let mut phase_rx = handle.subscribe_phase();
    let phase_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = phase_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let phase = *phase_rx.borrow_and_update();
                    emit(&phase_writer, &DriverOutput::Phase { phase }).await;
                }
                _ = phase_flush.cancelled() => {
                    if phase_rx.has_changed().unwrap_or(false) {
                        let phase = *phase_rx.borrow_and_update();
                        emit(&phase_writer, &DriverOutput::Phase { phase }).await;
                    }
                    break;
                }
            }
        }
    });

    let orchestrator_task = orchestrator.spawn();

    let reader_result = run_reader(&handle, &worker, &writer).await;

    handle.shutdown();
    lifecycle_cancel.cancel();
    if let Err(e) = orchestrator_task.await {
        tracing::error!(error = %e, "orchestrator task failed");
    }
    if let Err(e) = lifecycle_task.await {
        tracing::error!(error = %e, "lifecycle task failed");
    }
    flush.cancel();
    for task in [message_task, lifecycle_forwarder, phase_task] {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "output forwarder failed");
        }
    }

    reader_result
}

async fn run_reader(
    handle: &crate::orchestrator::OrchestratorHandle,
    worker: &Arc<LoopbackWorker>,
    writer: &SharedWriter,
) -> Result<()> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| NotifyError::Channel(format!("failed to read from stdin: {e}")))?;
        if bytes_read == 0 {
            tracing::info!("stdin closed (EOF); shutting down driver");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let command: DriverCommand = match serde_json::from_str(trimmed) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse driver command");
                emit(
                    writer,
                    &DriverOutput::Error {
                        message: format!("failed to parse command: {e}"),
                    },
                )
                .await;
                continue;
            }
        };

        let dispatched = match command {
            DriverCommand::Login { user_id } => handle.user_changed(UserContext::signed_in(user_id)),
            DriverCommand::Logout => handle.user_changed(UserContext::signed_out()),
            DriverCommand::DataChanged => handle.data_changed(),
            DriverCommand::InstallWorker { version } => {
                worker.install(WorkerVersionToken::new(version));
                Ok(())
            }
            DriverCommand::ActivateWorker { version } => {
                worker.activate(WorkerVersionToken::new(version));
                Ok(())
            }
            DriverCommand::Shutdown => {
                tracing::info!("shutdown received; stopping driver");
                break;
            }
        };

        if let Err(e) = dispatched {
            tracing::error!(error = %e, "driver command dispatch failed");
            emit(
                writer,
                &DriverOutput::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }

    Ok(())
}

async fn emit(writer: &SharedWriter, output: &DriverOutput) {
    let json = match serde_json::to_string(output) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize driver output; skipping");
            return;
        }
    };
    let mut w = writer.lock().await;
    if let Err(e) = write_line(&mut w, &json).await {
        tracing::warn!(error = %e, "failed to write driver output");
    }
}

async fn write_line(writer: &mut BufWriter<tokio::io::Stdout>, json: &str) -> Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
