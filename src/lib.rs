//! shelfwatch: notification lifecycle for the inventory dashboard.
//!
//! This crate decides when to ask for notification permission, keeps the
//! long-lived background worker informed about who is signed in, tracks
//! which notifications are live for which user, and manages the worker's
//! install/update lifecycle.
//!
//! # Architecture
//!
//! - **Permissions** ([`permissions`]): wraps the platform prompt, one prompt at a time
//! - **Store** ([`store`]): live notifications keyed by owning user
//! - **Sync** ([`sync`]): periodic wake-up, identity, immediate checks
//! - **Lifecycle** ([`lifecycle`]): worker install, update and reload latch
//! - **Orchestrator** ([`orchestrator`]): reacts to session and data signals
//!   and drives all of the above
//!
//! The worker itself is reached only through the traits in [`worker`].

pub mod config;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod permissions;
pub mod platform;
pub mod prompt;
pub mod session;
pub mod store;
pub mod sync;
pub mod worker;

pub use config::NotifyConfig;
pub use error::{NotifyError, Result};
pub use lifecycle::{LifecycleEvent, WorkerLifecycleController, WorkerState};
pub use orchestrator::{NotificationOrchestrator, OrchestratorHandle, OrchestratorPhase};
pub use permissions::{PermissionNegotiator, PermissionState};
pub use session::{SessionContext, UserContext};
pub use store::{NotificationRecord, NotificationStore};
pub use sync::{BackgroundSyncCoordinator, SyncRegistration};
