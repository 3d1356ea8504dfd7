//! Platform adapters.
//!
//! The subsystem talks to its host only through traits:
//! [`PermissionPlatform`](crate::permissions::PermissionPlatform),
//! [`WorkerPeer`](crate::worker::WorkerPeer),
//! [`WorkerHost`](crate::worker::WorkerHost) and
//! [`NotificationSurface`](crate::orchestrator::NotificationSurface).
//! [`stub`] provides in-process implementations of all of them for the
//! headless driver and for tests.

pub mod stub;
