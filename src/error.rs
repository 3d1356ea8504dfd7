//! Error types for the notification lifecycle subsystem.

/// Top-level error type for shelfwatch notifications.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The platform lacks the requested capability entirely.
    ///
    /// Treated as a denial by every caller; never fatal.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// No worker currently controls the page.
    #[error("no controlling worker is available")]
    WorkerUnavailable,

    /// A notification with this id is already registered.
    #[error("duplicate notification id: {0}")]
    DuplicateId(String),

    /// The platform rejected a second concurrent permission prompt.
    #[error("a permission request is already in flight")]
    PermissionRequestInFlight,

    /// The worker or worker host rejected an operation.
    #[error("worker error: {0}")]
    Worker(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, NotifyError>;
