//! Permission prompt strategies.
//!
//! Exactly one strategy is active per deployment, chosen by
//! [`PromptStrategyKind`]: the native prompt alone, or an in-app modal that
//! explains the alerts before handing over to the native prompt.

use crate::config::PromptStrategyKind;
use crate::permissions::{PermissionNegotiator, PermissionState};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// How a prompt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Granted,
    /// The platform refused; it will keep refusing.
    Denied,
    /// The user dismissed or declined without a platform answer. No further
    /// prompt is shown this session.
    Declined,
}

impl From<PermissionState> for PromptOutcome {
    fn from(state: PermissionState) -> Self {
        match state {
            PermissionState::Granted => Self::Granted,
            PermissionState::Denied => Self::Denied,
            PermissionState::Unrequested => Self::Declined,
        }
    }
}

#[async_trait]
pub trait PromptStrategy: Send + Sync + 'static {
    async fn prompt(&self, negotiator: &PermissionNegotiator) -> PromptOutcome;
}

/// Shows the platform prompt directly.
#[derive(Debug, Default)]
pub struct NativePrompt;

#[async_trait]
impl PromptStrategy for NativePrompt {
    async fn prompt(&self, negotiator: &PermissionNegotiator) -> PromptOutcome {
        negotiator.request().await.into()
    }
}

/// In-app explanation shown before the native prompt.
#[async_trait]
pub trait ModalPresenter: Send + Sync + 'static {
    /// Show the modal; `true` when the user chose to enable alerts.
    async fn confirm(&self) -> bool;
}

pub struct ModalPrompt {
    presenter: Arc<dyn ModalPresenter>,
}

impl ModalPrompt {
    pub fn new(presenter: Arc<dyn ModalPresenter>) -> Self {
        Self { presenter }
    }
}

#[async_trait]
impl PromptStrategy for ModalPrompt {
    async fn prompt(&self, negotiator: &PermissionNegotiator) -> PromptOutcome {
        if !self.presenter.confirm().await {
            debug!("user declined the notification modal");
            return PromptOutcome::Declined;
        }
        negotiator.request().await.into()
    }
}

/// Build the strategy for `kind`.
///
/// [`PromptStrategyKind::Modal`] without a presenter falls back to the
/// native prompt.
pub fn strategy_for(
    kind: PromptStrategyKind,
    presenter: Option<Arc<dyn ModalPresenter>>,
) -> Arc<dyn PromptStrategy> {
    match (kind, presenter) {
        (PromptStrategyKind::Modal, Some(presenter)) => Arc::new(ModalPrompt::new(presenter)),
        (PromptStrategyKind::Modal, None) => {
            tracing::warn!("modal prompt configured without a presenter, using native prompt");
            Arc::new(NativePrompt)
        }
        (PromptStrategyKind::Native, _) => Arc::new(NativePrompt),
    }
}
