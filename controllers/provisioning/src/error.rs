//! Controller-specific error types.
//!
//! Errors split into two kinds that drive all branching in the reconciler:
//! input errors (bad request parameters, misconfigured templates, missing
//! prerequisite resources) which never resolve by waiting, and everything else,
//! which is transient and retried through a requeue.

use crate::document::DocumentError;
use crate::merge::MergeError;
use crate::store::StoreError;
use hwplugin_client::HwPluginError;
use thiserror::Error;

/// Errors that can occur in the Provisioning Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource store error (API reads and writes)
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Hardware plugin API error
    #[error("hardware plugin error: {0}")]
    HwPlugin(#[from] HwPluginError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// User or template caused error. The message is surfaced verbatim in conditions.
    #[error("{0}")]
    Input(String),

    /// Reconciliation failed
    #[error("{0}")]
    Reconciliation(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Operation aborted by shutdown
    #[error("context cancelled: {0}")]
    Cancelled(String),

    /// I/O error (token file, probe listener)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Builds an input error
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    /// Builds a transient reconciliation error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Reconciliation(message.into())
    }

    /// True for user or template caused errors
    pub fn is_input_error(&self) -> bool {
        match self {
            Self::Input(_) => true,
            Self::Store(e) => e.is_invalid(),
            Self::HwPlugin(e) => e.is_client_error(),
            _ => false,
        }
    }

    /// Prefixes the message with context, keeping the error kind
    #[must_use]
    pub fn context(self, prefix: &str) -> Self {
        if self.is_input_error() {
            Self::Input(format!("{}: {}", prefix, self))
        } else {
            Self::Reconciliation(format!("{}: {}", prefix, self))
        }
    }
}

impl From<DocumentError> for ControllerError {
    fn from(e: DocumentError) -> Self {
        Self::Input(e.to_string())
    }
}

impl From<MergeError> for ControllerError {
    fn from(e: MergeError) -> Self {
        Self::Input(e.to_string())
    }
}
