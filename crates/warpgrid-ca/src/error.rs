//! Error types for node credential provisioning.

use thiserror::Error;

/// Result type alias for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors that can occur while loading or bootstrapping a node credential.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no local credential found and no join token supplied")]
    MissingToken,

    #[error("join token rejected by controller: {0}")]
    Authorization(String),

    #[error("controller {addr} unreachable: {reason}")]
    UnreachableController { addr: String, reason: String },

    #[error("credential issuance failed: {0}")]
    Issuance(String),

    #[error("state directory error: {0}")]
    Persistence(String),

    #[error("credential generation failed: {0}")]
    Credential(String),

    #[error("provisioning cancelled")]
    Cancelled,
}

impl From<rcgen::Error> for ProvisionError {
    fn from(e: rcgen::Error) -> Self {
        ProvisionError::Credential(e.to_string())
    }
}
