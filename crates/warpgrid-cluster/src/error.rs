//! Error types for node bootstrap.

use thiserror::Error;
use warpgrid_ca::ProvisionError;

use crate::agent::AgentError;
use crate::identity::IdentityError;
use crate::managers::EmptyPoolError;

/// Terminal error of a bootstrap run.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    EmptyPool(#[from] EmptyPoolError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Provision(ProvisionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("bootstrap cancelled")]
    Cancelled,
}

impl From<ProvisionError> for BootstrapError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::Cancelled => BootstrapError::Cancelled,
            other => BootstrapError::Provision(other),
        }
    }
}
