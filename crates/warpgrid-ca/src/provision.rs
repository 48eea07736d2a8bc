//! Load-or-create for the node credential.
//!
//! ```text
//! lock state_dir
//!   └── probe security.json
//!         ├── valid, bound to node, unexpired ──► Recovered
//!         └── absent / corrupt / foreign / expired
//!               └── token? ──no──► MissingToken
//!                     └── CSR ─► controller ─► persist ──► Issued
//! ```

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::generate_node_request;
use crate::bundle::{self, Probe, SecurityConfig};
use crate::error::{ProvisionError, ProvisionResult};
use crate::issuer::{CertificateIssuer, IssueRequest};
use crate::lock::StateDirLock;

/// Which branch produced the credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// Loaded from the state directory, no network call made.
    Recovered(SecurityConfig),
    /// Freshly issued by a controller and persisted.
    Issued(SecurityConfig),
}

impl Provisioned {
    pub fn security(&self) -> &SecurityConfig {
        match self {
            Provisioned::Recovered(s) | Provisioned::Issued(s) => s,
        }
    }

    pub fn into_security(self) -> SecurityConfig {
        match self {
            Provisioned::Recovered(s) | Provisioned::Issued(s) => s,
        }
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, Provisioned::Recovered(_))
    }
}

/// Provisions node credentials in one state directory.
pub struct Provisioner<I> {
    state_dir: PathBuf,
    issuer: I,
}

impl<I: CertificateIssuer> Provisioner<I> {
    /// Create a provisioner for `state_dir` using `issuer` for bootstrap.
    pub fn new(state_dir: impl Into<PathBuf>, issuer: I) -> Self {
        Self {
            state_dir: state_dir.into(),
            issuer,
        }
    }

    /// Return the persisted credential for `node_id`, or bootstrap a new
    /// one from `controller` with `join_token`.
    ///
    /// Holds the state directory lock for the whole probe and bootstrap,
    /// so concurrent callers issue at most one request between them.
    pub async fn load_or_create(
        &self,
        node_id: &str,
        join_token: &str,
        controller: &str,
        cancel: &CancellationToken,
    ) -> ProvisionResult<Provisioned> {
        let _lock = StateDirLock::acquire(&self.state_dir, cancel).await?;

        if let Some(security) = self.probe(node_id)? {
            info!(%node_id, not_after = security.not_after, "recovered node credential");
            return Ok(Provisioned::Recovered(security));
        }

        if join_token.is_empty() {
            return Err(ProvisionError::MissingToken);
        }

        let security = self
            .bootstrap(node_id, join_token, controller, cancel)
            .await?;
        Ok(Provisioned::Issued(security))
    }

    fn probe(&self, node_id: &str) -> ProvisionResult<Option<SecurityConfig>> {
        let dir = self.state_dir.display();
        match bundle::read_bundle(&self.state_dir)? {
            Probe::Absent => {
                debug!(%dir, "no credential on disk");
                Ok(None)
            }
            Probe::Corrupt(reason) => {
                warn!(%dir, %reason, "discarding unreadable credential");
                Ok(None)
            }
            Probe::Found(security) if security.node_id != node_id => {
                warn!(
                    %dir,
                    stored = %security.node_id,
                    %node_id,
                    "credential belongs to another node identity"
                );
                Ok(None)
            }
            Probe::Found(security) if security.is_expired(bundle::epoch_secs()) => {
                warn!(%dir, not_after = security.not_after, "credential expired");
                Ok(None)
            }
            Probe::Found(security) => Ok(Some(security)),
        }
    }

    async fn bootstrap(
        &self,
        node_id: &str,
        join_token: &str,
        controller: &str,
        cancel: &CancellationToken,
    ) -> ProvisionResult<SecurityConfig> {
        let node_request = generate_node_request(node_id)?;
        let request = IssueRequest {
            node_id: node_id.to_string(),
            token: join_token.to_string(),
            csr_pem: node_request.csr_pem,
        };

        info!(%node_id, %controller, "requesting node certificate");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            result = self.issuer.issue(controller, &request) => result?,
        };

        let now = bundle::epoch_secs();
        let security = SecurityConfig {
            node_id: node_id.to_string(),
            key_pem: node_request.key_pem,
            certificate_pem: response.certificate_pem,
            ca_certificate_pem: response.ca_certificate_pem,
            controller: controller.to_string(),
            issued_at: now,
            not_after: response.not_after,
        };

        security.validate().map_err(|reason| {
            ProvisionError::Issuance(format!("controller returned an unusable credential: {reason}"))
        })?;
        if security.is_expired(now) {
            return Err(ProvisionError::Issuance(
                "controller returned an expired certificate".to_string(),
            ));
        }

        bundle::write_bundle(&self.state_dir, &security)?;
        info!(%node_id, %controller, not_after = security.not_after, "node credential issued");

        Ok(security)
    }
}

/// Identity recorded in an existing bundle, if any can be read.
///
/// Read-only and lock-free; meant for picking up the identity before
/// provisioning starts.
pub fn stored_node_id(state_dir: &Path) -> Option<String> {
    match bundle::read_bundle(state_dir) {
        Ok(Probe::Found(security)) => Some(security.node_id),
        _ => None,
    }
}
