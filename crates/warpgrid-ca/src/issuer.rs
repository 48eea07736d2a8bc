//! Join-token exchange with a controller.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProvisionError, ProvisionResult};
use crate::transport::{self, TransportError};

/// Controller path serving certificate issuance.
pub const ISSUE_PATH: &str = "/v1/certificates";

/// Default bound on one issuance round trip.
pub const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Node → controller: request a certificate for `node_id`.
#[derive(Clone, Serialize, Deserialize)]
pub struct IssueRequest {
    pub node_id: String,
    pub token: String,
    pub csr_pem: String,
}

impl fmt::Debug for IssueRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssueRequest")
            .field("node_id", &self.node_id)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Controller → node: the signed certificate and the trust root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueResponse {
    pub certificate_pem: String,
    pub ca_certificate_pem: String,
    pub not_after: u64,
}

/// Something that can exchange a join token for a node certificate.
pub trait CertificateIssuer: Send + Sync {
    /// Perform one issuance round trip against `controller`.
    fn issue(
        &self,
        controller: &str,
        request: &IssueRequest,
    ) -> impl Future<Output = ProvisionResult<IssueResponse>> + Send;
}

impl<T: CertificateIssuer> CertificateIssuer for Arc<T> {
    fn issue(
        &self,
        controller: &str,
        request: &IssueRequest,
    ) -> impl Future<Output = ProvisionResult<IssueResponse>> + Send {
        (**self).issue(controller, request)
    }
}

/// Issues certificates over the controller's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpIssuer {
    timeout: Duration,
}

impl HttpIssuer {
    /// Create an issuer with the default request timeout.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_ISSUE_TIMEOUT,
        }
    }

    /// Set the bound on one issuance round trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateIssuer for HttpIssuer {
    async fn issue(
        &self,
        controller: &str,
        request: &IssueRequest,
    ) -> ProvisionResult<IssueResponse> {
        let body = serde_json::to_vec(request)
            .map_err(|e| ProvisionError::Issuance(format!("encode request: {e}")))?;

        let resp = transport::post_json(controller, ISSUE_PATH, body, self.timeout)
            .await
            .map_err(|e| match e {
                TransportError::Connect(_) | TransportError::Timeout(_) => {
                    ProvisionError::UnreachableController {
                        addr: controller.to_string(),
                        reason: e.to_string(),
                    }
                }
                TransportError::Protocol(reason) => ProvisionError::Issuance(reason),
            })?;

        debug!(%controller, status = %resp.status, "issuance response");

        match resp.status {
            s if s.is_success() => serde_json::from_slice(&resp.body)
                .map_err(|e| ProvisionError::Issuance(format!("decode response: {e}"))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ProvisionError::Authorization(resp.error_message()))
            }
            other => Err(ProvisionError::Issuance(format!(
                "controller returned {other}: {}",
                resp.error_message()
            ))),
        }
    }
}
