//! Fixtures shared by the unit tests in this crate.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::authority::{ClusterCa, generate_node_request};
use crate::bundle::{SecurityConfig, epoch_secs};
use crate::error::{ProvisionError, ProvisionResult};
use crate::issuer::{CertificateIssuer, IssueRequest, IssueResponse};

/// A valid bundle for `node_id`, signed by a throwaway CA.
pub(crate) fn issue_bundle(node_id: &str) -> SecurityConfig {
    let ca = ClusterCa::generate().unwrap();
    let req = generate_node_request(node_id).unwrap();
    let signed = ca.sign_node_csr(node_id, &req.csr_pem).unwrap();

    SecurityConfig {
        node_id: node_id.to_string(),
        key_pem: req.key_pem,
        certificate_pem: signed.certificate_pem,
        ca_certificate_pem: ca.cert_pem().to_string(),
        controller: "127.0.0.1:4242".to_string(),
        issued_at: epoch_secs(),
        not_after: signed.not_after,
    }
}

/// In-process issuer that signs with its own CA and counts round trips.
pub(crate) struct TestIssuer {
    ca: ClusterCa,
    token: String,
    delay: Option<Duration>,
    certificate_override: Option<String>,
    pub calls: AtomicUsize,
    controllers: Mutex<Vec<String>>,
}

impl TestIssuer {
    pub fn new(token: &str) -> Self {
        Self {
            ca: ClusterCa::generate().unwrap(),
            token: token.to_string(),
            delay: None,
            certificate_override: None,
            calls: AtomicUsize::new(0),
            controllers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sign node certificates with this lifetime.
    pub fn with_node_validity(mut self, validity: Duration) -> Self {
        self.ca = self.ca.with_node_validity(validity);
        self
    }

    /// Answer every request with this certificate instead of signing.
    pub fn with_certificate(mut self, certificate_pem: &str) -> Self {
        self.certificate_override = Some(certificate_pem.to_string());
        self
    }

    pub fn controllers(&self) -> Vec<String> {
        self.controllers.lock().unwrap().clone()
    }
}

impl CertificateIssuer for TestIssuer {
    async fn issue(
        &self,
        controller: &str,
        request: &IssueRequest,
    ) -> ProvisionResult<IssueResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.controllers.lock().unwrap().push(controller.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if request.token != self.token {
            return Err(ProvisionError::Authorization("invalid join token".to_string()));
        }

        let signed = self.ca.sign_node_csr(&request.node_id, &request.csr_pem)?;
        Ok(IssueResponse {
            certificate_pem: self
                .certificate_override
                .clone()
                .unwrap_or(signed.certificate_pem),
            ca_certificate_pem: self.ca.cert_pem().to_string(),
            not_after: signed.not_after,
        })
    }
}
