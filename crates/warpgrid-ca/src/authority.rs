//! Cluster certificate authority and node signing requests.
//!
//! The controller side holds a [`ClusterCa`] that signs node CSRs; the node
//! side calls [`generate_node_request`] so its private key never leaves the
//! machine.

use std::time::Duration;

use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use time::OffsetDateTime;
use tracing::info;

use crate::error::ProvisionResult;
use crate::verify::{self, NodeCertificate};

/// Default lifetime of issued node certificates.
pub const DEFAULT_NODE_VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const ORGANIZATION: &str = "WarpGrid";

/// Node-side key material for a certificate request.
pub struct NodeRequest {
    /// PEM-encoded private key, kept by the node.
    pub key_pem: String,
    /// PEM-encoded CSR sent to the controller.
    pub csr_pem: String,
}

/// Generate a fresh key pair and a CSR naming `node_id`.
pub fn generate_node_request(node_id: &str) -> ProvisionResult<NodeRequest> {
    let key = KeyPair::generate()?;

    let mut params = CertificateParams::default();
    params.distinguished_name = node_name(node_id);

    let csr = params.serialize_request(&key)?;
    Ok(NodeRequest {
        key_pem: key.serialize_pem(),
        csr_pem: csr.pem()?,
    })
}

/// A certificate signed for a node.
#[derive(Debug, Clone)]
pub struct SignedNodeCert {
    /// PEM-encoded node certificate.
    pub certificate_pem: String,
    /// Unix seconds after which the certificate is invalid.
    pub not_after: u64,
}

/// The cluster's trust root.
pub struct ClusterCa {
    cert: rcgen::Certificate,
    key: KeyPair,
    cert_pem: String,
    node_validity: Duration,
}

impl ClusterCa {
    /// Generate a new self-signed cluster CA.
    pub fn generate() -> ProvisionResult<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::CommonName, "WarpGrid Cluster CA");
        params.distinguished_name = dn;
        params.not_after = OffsetDateTime::now_utc() + CA_VALIDITY;

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();

        info!("generated cluster CA certificate");

        Ok(Self {
            cert,
            key,
            cert_pem,
            node_validity: DEFAULT_NODE_VALIDITY,
        })
    }

    /// Load a CA previously written out with [`ClusterCa::cert_pem`] and
    /// [`ClusterCa::key_pem`].
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> ProvisionResult<Self> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let cert = params.self_signed(&key)?;

        Ok(Self {
            cert,
            key,
            cert_pem: cert_pem.to_string(),
            node_validity: DEFAULT_NODE_VALIDITY,
        })
    }

    /// Set the lifetime of node certificates signed from now on.
    pub fn with_node_validity(mut self, validity: Duration) -> Self {
        self.node_validity = validity;
        self
    }

    /// PEM-encoded CA certificate, distributed to nodes.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM-encoded CA private key.
    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Sign a node CSR. The subject is replaced with `node_id` so a node
    /// cannot claim another identity through its request.
    pub fn sign_node_csr(&self, node_id: &str, csr_pem: &str) -> ProvisionResult<SignedNodeCert> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)?;

        let now = OffsetDateTime::now_utc();
        let not_after = now + self.node_validity;

        csr.params.distinguished_name = node_name(node_id);
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.not_before = now;
        csr.params.not_after = not_after;
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let cert = csr.signed_by(&self.cert, &self.key)?;

        info!(%node_id, "signed node certificate");

        Ok(SignedNodeCert {
            certificate_pem: cert.pem(),
            not_after: not_after.unix_timestamp().max(0) as u64,
        })
    }

    /// Authenticate a node by its certificate: it must be signed by this CA,
    /// name `node_id` and still be valid at `now` (unix seconds).
    pub fn verify_node_certificate(
        &self,
        node_id: &str,
        cert_pem: &str,
        now: u64,
    ) -> Result<NodeCertificate, String> {
        let cert = verify::verify_issued_by(cert_pem, &self.cert_pem)?;
        if cert.node_id != node_id {
            return Err(format!("certificate issued to {:?}", cert.node_id));
        }
        if now >= cert.not_after {
            return Err("certificate expired".to_string());
        }
        Ok(cert)
    }
}

fn node_name(node_id: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::CommonName, node_id);
    dn
}
