//! warpgrid-ca: node credentials for WarpGrid clusters.
//!
//! A worker node proves cluster membership with a certificate signed by
//! the cluster CA. This crate covers both halves of getting one:
//!
//! ```text
//! Worker node                                Controller
//!   Provisioner::load_or_create                ClusterCa
//!     ├── StateDirLock (flock)                   └── sign_node_csr()
//!     ├── probe security.json ── Recovered
//!     └── bootstrap
//!           ├── generate key + CSR
//!           ├── CertificateIssuer ──── POST /v1/certificates ────►
//!           └── write_bundle (atomic) ── Issued
//! ```

pub mod authority;
pub mod bundle;
pub mod error;
pub mod issuer;
pub mod lock;
pub mod provision;
pub mod transport;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_support;

pub use authority::{ClusterCa, SignedNodeCert, generate_node_request};
pub use bundle::{SecurityConfig, certificate_fingerprint};
pub use error::{ProvisionError, ProvisionResult};
pub use issuer::{CertificateIssuer, HttpIssuer, IssueRequest, IssueResponse};
pub use provision::{Provisioned, Provisioner, stored_node_id};
pub use verify::NodeCertificate;
