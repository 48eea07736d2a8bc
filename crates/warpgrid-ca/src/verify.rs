//! X.509 checks on node certificates.
//!
//! Used by nodes to check a bundle before trusting it, and by controllers
//! to authenticate a node from nothing but its certificate and the CA.

use rcgen::KeyPair;
use x509_parser::certificate::X509Certificate;

use crate::bundle::der_fingerprint;

/// What a CA-verified node certificate asserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCertificate {
    /// Subject common name, i.e. the node identity.
    pub node_id: String,
    /// Unix seconds after which the certificate is invalid.
    pub not_after: u64,
    /// Hex SHA-256 of the certificate DER.
    pub fingerprint: String,
}

/// Check that the first certificate in `cert_pem` carries a valid signature
/// from the CA in `ca_cert_pem`.
pub fn verify_issued_by(cert_pem: &str, ca_cert_pem: &str) -> Result<NodeCertificate, String> {
    let leaf_der = first_der(cert_pem, "node certificate")?;
    let ca_der = first_der(ca_cert_pem, "CA certificate")?;
    let leaf = parse(&leaf_der, "node certificate")?;
    let ca = parse(&ca_der, "CA certificate")?;

    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|e| format!("node certificate not signed by cluster CA: {e}"))?;

    let node_id = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    Ok(NodeCertificate {
        node_id,
        not_after: leaf.validity().not_after.timestamp().max(0) as u64,
        fingerprint: der_fingerprint(&leaf_der),
    })
}

/// Check that `key_pem` is the private half of the key certified in `cert_pem`.
pub fn key_matches(key_pem: &str, cert_pem: &str) -> Result<(), String> {
    let key = KeyPair::from_pem(key_pem).map_err(|e| format!("private key: {e}"))?;
    let der = first_der(cert_pem, "node certificate")?;
    let cert = parse(&der, "node certificate")?;

    if key.public_key_raw() == cert.public_key().subject_public_key.data.as_ref() {
        Ok(())
    } else {
        Err("private key does not match node certificate".to_string())
    }
}

fn first_der(pem: &str, what: &str) -> Result<Vec<u8>, String> {
    let mut reader = pem.as_bytes();
    match rustls_pemfile::certs(&mut reader).next() {
        Some(Ok(der)) => Ok(der.as_ref().to_vec()),
        Some(Err(e)) => Err(format!("{what}: {e}")),
        None => Err(format!("no {what}")),
    }
}

fn parse<'a>(der: &'a [u8], what: &str) -> Result<X509Certificate<'a>, String> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| format!("{what}: {e}"))
}
