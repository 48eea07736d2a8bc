//! Persisted node security bundle.
//!
//! The bundle is a single JSON document holding the node's private key,
//! its issued certificate, the cluster CA certificate and the validity
//! metadata needed to decide on expiry and renewal.
//!
//! ```text
//! {state_dir}/
//! ├── .lock           # advisory provisioning lock
//! └── security.json   # SecurityConfig (0600)
//! ```
//!
//! Writes go through a temp file that is synced and renamed into place, so
//! a crash mid-write leaves either the old bundle or the new one.

use std::fmt;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ProvisionError, ProvisionResult};
use crate::verify;

/// Filename of the persisted bundle inside the state directory.
pub const BUNDLE_FILENAME: &str = "security.json";
const BUNDLE_TMP_FILENAME: &str = ".security.json.tmp";

/// The node's credential bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Identity the certificate was issued to.
    pub node_id: String,
    /// PEM-encoded private key (generated locally, never sent anywhere).
    pub key_pem: String,
    /// PEM-encoded node certificate signed by the cluster CA.
    pub certificate_pem: String,
    /// PEM-encoded cluster CA certificate.
    pub ca_certificate_pem: String,
    /// Controller that issued the certificate.
    pub controller: String,
    /// Unix seconds at which the bundle was issued.
    pub issued_at: u64,
    /// Unix seconds after which the certificate is no longer valid.
    pub not_after: u64,
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("node_id", &self.node_id)
            .field("key_pem", &"<redacted>")
            .field("controller", &self.controller)
            .field("issued_at", &self.issued_at)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl SecurityConfig {
    /// Whether the certificate has expired at `now` (unix seconds).
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.not_after
    }

    /// Whether less than a third of the validity window remains.
    pub fn renewal_due(&self, now: u64) -> bool {
        let lifetime = self.not_after.saturating_sub(self.issued_at);
        let remaining = self.not_after.saturating_sub(now);
        remaining.saturating_mul(3) < lifetime
    }

    /// Hex SHA-256 of the leaf certificate DER.
    pub fn fingerprint(&self) -> Option<String> {
        certificate_fingerprint(&self.certificate_pem)
    }

    /// Check that every PEM block decodes, the key belongs to the
    /// certificate and the certificate was signed by the bundled CA for
    /// this node.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.is_empty() {
            return Err("bundle has no node id".to_string());
        }
        if count_certificates(&self.certificate_pem) == 0 {
            return Err("no node certificate".to_string());
        }
        if count_certificates(&self.ca_certificate_pem) == 0 {
            return Err("no CA certificate".to_string());
        }
        let mut reader = self.key_pem.as_bytes();
        match rustls_pemfile::private_key(&mut reader) {
            Ok(Some(_)) => {}
            Ok(None) => return Err("no private key".to_string()),
            Err(e) => return Err(format!("private key: {e}")),
        }

        verify::key_matches(&self.key_pem, &self.certificate_pem)?;
        let cert = verify::verify_issued_by(&self.certificate_pem, &self.ca_certificate_pem)?;
        if cert.node_id != self.node_id {
            return Err(format!(
                "certificate issued to {:?}, bundle names {:?}",
                cert.node_id, self.node_id
            ));
        }
        Ok(())
    }
}

/// Hex SHA-256 over the DER of the first certificate in `pem`.
pub fn certificate_fingerprint(pem: &str) -> Option<String> {
    let mut reader = pem.as_bytes();
    let der = rustls_pemfile::certs(&mut reader).next()?.ok()?;
    Some(der_fingerprint(der.as_ref()))
}

pub(crate) fn der_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn count_certificates(pem: &str) -> usize {
    let mut reader = pem.as_bytes();
    let mut count = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        if cert.is_err() {
            return 0;
        }
        count += 1;
    }
    count
}

/// Outcome of probing the state directory.
#[derive(Debug)]
pub enum Probe {
    /// A structurally valid bundle was read.
    Found(SecurityConfig),
    /// No bundle on disk.
    Absent,
    /// A bundle exists but cannot be used.
    Corrupt(String),
}

/// Read the bundle from `dir`.
///
/// Unparseable contents are reported as [`Probe::Corrupt`]; only I/O
/// failures other than a missing file are errors.
pub fn read_bundle(dir: &Path) -> ProvisionResult<Probe> {
    let path = dir.join(BUNDLE_FILENAME);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Probe::Absent),
        Err(e) => {
            return Err(ProvisionError::Persistence(format!(
                "read {}: {e}",
                path.display()
            )));
        }
    };

    let security: SecurityConfig = match serde_json::from_slice(&raw) {
        Ok(s) => s,
        Err(e) => return Ok(Probe::Corrupt(format!("parse {}: {e}", path.display()))),
    };

    match security.validate() {
        Ok(()) => Ok(Probe::Found(security)),
        Err(reason) => Ok(Probe::Corrupt(reason)),
    }
}

/// Atomically replace the bundle in `dir`.
pub fn write_bundle(dir: &Path, security: &SecurityConfig) -> ProvisionResult<()> {
    ensure_dir(dir)?;
    let tmp = dir.join(BUNDLE_TMP_FILENAME);
    let path = dir.join(BUNDLE_FILENAME);

    let encoded = serde_json::to_vec_pretty(security)
        .map_err(|e| ProvisionError::Persistence(format!("encode bundle: {e}")))?;

    let write = || -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&encoded)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        // Persist the rename itself.
        File::open(dir)?.sync_all()
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        ProvisionError::Persistence(format!("write {}: {e}", path.display()))
    })?;

    debug!(path = %path.display(), "security bundle written");
    Ok(())
}

/// Create the state directory (0700) if it does not exist.
pub(crate) fn ensure_dir(dir: &Path) -> ProvisionResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| ProvisionError::Persistence(format!("create {}: {e}", dir.display())))
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::issue_bundle;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = issue_bundle("node-1");

        write_bundle(dir.path(), &bundle).unwrap();

        match read_bundle(dir.path()).unwrap() {
            Probe::Found(read) => assert_eq!(read, bundle),
            other => panic!("expected bundle, got {other:?}"),
        }
        assert!(!dir.path().join(BUNDLE_TMP_FILENAME).exists());
    }

    #[test]
    fn missing_bundle_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read_bundle(dir.path()).unwrap(), Probe::Absent));
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(BUNDLE_FILENAME), b"\x00not json").unwrap();
        assert!(matches!(read_bundle(dir.path()).unwrap(), Probe::Corrupt(_)));
    }

    #[test]
    fn bad_pem_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = issue_bundle("node-1");
        bundle.key_pem = "not a key".to_string();
        let encoded = serde_json::to_vec(&bundle).unwrap();
        fs::write(dir.path().join(BUNDLE_FILENAME), encoded).unwrap();

        assert!(matches!(read_bundle(dir.path()).unwrap(), Probe::Corrupt(_)));
    }

    #[test]
    fn key_from_another_bundle_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = issue_bundle("node-1");
        bundle.key_pem = issue_bundle("node-1").key_pem;
        let encoded = serde_json::to_vec(&bundle).unwrap();
        fs::write(dir.path().join(BUNDLE_FILENAME), encoded).unwrap();

        assert!(matches!(read_bundle(dir.path()).unwrap(), Probe::Corrupt(_)));
    }

    #[test]
    fn certificate_from_another_ca_is_corrupt() {
        let mut bundle = issue_bundle("node-1");
        bundle.ca_certificate_pem = issue_bundle("node-1").ca_certificate_pem;
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn unreadable_bundle_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(BUNDLE_FILENAME)).unwrap();

        assert!(matches!(
            read_bundle(dir.path()),
            Err(ProvisionError::Persistence(_))
        ));
    }

    #[test]
    fn bundle_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), &issue_bundle("node-1")).unwrap();

        let mode = fs::metadata(dir.path().join(BUNDLE_FILENAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn expiry_and_renewal_window() {
        let mut bundle = issue_bundle("node-1");
        bundle.issued_at = 1_000;
        bundle.not_after = 1_300;

        assert!(!bundle.is_expired(1_000));
        assert!(!bundle.renewal_due(1_100));
        assert!(bundle.renewal_due(1_250));
        assert!(bundle.is_expired(1_300));
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let bundle = issue_bundle("node-1");
        let fp = bundle.fingerprint().unwrap();
        assert_eq!(fp.len(), 64);
        assert_eq!(Some(fp), certificate_fingerprint(&bundle.certificate_pem));
    }

    #[test]
    fn debug_redacts_private_key() {
        let bundle = issue_bundle("node-1");
        let rendered = format!("{bundle:?}");
        assert!(!rendered.contains("PRIVATE KEY"));
        assert!(rendered.contains("node-1"));
    }
}
