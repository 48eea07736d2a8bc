//! Node identity.
//!
//! Generated identities are 128 random bits from the OS CSPRNG rendered
//! as fixed-width lowercase base36, so they are safe to use as hostnames,
//! file names and certificate common names.

use thiserror::Error;

/// Width of a base36-encoded 128-bit value.
const RANDOM_ID_LENGTH: usize = 25;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Identity generation failure.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

/// Use `supplied` verbatim when non-empty, otherwise generate a new id.
pub fn resolve(supplied: &str) -> Result<String, IdentityError> {
    if !supplied.is_empty() {
        return Ok(supplied.to_string());
    }
    new_id()
}

/// Generate a new cluster-unique node identifier.
pub fn new_id() -> Result<String, IdentityError> {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf).map_err(|e| IdentityError::Entropy(e.to_string()))?;
    Ok(encode_base36(u128::from_be_bytes(buf)))
}

fn encode_base36(mut n: u128) -> String {
    let mut out = [b'0'; RANDOM_ID_LENGTH];
    for slot in out.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }
    out.iter().map(|&b| b as char).collect()
}
