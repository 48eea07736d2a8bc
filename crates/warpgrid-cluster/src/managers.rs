//! Controller address pool.
//!
//! Holds the configured controller endpoints and hands them out
//! round-robin, starting with the first configured entry. No
//! connectivity checks happen here; an unreachable controller shows up
//! as a provisioning or heartbeat failure.

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::error::BootstrapError;

/// Selection from a pool with no entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no controller addresses configured")]
pub struct EmptyPoolError;

/// The set of controller endpoints a node may contact.
#[derive(Debug)]
pub struct Managers {
    addrs: Vec<String>,
    next: AtomicUsize,
}

impl Managers {
    /// Build a pool, dropping blank entries and duplicates.
    pub fn new<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for addr in addrs {
            let addr = addr.into().trim().to_string();
            if !addr.is_empty() && !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        Self {
            addrs: unique,
            next: AtomicUsize::new(0),
        }
    }

    /// Build a pool from configuration, rejecting malformed entries and
    /// an empty result.
    pub fn parse<S: AsRef<str>>(addrs: &[S]) -> Result<Self, BootstrapError> {
        for addr in addrs {
            let addr = addr.as_ref().trim();
            if addr.is_empty() {
                continue;
            }
            validate_addr(addr).map_err(|reason| {
                BootstrapError::Configuration(format!("controller address {addr:?}: {reason}"))
            })?;
        }

        let managers = Self::new(addrs.iter().map(|a| a.as_ref()));
        if managers.is_empty() {
            return Err(EmptyPoolError.into());
        }
        Ok(managers)
    }

    /// Pick the next controller to contact.
    pub fn select(&self) -> Result<String, EmptyPoolError> {
        if self.addrs.is_empty() {
            return Err(EmptyPoolError);
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.addrs.len();
        Ok(self.addrs[idx].clone())
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl Clone for Managers {
    fn clone(&self) -> Self {
        Self {
            addrs: self.addrs.clone(),
            next: AtomicUsize::new(self.next.load(Ordering::Relaxed)),
        }
    }
}

/// Check that `addr` looks like `host:port`.
pub fn validate_addr(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err("missing or invalid host".to_string());
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port {port:?}")),
        Ok(_) => Ok(()),
    }
}
