//! Exclusive provisioning lock on a state directory.
//!
//! Uses `flock(2)` on `{state_dir}/.lock`. The lock belongs to the open
//! file description, so two handles opened in the same process exclude
//! each other just like two processes do. Dropping the guard closes the
//! file and releases the lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bundle::ensure_dir;
use crate::error::{ProvisionError, ProvisionResult};

const LOCK_FILENAME: &str = ".lock";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Held for as long as the state directory must not be touched by others.
#[derive(Debug)]
pub struct StateDirLock {
    _file: File,
}

impl StateDirLock {
    /// Wait for the exclusive lock on `dir`, creating the directory if needed.
    ///
    /// Polls without blocking the runtime so the wait can be cancelled.
    pub async fn acquire(dir: &Path, cancel: &CancellationToken) -> ProvisionResult<Self> {
        ensure_dir(dir)?;
        let path = dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|e| ProvisionError::Persistence(format!("open {}: {e}", path.display())))?;

        let mut waiting = false;
        loop {
            let locked = try_lock(&file).map_err(|e| {
                ProvisionError::Persistence(format!("lock {}: {e}", path.display()))
            })?;
            if locked {
                debug!(path = %path.display(), "state directory locked");
                return Ok(Self { _file: file });
            }
            if !waiting {
                debug!(path = %path.display(), "state directory busy, waiting for lock");
                waiting = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                _ = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
            }
        }
    }
}

fn try_lock(file: &File) -> io::Result<bool> {
    // SAFETY: the descriptor is owned by `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_waits_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let first = StateDirLock::acquire(dir.path(), &cancel).await.unwrap();

        let path = dir.path().to_path_buf();
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            StateDirLock::acquire(&path, &waiter_cancel).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn waiting_is_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let _held = StateDirLock::acquire(dir.path(), &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let path = dir.path().to_path_buf();
        let token = waiter_cancel.clone();
        let waiter = tokio::spawn(async move { StateDirLock::acquire(&path, &token).await });

        waiter_cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ProvisionError::Cancelled)));
    }

    #[tokio::test]
    async fn creates_missing_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/state");
        let cancel = CancellationToken::new();

        let _lock = StateDirLock::acquire(&nested, &cancel).await.unwrap();
        assert!(nested.join(LOCK_FILENAME).exists());
    }
}
