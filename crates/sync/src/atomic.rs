//! Crash-safe file replacement on top of [`DurableFileSystem`].
//!
//! Content goes to a uniquely named temp sibling first and is renamed over
//! the destination only once it is known to exist.  When backups are enabled
//! the previous destination is parked at `<name>.bak` during the swap and put
//! back if the swap fails, so readers only ever observe the old or the new
//! content.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fs::DurableFileSystem;

/// A failed write, classified for the retry wrappers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WriteFailure {
    pub message: String,
    pub retryable: bool,
}

impl WriteFailure {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
        }
    }

    pub fn from_io(context: &str, path: &Path, err: &io::Error) -> Self {
        Self {
            message: format!("{context} {}: {err}", path.display()),
            retryable: is_retryable(err),
        }
    }
}

/// Transient lock/busy/permission conditions are worth another attempt.
pub fn is_retryable(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ResourceBusy
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    [
        "busy",
        "lock",
        "permission",
        "eperm",
        "eacces",
        "ebusy",
        "temporarily unavailable",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = file_name(path);
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

pub fn backup_path_for(path: &Path) -> PathBuf {
    let name = file_name(path);
    path.with_file_name(format!("{name}.bak"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string())
}

/// Ensure `dir` exists.  An empty path means the backend root.
pub async fn ensure_dir(fs: &dyn DurableFileSystem, dir: &Path) -> Result<(), WriteFailure> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    fs.create_dir_all(dir)
        .await
        .map_err(|err| WriteFailure::from_io("create directory", dir, &err))
}

/// Replace `path` with `contents` atomically.
pub async fn write_atomic(
    fs: &dyn DurableFileSystem,
    path: &Path,
    contents: &str,
    create_backup: bool,
) -> Result<(), WriteFailure> {
    if let Some(parent) = path.parent() {
        ensure_dir(fs, parent).await?;
    }

    let temp = temp_path_for(path);
    if let Err(err) = fs.write(&temp, contents).await {
        discard(fs, &temp).await;
        return Err(WriteFailure::from_io("write temp file", &temp, &err));
    }

    match fs.exists(&temp).await {
        Ok(true) => {}
        Ok(false) => {
            return Err(WriteFailure::new(
                format!("temp file {} missing after write", temp.display()),
                true,
            ));
        }
        Err(err) => {
            discard(fs, &temp).await;
            return Err(WriteFailure::from_io("verify temp file", &temp, &err));
        }
    }

    let backup = backup_path_for(path);
    if let Err(failure) = swap_into_place(fs, &temp, path, &backup, create_backup).await {
        discard(fs, &temp).await;
        restore_backup(fs, path, &backup).await;
        return Err(failure);
    }

    if create_backup {
        match fs.exists(&backup).await {
            Ok(true) => {
                if let Err(err) = fs.remove(&backup).await {
                    warn!(path = %backup.display(), error = %err, "failed to remove backup after write");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(path = %backup.display(), error = %err, "failed to check backup after write");
            }
        }
    }
    Ok(())
}

async fn swap_into_place(
    fs: &dyn DurableFileSystem,
    temp: &Path,
    path: &Path,
    backup: &Path,
    create_backup: bool,
) -> Result<(), WriteFailure> {
    let destination_exists = fs
        .exists(path)
        .await
        .map_err(|err| WriteFailure::from_io("check destination", path, &err))?;

    if destination_exists && create_backup {
        let stale = fs
            .exists(backup)
            .await
            .map_err(|err| WriteFailure::from_io("check backup", backup, &err))?;
        if stale {
            fs.remove(backup)
                .await
                .map_err(|err| WriteFailure::from_io("remove stale backup", backup, &err))?;
        }
        fs.rename(path, backup)
            .await
            .map_err(|err| WriteFailure::from_io("move destination to backup", path, &err))?;
    }

    fs.rename(temp, path)
        .await
        .map_err(|err| WriteFailure::from_io("rename temp file onto", path, &err))
}

async fn discard(fs: &dyn DurableFileSystem, temp: &Path) {
    if matches!(fs.exists(temp).await, Ok(true)) {
        if let Err(err) = fs.remove(temp).await {
            warn!(path = %temp.display(), error = %err, "failed to remove leftover temp file");
        }
    }
}

async fn restore_backup(fs: &dyn DurableFileSystem, path: &Path, backup: &Path) {
    let destination_missing = matches!(fs.exists(path).await, Ok(false));
    let backup_present = matches!(fs.exists(backup).await, Ok(true));
    if destination_missing && backup_present {
        match fs.rename(backup, path).await {
            Ok(()) => debug!(path = %path.display(), "restored previous artifact from backup"),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "rollback from backup failed");
            }
        }
    }
}

/// [`write_atomic`] with capped exponential retries on retryable failures.
pub async fn write_atomic_with_retry(
    fs: &dyn DurableFileSystem,
    path: &Path,
    contents: &str,
    create_backup: bool,
    policy: &RetryPolicy,
) -> Result<(), WriteFailure> {
    let mut attempt = 0u32;
    loop {
        match write_atomic(fs, path, contents, create_backup).await {
            Ok(()) => return Ok(()),
            Err(failure) if failure.retryable && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "write failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(failure) => return Err(failure),
        }
    }
}
