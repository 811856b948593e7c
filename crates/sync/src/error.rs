use thiserror::Error;

use crate::atomic::WriteFailure;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The output path was used before `initialize` resolved it.
    #[error("output path is not initialized")]
    NotInitialized,
    #[error("task index export is disabled")]
    Disabled,
    #[error("snapshot write failed: {0}")]
    Write(#[from] WriteFailure),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Write(failure) if failure.retryable)
    }
}
