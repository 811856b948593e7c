//! Storage capability used by the write pipeline.
//!
//! All paths are relative to the backend's root.  [`LocalFileSystem`] maps
//! them onto a directory on disk; [`MemoryFileSystem`] keeps everything in a
//! map and can inject faults for tests.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

mod memory;

pub use memory::{FaultAction, FsOp, MemoryFileSystem};

#[async_trait]
pub trait DurableFileSystem: Send + Sync {
    /// Recursive and idempotent: existing directories are not an error.
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    async fn exists(&self, path: &Path) -> io::Result<bool>;
    async fn read(&self, path: &Path) -> io::Result<String>;
    /// Create or truncate `path` and write `contents` to it.
    async fn write(&self, path: &Path, contents: &str) -> io::Result<()>;
    /// Move `from` onto `to`, replacing `to` when it exists.
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [`DurableFileSystem`] over a real directory, using `tokio::fs`.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl DurableFileSystem for LocalFileSystem {
    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::create_dir_all(self.resolve(path)).await {
            Ok(()) => Ok(()),
            // Lost a race with a concurrent creator.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::try_exists(self.resolve(path)).await
    }

    async fn read(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(self.resolve(path)).await
    }

    async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.resolve(path))
            .await?;
        file.write_all(contents.as_bytes()).await?;
        // Flush userspace buffers and sync to disk before any rename.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(self.resolve(from), self.resolve(to)).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(self.resolve(path)).await
    }
}
