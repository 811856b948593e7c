//! Resolution and preparation of the artifact location.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use taskindex_config::IndexConfig;

use crate::atomic::{ensure_dir, is_retryable};
use crate::error::SyncError;
use crate::fs::DurableFileSystem;

pub const BODY_EXTENSION: &str = "ndjson";
pub const META_SUFFIX: &str = ".meta.json";

const PROBE_ATTEMPTS: u32 = 3;
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Outcome of [`OutputPathResolver::reinitialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTransition {
    pub path_changed: bool,
    pub old_path: Option<PathBuf>,
    pub new_path: PathBuf,
    /// Cached per-path state describes the old artifact and must be rebuilt.
    pub requires_rebuild: bool,
}

/// Body path for `config`: `<folder>/<file_name>.ndjson`, or the bare file
/// name when placed in the root.
pub fn resolve_output_path(config: &IndexConfig) -> PathBuf {
    let file = format!("{}.{BODY_EXTENSION}", config.file_name);
    if config.place_in_root || config.folder.is_empty() {
        PathBuf::from(file)
    } else {
        Path::new(&config.folder).join(file)
    }
}

/// Sidecar path next to `body`: `x.ndjson` becomes `x.meta.json`.
pub fn meta_path_for(body: &Path) -> PathBuf {
    let stem = body
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "index".to_string());
    body.with_file_name(format!("{stem}{META_SUFFIX}"))
}

pub struct OutputPathResolver {
    fs: Arc<dyn DurableFileSystem>,
    current: Option<PathBuf>,
}

impl OutputPathResolver {
    pub fn new(fs: Arc<dyn DurableFileSystem>) -> Self {
        Self { fs, current: None }
    }

    pub async fn initialize(&mut self, config: &IndexConfig) -> PathBuf {
        let path = resolve_output_path(config);
        self.prepare(&path).await;
        info!(path = %path.display(), "task index output initialized");
        self.current = Some(path.clone());
        path
    }

    pub async fn reinitialize(&mut self, config: &IndexConfig) -> PathTransition {
        let old_path = self.current.clone();
        let new_path = resolve_output_path(config);
        self.prepare(&new_path).await;
        self.current = Some(new_path.clone());

        let path_changed = old_path.as_ref() != Some(&new_path);
        if path_changed {
            info!(
                old = ?old_path.as_ref().map(|path| path.display().to_string()),
                new = %new_path.display(),
                "task index output moved"
            );
        }
        PathTransition {
            path_changed,
            old_path,
            new_path,
            requires_rebuild: path_changed,
        }
    }

    pub fn current_path(&self) -> Result<&Path, SyncError> {
        self.current.as_deref().ok_or(SyncError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.current.is_some()
    }

    pub fn dispose(&mut self) {
        self.current = None;
    }

    async fn prepare(&self, path: &Path) {
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        if let Err(failure) = ensure_dir(self.fs.as_ref(), dir).await {
            warn!(dir = %dir.display(), error = %failure, "could not create output directory");
            return;
        }
        if !self.probe_writable(dir).await {
            // The write path retries on its own; a failed probe is only a hint.
            warn!(dir = %dir.display(), "output directory failed the writability probe");
        }
    }

    /// Write and delete a uniquely named marker in `dir`.
    async fn probe_writable(&self, dir: &Path) -> bool {
        let marker = dir.join(format!(".probe-{}.tmp", Uuid::new_v4().simple()));
        for attempt in 1..=PROBE_ATTEMPTS {
            let result = match self.fs.write(&marker, "").await {
                Ok(()) => self.fs.remove(&marker).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => return true,
                Err(err) if is_retryable(&err) && attempt < PROBE_ATTEMPTS => {
                    debug!(attempt, error = %err, "writability probe busy; retrying");
                    tokio::time::sleep(PROBE_RETRY_DELAY * attempt).await;
                }
                Err(err) => {
                    debug!(error = %err, "writability probe failed");
                    if matches!(self.fs.exists(&marker).await, Ok(true)) {
                        if let Err(err) = self.fs.remove(&marker).await {
                            debug!(
                                path = %marker.display(),
                                error = %err,
                                "failed to remove writability probe marker"
                            );
                        }
                    }
                    return false;
                }
            }
        }
        false
    }
}
