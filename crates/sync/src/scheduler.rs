//! Change scheduling and orchestration of the export pipeline.
//!
//! Edit and delete notifications accumulate in two mutually exclusive pending
//! sets behind a single debounce [`Timer`].  When it fires, each pending path
//! is re-read from the [`TaskSource`], normalized and diffed against the
//! [`IndexStore`]; only an actual change triggers a snapshot write.
//!
//! Two locks split the state: the scheduler lock guards pending sets, timers
//! and config and is only held briefly; the pipeline lock guards the store,
//! writer and output path and is held for a whole flush, so it doubles as the
//! single-writer guard for the artifact.  The pipeline lock is never acquired
//! while the scheduler lock is held.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskindex_config::IndexConfig;

use crate::atomic::{RetryPolicy, WriteFailure, write_atomic};
use crate::error::SyncError;
use crate::fs::DurableFileSystem;
use crate::normalize::{NormalizeOptions, normalize_tasks};
use crate::output::OutputPathResolver;
use crate::source::{Notifier, TaskSource};
use crate::store::{IndexStore, PathUpdate};
use crate::timer::{Timer, TimerTask};
use crate::writer::DurableSnapshotWriter;

/// What a flush, rebuild or retry ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending, or the export is disabled.
    Idle,
    /// Pending paths normalized to what was already indexed.
    Unchanged,
    Written,
    /// Inside a failure backoff window; a single retry is scheduled.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub enabled: bool,
    pub initialized: bool,
    pub file_count: usize,
    pub task_count: usize,
    pub pending_paths: usize,
    pub consecutive_failures: u32,
    pub flushes: u64,
    pub writes: u64,
    pub output_path: Option<PathBuf>,
}

struct SchedulerState {
    config: IndexConfig,
    disposed: bool,
    pending_changed: BTreeSet<String>,
    pending_deleted: BTreeSet<String>,
    debounce: Timer,
    retry: Timer,
    flushes: u64,
}

impl SchedulerState {
    fn accepting(&self) -> bool {
        self.config.enabled && !self.disposed
    }

    fn clear_pending(&mut self) {
        self.debounce.cancel();
        self.retry.cancel();
        self.pending_changed.clear();
        self.pending_deleted.clear();
    }
}

struct Pipeline {
    store: IndexStore,
    writer: DurableSnapshotWriter,
    output: OutputPathResolver,
    /// A full rebuild has completed since startup or the last invalidation.
    initialized: bool,
    writes: u64,
}

struct Inner {
    source: Arc<dyn TaskSource>,
    fs: Arc<dyn DurableFileSystem>,
    plugin_version: String,
    scheduler: Mutex<SchedulerState>,
    pipeline: Mutex<Pipeline>,
}

/// Handle to the incremental index synchronizer.  Clones share state.
#[derive(Clone)]
pub struct IndexSync {
    inner: Arc<Inner>,
}

impl IndexSync {
    pub fn new(
        config: IndexConfig,
        source: Arc<dyn TaskSource>,
        fs: Arc<dyn DurableFileSystem>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = config.validated();
        let writer = DurableSnapshotWriter::new(
            fs.clone(),
            notifier,
            RetryPolicy::with_max_retries(config.max_write_retries),
        );
        let pipeline = Pipeline {
            store: IndexStore::new(),
            writer,
            output: OutputPathResolver::new(fs.clone()),
            initialized: false,
            writes: 0,
        };
        let scheduler = SchedulerState {
            config,
            disposed: false,
            pending_changed: BTreeSet::new(),
            pending_deleted: BTreeSet::new(),
            debounce: Timer::new(),
            retry: Timer::new(),
            flushes: 0,
        };

        Self {
            inner: Arc::new(Inner {
                source,
                fs,
                plugin_version: env!("CARGO_PKG_VERSION").to_string(),
                scheduler: Mutex::new(scheduler),
                pipeline: Mutex::new(pipeline),
            }),
        }
    }

    /// Resolve the output path and run the initial full build.
    pub async fn start(&self) -> Result<FlushOutcome, SyncError> {
        let config = {
            let mut state = self.inner.scheduler.lock().await;
            state.disposed = false;
            state.config.clone()
        };
        if !config.enabled {
            info!("task index export disabled; not starting");
            return Ok(FlushOutcome::Idle);
        }

        let mut pipeline = self.inner.pipeline.lock().await;
        pipeline.output.initialize(&config).await;
        self.rebuild_locked(&mut pipeline, &config).await
    }

    pub async fn schedule_path(&self, path: impl Into<String>) {
        let path = path.into();
        let mut state = self.inner.scheduler.lock().await;
        if !state.accepting() {
            return;
        }
        state.pending_deleted.remove(&path);
        debug!(path = %path, "path scheduled for reindex");
        state.pending_changed.insert(path);
        self.arm_debounce(&mut state);
    }

    pub async fn schedule_delete_path(&self, path: impl Into<String>) {
        let path = path.into();
        let mut state = self.inner.scheduler.lock().await;
        if !state.accepting() {
            return;
        }
        state.pending_changed.remove(&path);
        debug!(path = %path, "path scheduled for removal");
        state.pending_deleted.insert(path);
        self.arm_debounce(&mut state);
    }

    fn arm_debounce(&self, state: &mut SchedulerState) {
        let delay = Duration::from_millis(state.config.debounce_ms);
        state
            .debounce
            .arm(delay, deferred_flush(Arc::downgrade(&self.inner)));
    }

    /// Process everything pending now.  Normally driven by the debounce timer.
    pub async fn flush(&self) -> Result<FlushOutcome, SyncError> {
        let (config, changed, deleted) = {
            let mut state = self.inner.scheduler.lock().await;
            state.debounce.cancel();
            if !state.accepting() {
                state.pending_changed.clear();
                state.pending_deleted.clear();
                return Ok(FlushOutcome::Idle);
            }
            if state.pending_changed.is_empty() && state.pending_deleted.is_empty() {
                return Ok(FlushOutcome::Idle);
            }
            state.flushes += 1;
            (
                state.config.clone(),
                std::mem::take(&mut state.pending_changed),
                std::mem::take(&mut state.pending_deleted),
            )
        };

        let mut pipeline = self.inner.pipeline.lock().await;
        if !pipeline.initialized {
            // Events seen before the first full build are not trustworthy diffs.
            info!(
                changed = changed.len(),
                deleted = deleted.len(),
                "index not built yet; running full rebuild"
            );
            return self.rebuild_locked(&mut pipeline, &config).await;
        }

        let options = NormalizeOptions::from_config(&config, Utc::now());
        let mut dirty = false;
        for path in &deleted {
            if pipeline.store.remove_path(path) {
                debug!(path = %path, "path removed from index");
                dirty = true;
            }
        }
        for path in changed.iter().filter(|path| !deleted.contains(*path)) {
            let tasks = self.inner.source.tasks_for_path(path).await;
            let rows = normalize_tasks(&tasks, &options)
                .remove(path.as_str())
                .unwrap_or_default();
            if pipeline.store.apply_incremental(path, PathUpdate::Tasks(rows)) {
                debug!(path = %path, "path changed");
                dirty = true;
            }
        }

        if !dirty {
            debug!(paths = changed.len() + deleted.len(), "flush found no changes");
            return Ok(FlushOutcome::Unchanged);
        }
        self.write_locked(&mut pipeline, &config).await
    }

    /// Re-read every task from the source and rewrite the artifact.
    pub async fn rebuild_all(&self) -> Result<FlushOutcome, SyncError> {
        let config = {
            let mut state = self.inner.scheduler.lock().await;
            if !state.accepting() {
                return Err(SyncError::Disabled);
            }
            state.debounce.cancel();
            state.pending_changed.clear();
            state.pending_deleted.clear();
            state.config.clone()
        };

        let mut pipeline = self.inner.pipeline.lock().await;
        self.rebuild_locked(&mut pipeline, &config).await
    }

    /// Apply new settings.
    ///
    /// Any change drops pending work and timers.  Disabling tears down the
    /// output state; re-enabling, moving the output, changing filters or
    /// dropping pending edits forces a full rebuild.  An unwritten snapshot
    /// left by an earlier failure is written again or re-scheduled.
    pub async fn update_settings(&self, config: IndexConfig) -> Result<FlushOutcome, SyncError> {
        let new = config.validated();
        let (old, had_pending) = {
            let mut state = self.inner.scheduler.lock().await;
            if state.config == new {
                return Ok(FlushOutcome::Idle);
            }
            let had_pending =
                !state.pending_changed.is_empty() || !state.pending_deleted.is_empty();
            state.clear_pending();
            (std::mem::replace(&mut state.config, new.clone()), had_pending)
        };

        let mut pipeline = self.inner.pipeline.lock().await;
        pipeline
            .writer
            .set_retry_policy(RetryPolicy::with_max_retries(new.max_write_retries));

        if !new.enabled {
            pipeline.output.dispose();
            pipeline.writer.reset();
            pipeline.store.clear();
            pipeline.initialized = false;
            info!("task index export disabled");
            return Ok(FlushOutcome::Idle);
        }

        let re_enabled = !old.enabled;
        if re_enabled || old.output_differs(&new) || !pipeline.output.is_initialized() {
            let transition = pipeline.output.reinitialize(&new).await;
            if transition.requires_rebuild || re_enabled {
                pipeline.writer.reset();
                pipeline.initialized = false;
            }
        }
        if old.filters_differ(&new) || had_pending {
            pipeline.initialized = false;
        }

        if pipeline.initialized {
            if pipeline.writer.failure_count() > 0 {
                // The cleared retry timer was the only route to a rewrite.
                return self.write_locked(&mut pipeline, &new).await;
            }
            return Ok(FlushOutcome::Idle);
        }
        if self.inner.scheduler.lock().await.disposed {
            return Ok(FlushOutcome::Idle);
        }
        self.rebuild_locked(&mut pipeline, &new).await
    }

    /// Path of the body file, creating an empty one when none exists yet.
    pub async fn open_index_file(&self) -> Result<PathBuf, SyncError> {
        let config = {
            let state = self.inner.scheduler.lock().await;
            if !state.accepting() {
                return Err(SyncError::Disabled);
            }
            state.config.clone()
        };

        let mut pipeline = self.inner.pipeline.lock().await;
        if !pipeline.output.is_initialized() {
            pipeline.output.initialize(&config).await;
        }
        let path = pipeline.output.current_path()?.to_path_buf();
        let exists = self
            .inner
            .fs
            .exists(&path)
            .await
            .map_err(|err| WriteFailure::from_io("check index file", &path, &err))?;
        if !exists {
            write_atomic(self.inner.fs.as_ref(), &path, "", false).await?;
            info!(path = %path.display(), "created empty task index");
        }
        Ok(path)
    }

    /// Cancel timers, drop pending work and release the output path.
    pub async fn dispose(&self) {
        {
            let mut state = self.inner.scheduler.lock().await;
            state.disposed = true;
            state.clear_pending();
        }
        let mut pipeline = self.inner.pipeline.lock().await;
        pipeline.output.dispose();
        pipeline.initialized = false;
        debug!("task index sync disposed");
    }

    pub async fn status(&self) -> SyncStats {
        let (enabled, pending_paths, flushes) = {
            let state = self.inner.scheduler.lock().await;
            (
                state.accepting(),
                state.pending_changed.len() + state.pending_deleted.len(),
                state.flushes,
            )
        };
        let pipeline = self.inner.pipeline.lock().await;
        SyncStats {
            enabled,
            initialized: pipeline.initialized,
            file_count: pipeline.store.file_count(),
            task_count: pipeline.store.task_count(),
            pending_paths,
            consecutive_failures: pipeline.writer.failure_count(),
            flushes,
            writes: pipeline.writes,
            output_path: pipeline
                .output
                .current_path()
                .ok()
                .map(|path| path.to_path_buf()),
        }
    }

    async fn write_pending(&self) -> Result<FlushOutcome, SyncError> {
        let config = {
            let state = self.inner.scheduler.lock().await;
            if !state.accepting() {
                return Ok(FlushOutcome::Idle);
            }
            state.config.clone()
        };
        let mut pipeline = self.inner.pipeline.lock().await;
        if !pipeline.initialized {
            return Ok(FlushOutcome::Idle);
        }
        self.write_locked(&mut pipeline, &config).await
    }

    async fn rebuild_locked(
        &self,
        pipeline: &mut Pipeline,
        config: &IndexConfig,
    ) -> Result<FlushOutcome, SyncError> {
        if !pipeline.output.is_initialized() {
            pipeline.output.initialize(config).await;
        }
        let tasks = self.inner.source.tasks().await;
        let options = NormalizeOptions::from_config(config, Utc::now());
        pipeline
            .store
            .apply_full_rebuild(normalize_tasks(&tasks, &options));
        pipeline.initialized = true;
        info!(
            files = pipeline.store.file_count(),
            tasks = pipeline.store.task_count(),
            "task index rebuilt"
        );
        self.write_locked(pipeline, config).await
    }

    async fn write_locked(
        &self,
        pipeline: &mut Pipeline,
        config: &IndexConfig,
    ) -> Result<FlushOutcome, SyncError> {
        if let Some(remaining) = pipeline.writer.backoff_remaining(Instant::now()) {
            debug!(
                remaining_ms = remaining.as_millis() as u64,
                "write deferred until backoff elapses"
            );
            self.arm_retry(remaining).await;
            return Ok(FlushOutcome::Deferred);
        }

        let path = pipeline.output.current_path()?.to_path_buf();
        let snapshot = pipeline.store.snapshot();
        if snapshot.skipped_rows > 0 {
            warn!(
                skipped = snapshot.skipped_rows,
                "some task rows could not be serialized"
            );
        }
        let meta = snapshot.meta(&self.inner.plugin_version, Utc::now());
        match pipeline
            .writer
            .write(&snapshot.lines, meta, &path, config.create_backup)
            .await
        {
            Ok(()) => {
                pipeline.writes += 1;
                Ok(FlushOutcome::Written)
            }
            Err(failure) => {
                if let Some(delay) = pipeline.writer.backoff_remaining(Instant::now()) {
                    self.arm_retry(delay).await;
                }
                Err(failure.into())
            }
        }
    }

    async fn arm_retry(&self, delay: Duration) {
        let mut state = self.inner.scheduler.lock().await;
        if !state.accepting() {
            return;
        }
        state
            .retry
            .arm(delay, deferred_write(Arc::downgrade(&self.inner)));
    }
}

fn deferred_flush(inner: Weak<Inner>) -> TimerTask {
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(err) = (IndexSync { inner }).flush().await {
            warn!(error = %err, "debounced flush failed");
        }
    })
}

fn deferred_write(inner: Weak<Inner>) -> TimerTask {
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(err) = (IndexSync { inner }).write_pending().await {
            warn!(error = %err, "scheduled index write retry failed");
        }
    })
}
