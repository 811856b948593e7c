//! Snapshot persistence: NDJSON body, pretty JSON sidecar, caller-level
//! backoff and rate-limited failure notices.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::atomic::{RetryPolicy, WriteFailure, write_atomic_with_retry};
use crate::fs::DurableFileSystem;
use crate::output::meta_path_for;
use crate::schema::AiIndexMeta;
use crate::source::Notifier;

/// First caller-level backoff after a failed write.
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);
/// Hard cap for the caller-level backoff.
pub const BACKOFF_MAX: Duration = Duration::from_secs(120);
/// Minimum gap between two user-facing failure notices.
pub const NOTICE_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Serialized rows of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedRows {
    pub lines: Vec<String>,
    pub skipped: usize,
    /// Message of the first row that failed to serialize.
    pub first_error: Option<String>,
}

/// Serialize each row to one JSON line, skipping rows that fail.
pub fn encode_rows<T: Serialize>(rows: &[T]) -> EncodedRows {
    let mut encoded = EncodedRows::default();
    for row in rows {
        match serde_json::to_string(row) {
            Ok(line) => encoded.lines.push(line),
            Err(err) => {
                warn!(error = %err, "skipping task row that failed to serialize");
                encoded.skipped += 1;
                encoded.first_error.get_or_insert_with(|| err.to_string());
            }
        }
    }
    encoded
}

/// Body file content for `lines`; an empty index is an empty file.
pub fn render_body(lines: &[String]) -> String {
    let mut body = String::with_capacity(lines.iter().map(|line| line.len() + 1).sum());
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }
    body
}

/// Caller-level delay after `failure_count` consecutive failures:
/// `BACKOFF_BASE * 2^(failure_count - 1)`, capped at [`BACKOFF_MAX`].
pub fn backoff_delay(failure_count: u32) -> Duration {
    if failure_count == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(failure_count - 1);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

pub struct DurableSnapshotWriter {
    fs: Arc<dyn DurableFileSystem>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    failure_count: u32,
    backoff_until: Option<Instant>,
    last_notice_at: Option<Instant>,
}

impl DurableSnapshotWriter {
    pub fn new(
        fs: Arc<dyn DurableFileSystem>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fs,
            notifier,
            retry,
            failure_count: 0,
            backoff_until: None,
            last_notice_at: None,
        }
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Time left in the current backoff window, if any.
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Forget failures, backoff and notice history.
    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.backoff_until = None;
        self.last_notice_at = None;
    }

    /// Write the body at `output_path` and the sidecar next to it.
    ///
    /// The sidecar is written even when the body fails; its `lastError` then
    /// carries the body failure.
    pub async fn write(
        &mut self,
        lines: &[String],
        mut meta: AiIndexMeta,
        output_path: &Path,
        create_backup: bool,
    ) -> Result<(), WriteFailure> {
        let body = render_body(lines);
        let body_result = write_atomic_with_retry(
            self.fs.as_ref(),
            output_path,
            &body,
            create_backup,
            &self.retry,
        )
        .await;

        if let Err(failure) = &body_result {
            meta.last_error = Some(failure.message.clone());
        }

        let meta_path = meta_path_for(output_path);
        let meta_result = match serde_json::to_string_pretty(&meta) {
            Ok(rendered) => {
                write_atomic_with_retry(
                    self.fs.as_ref(),
                    &meta_path,
                    &rendered,
                    create_backup,
                    &self.retry,
                )
                .await
            }
            Err(err) => Err(WriteFailure::new(
                format!("serialize index metadata: {err}"),
                false,
            )),
        };
        if let Err(failure) = &meta_result {
            warn!(path = %meta_path.display(), error = %failure, "index metadata write failed");
        }

        match body_result.and(meta_result) {
            Ok(()) => {
                if self.failure_count > 0 {
                    info!(
                        failures = self.failure_count,
                        "task index write recovered after failures"
                    );
                }
                self.failure_count = 0;
                self.backoff_until = None;
                debug!(
                    path = %output_path.display(),
                    rows = lines.len(),
                    "task index snapshot written"
                );
                Ok(())
            }
            Err(failure) => {
                self.record_failure(&failure);
                Err(failure)
            }
        }
    }

    fn record_failure(&mut self, failure: &WriteFailure) {
        let now = Instant::now();
        self.failure_count = self.failure_count.saturating_add(1);
        let delay = backoff_delay(self.failure_count);
        self.backoff_until = Some(now + delay);
        warn!(
            failures = self.failure_count,
            backoff_ms = delay.as_millis() as u64,
            retryable = failure.retryable,
            error = %failure,
            "task index write failed"
        );

        let cooled_down = self
            .last_notice_at
            .is_none_or(|at| now.duration_since(at) >= NOTICE_COOLDOWN);
        if cooled_down {
            self.last_notice_at = Some(now);
            self.notifier
                .notify(&format!("Task index export failed: {}", failure.message));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io;
    use std::sync::Mutex;

    use chrono::Utc;
    use serde::Serializer;

    use super::*;
    use crate::fs::{FsOp, MemoryFileSystem};
    use crate::schema::SCHEMA_VERSION;

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn count(&self) -> usize {
            self.messages.lock().unwrap().len()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("value cannot be stringified"))
        }
    }

    #[derive(Serialize)]
    #[serde(untagged)]
    enum Row {
        Good { id: u32 },
        Bad(Unserializable),
    }

    fn meta() -> AiIndexMeta {
        AiIndexMeta {
            version: SCHEMA_VERSION,
            plugin_version: "test".to_string(),
            generated_at: Utc::now(),
            task_count: 1,
            file_count: 1,
            index_hash: "h".to_string(),
            path_hashes: BTreeMap::new(),
            last_error: None,
        }
    }

    fn writer(fs: &Arc<MemoryFileSystem>, notifier: &Arc<RecordingNotifier>) -> DurableSnapshotWriter {
        DurableSnapshotWriter::new(fs.clone(), notifier.clone(), RetryPolicy::with_max_retries(0))
    }

    #[test]
    fn encode_rows_skips_failures_and_keeps_first_error() {
        let rows = vec![
            Row::Good { id: 1 },
            Row::Bad(Unserializable),
            Row::Good { id: 2 },
            Row::Bad(Unserializable),
        ];
        let encoded = encode_rows(&rows);
        assert_eq!(encoded.lines, vec![r#"{"id":1}"#, r#"{"id":2}"#]);
        assert_eq!(encoded.skipped, 2);
        assert_eq!(
            encoded.first_error.as_deref(),
            Some("value cannot be stringified")
        );
    }

    #[test]
    fn body_rendering() {
        assert_eq!(render_body(&[]), "");
        assert_eq!(
            render_body(&["{}".to_string(), "[]".to_string()]),
            "{}\n[]\n"
        );
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        assert_eq!(backoff_delay(1), BACKOFF_BASE);
        assert_eq!(backoff_delay(2), BACKOFF_BASE * 2);
        assert_eq!(backoff_delay(3), BACKOFF_BASE * 4);
        let mut previous = Duration::ZERO;
        for failures in 1..40 {
            let delay = backoff_delay(failures);
            assert!(delay >= previous);
            assert!(delay <= BACKOFF_MAX);
            previous = delay;
        }
        assert_eq!(backoff_delay(39), BACKOFF_MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_body_and_pretty_meta() {
        let fs = Arc::new(MemoryFileSystem::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut writer = writer(&fs, &notifier);

        writer
            .write(
                &[r#"{"id":"a"}"#.to_string()],
                meta(),
                Path::new("out/idx.ndjson"),
                true,
            )
            .await
            .unwrap();

        assert_eq!(fs.get("out/idx.ndjson").as_deref(), Some("{\"id\":\"a\"}\n"));
        let raw_meta = fs.get("out/idx.meta.json").unwrap();
        assert!(raw_meta.contains("\n  \"taskCount\": 1"));
        let parsed: AiIndexMeta = serde_json::from_str(&raw_meta).unwrap();
        assert!(parsed.last_error.is_none());
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn body_failure_is_recorded_in_meta() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.put("out/idx.ndjson", "previous\n");
        fs.fail_next(FsOp::Write, Some("idx.ndjson."), io::ErrorKind::Other, "No space left on device");
        let notifier = Arc::new(RecordingNotifier::default());
        let mut writer = writer(&fs, &notifier);

        let err = writer
            .write(&["{}".to_string()], meta(), Path::new("out/idx.ndjson"), true)
            .await
            .unwrap_err();
        assert!(!err.retryable);

        assert_eq!(fs.get("out/idx.ndjson").as_deref(), Some("previous\n"));
        let parsed: AiIndexMeta =
            serde_json::from_str(&fs.get("out/idx.meta.json").unwrap()).unwrap();
        assert!(parsed.last_error.unwrap().contains("No space left"));
        assert_eq!(writer.failure_count(), 1);
        assert_eq!(writer.backoff_remaining(Instant::now()), Some(BACKOFF_BASE));
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn notices_are_rate_limited_and_backoff_grows() {
        let fs = Arc::new(MemoryFileSystem::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut writer = writer(&fs, &notifier);
        let path = Path::new("idx.ndjson");

        let mut delays = Vec::new();
        for _ in 0..4 {
            fs.fail_next(FsOp::Write, Some("idx.ndjson."), io::ErrorKind::Other, "disk gone");
            writer.write(&[], meta(), path, false).await.unwrap_err();
            delays.push(writer.backoff_remaining(Instant::now()).unwrap());
        }
        assert_eq!(
            delays,
            vec![BACKOFF_BASE, BACKOFF_BASE * 2, BACKOFF_BASE * 4, BACKOFF_BASE * 8]
        );
        assert_eq!(notifier.count(), 1);

        tokio::time::advance(NOTICE_COOLDOWN).await;
        fs.fail_next(FsOp::Write, Some("idx.ndjson."), io::ErrorKind::Other, "disk gone");
        writer.write(&[], meta(), path, false).await.unwrap_err();
        assert_eq!(notifier.count(), 2);

        writer.write(&[], meta(), path, false).await.unwrap();
        assert_eq!(writer.failure_count(), 0);
        assert!(writer.backoff_remaining(Instant::now()).is_none());
        assert_eq!(fs.get("idx.ndjson").as_deref(), Some(""));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_backoff() {
        let fs = Arc::new(MemoryFileSystem::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut writer = writer(&fs, &notifier);
        fs.fail_next(FsOp::Write, None, io::ErrorKind::Other, "disk gone");
        writer
            .write(&[], meta(), Path::new("idx.ndjson"), false)
            .await
            .unwrap_err();
        assert!(writer.backoff_remaining(Instant::now()).is_some());
        writer.reset();
        assert_eq!(writer.failure_count(), 0);
        assert!(writer.backoff_remaining(Instant::now()).is_none());
    }
}
