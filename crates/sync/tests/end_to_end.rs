use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use taskindex_config::IndexConfig;
use taskindex_sync::{
    AiIndexMeta, FlushOutcome, IndexSync, LocalFileSystem, LogNotifier, MemoryTaskSource, Task,
};

fn task(path: &str, line: usize, status: Option<char>, content: &str) -> Task {
    Task {
        parser: "inline".to_string(),
        file_path: path.to_string(),
        line: Some(line),
        status,
        content: content.to_string(),
        ..Task::default()
    }
}

fn sync_in(dir: &TempDir, config: IndexConfig, tasks: Vec<Task>) -> (Arc<MemoryTaskSource>, IndexSync) {
    let source = Arc::new(MemoryTaskSource::new(tasks));
    let fs = Arc::new(LocalFileSystem::new(dir.path()));
    let sync = IndexSync::new(config, source.clone(), fs, Arc::new(LogNotifier));
    (source, sync)
}

fn config() -> IndexConfig {
    IndexConfig {
        include_done: true,
        keep_done_days: 0,
        ..IndexConfig::default()
    }
}

#[tokio::test]
async fn rebuild_writes_ndjson_body_and_meta_sidecar() -> Result<()> {
    let dir = TempDir::new()?;
    let mut invoice = task("notes/a.md", 3, Some('x'), "send invoice");
    invoice.end = Some("2000-01-01".to_string());
    let (_source, sync) = sync_in(
        &dir,
        config(),
        vec![task("notes/a.md", 0, None, "write report #work"), invoice],
    );

    assert_eq!(sync.rebuild_all().await?, FlushOutcome::Written);

    let body = std::fs::read_to_string(dir.path().join(".taskindex/tasks-index.ndjson"))?;
    let rows = body
        .lines()
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], "inline:notes/a.md:L1");
    assert_eq!(rows[0]["status"], "todo");
    assert_eq!(rows[0]["tags"], serde_json::json!(["work"]));
    assert_eq!(rows[1]["status"], "done");
    assert_eq!(rows[1]["end"], "2000-01-01");

    let meta: AiIndexMeta = serde_json::from_str(&std::fs::read_to_string(
        dir.path().join(".taskindex/tasks-index.meta.json"),
    )?)?;
    assert_eq!(meta.task_count, 2);
    assert_eq!(meta.file_count, 1);
    assert!(meta.path_hashes.contains_key("notes/a.md"));
    assert!(meta.last_error.is_none());

    let leftovers = std::fs::read_dir(dir.path().join(".taskindex"))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test]
async fn incremental_write_replaces_body_without_leftovers() -> Result<()> {
    let dir = TempDir::new()?;
    let (source, sync) = sync_in(&dir, config(), vec![task("a.md", 0, None, "first")]);
    sync.start().await?;

    source.set_tasks(vec![task("a.md", 0, None, "second")]);
    sync.schedule_path("a.md").await;
    assert_eq!(sync.flush().await?, FlushOutcome::Written);

    let body = std::fs::read_to_string(dir.path().join(".taskindex/tasks-index.ndjson"))?;
    assert!(body.contains("\"second\""));
    assert!(!body.contains("\"first\""));
    assert!(!dir.path().join(".taskindex/tasks-index.ndjson.bak").exists());

    sync.schedule_path("a.md").await;
    assert_eq!(sync.flush().await?, FlushOutcome::Unchanged);
    Ok(())
}

#[tokio::test]
async fn open_index_file_in_vault_root() -> Result<()> {
    let dir = TempDir::new()?;
    let (_source, sync) = sync_in(
        &dir,
        IndexConfig {
            place_in_root: true,
            ..config()
        },
        Vec::new(),
    );

    let path = sync.open_index_file().await?;
    assert_eq!(path, std::path::Path::new("tasks-index.ndjson"));
    assert_eq!(std::fs::read_to_string(dir.path().join(&path))?, "");
    Ok(())
}
