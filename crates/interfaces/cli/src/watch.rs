//! Filesystem watcher feeding note changes into the scheduler.

use std::path::Path;

use anyhow::Result;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use taskindex_sync::IndexSync;

use crate::vault::MarkdownVault;

/// Watch `root` until ctrl-c, then flush whatever is still pending.
pub async fn run(sync: IndexSync, vault: &MarkdownVault, root: &Path) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();
    let mut watcher = notify::RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => warn!(error = %err, "filesystem watcher error"),
        },
        notify::Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    info!(root = %root.display(), "watching vault for task changes");

    loop {
        tokio::select! {
            Some(event) = rx.recv() => dispatch(&sync, vault, event).await,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down watcher");
                break;
            }
        }
    }

    drop(watcher);
    if let Err(err) = sync.flush().await {
        warn!(error = %err, "final flush failed");
    }
    sync.dispose().await;
    Ok(())
}

async fn dispatch(sync: &IndexSync, vault: &MarkdownVault, event: notify::Event) {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
        return;
    }
    for path in event.paths {
        let Some(relative) = vault.relative_note_path(&path) else {
            continue;
        };
        if exists(&path).await {
            sync.schedule_path(relative).await;
        } else {
            debug!(path = %relative, "note removed");
            sync.schedule_delete_path(relative).await;
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
