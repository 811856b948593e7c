//! Markdown vault as a [`TaskSource`].
//!
//! Every `*.md` file under the root is scanned for checkbox lines:
//!
//! ```text
//! - [ ] call the plumber #home start:2024-03-01 due:2024-03-04 ^plumber
//! ```
//!
//! `start:`, `due:` and `done:` tokens become the start, deadline and end
//! dates, a trailing `^id` becomes the block id.  Both are stripped from the
//! content; the untouched line is kept as `raw`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use taskindex_sync::{Task, TaskSource};

const PARSER: &str = "inline";

static CHECKBOX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+\[(.)\]\s+(.*)$").expect("valid checkbox regex")
});
static DATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(start|due|done):(\d{4}-\d{2}-\d{2})\b").expect("valid date regex")
});
static BLOCK_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s\^([A-Za-z0-9-]+)\s*$").expect("valid block id regex"));

pub struct MarkdownVault {
    root: PathBuf,
}

impl MarkdownVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Vault-relative path with `/` separators, if `path` is a note in
    /// this vault.
    pub fn relative_note_path(&self, path: &Path) -> Option<String> {
        relative_note_path(&self.root, path)
    }

    async fn read_note(&self, relative: &str) -> Option<String> {
        match tokio::fs::read_to_string(self.root.join(relative)).await {
            Ok(text) => Some(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %relative, error = %err, "failed to read note");
                None
            }
        }
    }
}

#[async_trait]
impl TaskSource for MarkdownVault {
    async fn tasks(&self) -> Vec<Task> {
        let root = self.root.clone();
        let paths = match tokio::task::spawn_blocking(move || scan_notes(&root)).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(error = %err, "vault scan task failed");
                return Vec::new();
            }
        };

        let mut tasks = Vec::new();
        for path in paths {
            if let Some(text) = self.read_note(&path).await {
                tasks.extend(parse_note(&path, &text));
            }
        }
        debug!(tasks = tasks.len(), root = %self.root.display(), "vault scanned");
        tasks
    }

    async fn tasks_for_path(&self, path: &str) -> Vec<Task> {
        match self.read_note(path).await {
            Some(text) => parse_note(path, &text),
            None => Vec::new(),
        }
    }
}

/// Every visible note under `root`.  Walks synchronously.
fn scan_notes(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable vault entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| relative_note_path(root, entry.path()))
        .collect()
}

fn relative_note_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    if !is_note(relative) || is_hidden_path(relative) {
        return None;
    }
    let parts = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    Some(parts.join("/"))
}

fn is_note(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn is_hidden_path(path: &Path) -> bool {
    path.components()
        .any(|part| part.as_os_str().to_string_lossy().starts_with('.'))
}

/// Checkbox tasks of one note; `line` is 0-based.
pub fn parse_note(path: &str, text: &str) -> Vec<Task> {
    text.lines()
        .enumerate()
        .filter_map(|(line, raw)| parse_line(path, line, raw))
        .collect()
}

fn parse_line(path: &str, line: usize, raw: &str) -> Option<Task> {
    let captures = CHECKBOX.captures(raw)?;
    let status = captures[1].chars().next().filter(|c| *c != ' ');
    let mut content = captures[2].to_string();

    let block_id = BLOCK_ID
        .captures(&content)
        .map(|block| block[1].to_string());
    if block_id.is_some() {
        content = BLOCK_ID.replace(&content, "").to_string();
    }

    let mut task = Task {
        parser: PARSER.to_string(),
        file_path: path.to_string(),
        line: Some(line),
        status,
        block_id,
        raw: Some(raw.to_string()),
        ..Task::default()
    };
    for token in DATE_TOKEN.captures_iter(&content) {
        let date = token[2].to_string();
        match &token[1] {
            "start" => task.start = Some(date),
            "due" => task.deadline = Some(date),
            _ => task.end = Some(date),
        }
    }
    task.content = DATE_TOKEN.replace_all(&content, "").trim().to_string();
    Some(task)
}
