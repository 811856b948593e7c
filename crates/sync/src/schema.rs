use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bumped whenever the row or sidecar layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// A task record as handed over by the host's task source.
///
/// The core never parses note text itself; every field here has already been
/// extracted by the host parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    /// Internal parser identifier, e.g. `inline-task` or `file-metadata`.
    pub parser: String,
    pub file_path: String,
    /// Zero-based line of the task inside its file, when line-addressable.
    pub line: Option<usize>,
    /// Single status character between the checkbox brackets; `None` or a
    /// blank character means open.
    pub status: Option<char>,
    pub content: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub deadline: Option<String>,
    pub tags: Vec<String>,
    /// Explicit `^block-id` marker carried by the line.
    pub block_id: Option<String>,
    /// Explicit timer-target marker attached by the host.
    pub timer_target: Option<String>,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Done,
    Cancelled,
    Exception,
    Unknown,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Exception => "exception",
            Self::Unknown => "unknown",
        }
    }

    /// Open statuses survive the `include_done` and retention filters.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Todo | Self::Unknown)
    }
}

/// One row of the exported index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTask {
    pub id: String,
    pub content_hash: String,
    pub parser: String,
    pub source_path: String,
    pub locator: String,
    pub status: TaskStatus,
    pub content: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub deadline: Option<String>,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Zero-based source line, kept only for in-memory ordering.
    #[serde(skip)]
    pub line: Option<usize>,
}

/// Sidecar written next to the body file on every write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiIndexMeta {
    pub version: u32,
    pub plugin_version: String,
    pub generated_at: DateTime<Utc>,
    pub task_count: usize,
    pub file_count: usize,
    pub index_hash: String,
    pub path_hashes: BTreeMap<String, String>,
    pub last_error: Option<String>,
}
