//! Canonical task normalization, inclusion filters and content hashing.
//!
//! Every exported row is a pure function of the incoming [`Task`] and the
//! [`NormalizeOptions`].  Hashes are computed over an ordered tuple rather
//! than a keyed JSON object so field order can never change a digest.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Days, NaiveDate, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::warn;

use taskindex_config::IndexConfig;

use crate::schema::{NormalizedTask, Task, TaskStatus};

/// Status character that maps to [`TaskStatus::Cancelled`] when it is part of
/// the complete set.
pub const CANCELLED_CHAR: char = '-';
/// Status character that maps to [`TaskStatus::Exception`] when it is part of
/// the complete set.
pub const EXCEPTION_CHAR: char = '!';

/// Anchor used for file-level records.
pub const ROOT_ANCHOR: &str = "root";

static INLINE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)#([\p{L}\p{N}_/-]+)").expect("inline tag pattern is valid")
});

static TRAILING_BLOCK_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s\^([A-Za-z0-9-]+)\s*$").expect("block id pattern is valid")
});

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub complete_status_chars: BTreeSet<char>,
    pub include_parsers: BTreeSet<String>,
    pub include_done: bool,
    pub include_raw: bool,
    /// `0` keeps completed tasks forever.
    pub keep_done_days: u32,
    pub snapshot_at: DateTime<Utc>,
}

impl NormalizeOptions {
    pub fn from_config(config: &IndexConfig, snapshot_at: DateTime<Utc>) -> Self {
        Self {
            complete_status_chars: config.complete_status_chars.iter().copied().collect(),
            include_parsers: config.include_parsers.iter().cloned().collect(),
            include_done: config.include_done,
            include_raw: config.include_raw,
            keep_done_days: config.keep_done_days,
            snapshot_at,
        }
    }
}

/// Normalize a batch and group surviving rows by source path.
///
/// Paths whose tasks are all filtered out do not appear in the result.  Within
/// a path rows are ordered by line (line-less rows last), then by id.
pub fn normalize_tasks(
    tasks: &[Task],
    options: &NormalizeOptions,
) -> BTreeMap<String, Vec<NormalizedTask>> {
    let mut grouped: BTreeMap<String, Vec<NormalizedTask>> = BTreeMap::new();
    let mut positions: HashMap<(String, String), usize> = HashMap::new();

    for task in tasks {
        let Some(normalized) = normalize_task(task, options) else {
            continue;
        };

        let rows = grouped.entry(normalized.source_path.clone()).or_default();
        let key = (normalized.source_path.clone(), normalized.id.clone());
        match positions.get(&key) {
            Some(&at) => {
                warn!(
                    id = %normalized.id,
                    path = %normalized.source_path,
                    "duplicate task id in batch; keeping the later record"
                );
                rows[at] = normalized;
            }
            None => {
                positions.insert(key, rows.len());
                rows.push(normalized);
            }
        }
    }

    for rows in grouped.values_mut() {
        sort_rows(rows);
    }
    grouped
}

/// Normalize a single record, returning `None` when a filter excludes it.
pub fn normalize_task(task: &Task, options: &NormalizeOptions) -> Option<NormalizedTask> {
    let parser = canonical_parser(&task.parser);
    if !options.include_parsers.contains(&parser) {
        return None;
    }

    let status = resolve_status(task.status, &options.complete_status_chars);
    if !status.is_open() {
        if !options.include_done {
            return None;
        }
        if options.keep_done_days > 0 && is_past_retention(task, options) {
            return None;
        }
    }

    let source_path = task.file_path.clone();
    let content = match task.content.trim() {
        "" => base_name(&source_path),
        text => text.to_string(),
    };
    let tags = resolve_tags(&task.tags, &content);
    let anchor = resolve_anchor(task, &parser);
    let start = clean_date(task.start.as_deref());
    let end = clean_date(task.end.as_deref());
    let deadline = clean_date(task.deadline.as_deref());
    let raw = if options.include_raw {
        task.raw.clone()
    } else {
        None
    };

    let id = format!("{parser}:{source_path}:{anchor}");
    let content_hash = hash_fields(&(
        &parser,
        &source_path,
        &anchor,
        status.as_str(),
        &content,
        &start,
        &end,
        &deadline,
        &tags,
        &raw,
    ));

    Some(NormalizedTask {
        id,
        content_hash,
        parser,
        source_path,
        locator: anchor,
        status,
        content,
        start,
        end,
        deadline,
        tags,
        raw,
        line: task.line,
    })
}

/// Hash over the sorted `id:contentHash` pairs of one path.
pub fn hash_tasks_for_path(tasks: &[NormalizedTask]) -> String {
    let mut pairs = tasks
        .iter()
        .map(|task| format!("{}:{}", task.id, task.content_hash))
        .collect::<Vec<_>>();
    pairs.sort();
    hash_text(&pairs.join("\n"))
}

/// Hash over the sorted `path:hash` pairs of the whole index.
pub fn hash_index(path_hashes: &BTreeMap<String, String>) -> String {
    let joined = path_hashes
        .iter()
        .map(|(path, hash)| format!("{path}:{hash}"))
        .collect::<Vec<_>>()
        .join("\n");
    hash_text(&joined)
}

/// SHA-256 hex digest of `raw`.
pub fn hash_text(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn hash_fields<T: serde::Serialize>(fields: &T) -> String {
    // Tuples of strings, options and string vectors always serialize.
    let encoded = serde_json::to_string(fields).unwrap_or_default();
    hash_text(&encoded)
}

/// Map an internal parser identifier onto its exported kind.
pub fn canonical_parser(parser: &str) -> String {
    let key = parser.trim().to_ascii_lowercase();
    match key.as_str() {
        "" => "unknown".to_string(),
        "inline" | "inline-task" | "inlinetask" | "inline_task" | "markdown" | "line" => {
            "inline".to_string()
        }
        "frontmatter" | "file" | "file-metadata" | "filemetadata" | "file_metadata"
        | "file-task" | "filetask" | "yaml" => "frontmatter".to_string(),
        _ => key,
    }
}

fn resolve_status(status: Option<char>, complete: &BTreeSet<char>) -> TaskStatus {
    match status {
        None => TaskStatus::Todo,
        Some(ch) if ch.is_whitespace() => TaskStatus::Todo,
        Some(ch) if complete.contains(&ch) => match ch {
            CANCELLED_CHAR => TaskStatus::Cancelled,
            EXCEPTION_CHAR => TaskStatus::Exception,
            _ => TaskStatus::Done,
        },
        Some(_) => TaskStatus::Unknown,
    }
}

fn is_past_retention(task: &Task, options: &NormalizeOptions) -> bool {
    let Some(cutoff) = options
        .snapshot_at
        .date_naive()
        .checked_sub_days(Days::new(u64::from(options.keep_done_days)))
    else {
        return false;
    };

    let reference = [&task.end, &task.start, &task.deadline]
        .into_iter()
        .find_map(|value| value.as_deref().and_then(date_part));
    match reference {
        Some(date) => date < cutoff,
        None => false,
    }
}

/// Parse the leading `YYYY-MM-DD` of an ISO date or date-time.
fn date_part(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let head = value.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn clean_date(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn resolve_tags(own: &[String], content: &str) -> Vec<String> {
    let mut tags = BTreeSet::new();
    if own.is_empty() {
        for capture in INLINE_TAG.captures_iter(content) {
            tags.insert(capture[1].to_string());
        }
    } else {
        for tag in own {
            let tag = tag.trim().trim_start_matches('#');
            if !tag.is_empty() {
                tags.insert(tag.to_string());
            }
        }
    }
    tags.into_iter().collect()
}

fn resolve_anchor(task: &Task, parser: &str) -> String {
    let explicit_block = task
        .block_id
        .as_deref()
        .map(|id| id.trim().trim_start_matches('^'))
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let block = explicit_block.or_else(|| {
        task.raw
            .as_deref()
            .and_then(|raw| TRAILING_BLOCK_ID.captures(raw))
            .map(|capture| capture[1].to_string())
    });
    if let Some(block) = block {
        return format!("^{block}");
    }

    if let Some(target) = task
        .timer_target
        .as_deref()
        .map(str::trim)
        .filter(|target| !target.is_empty())
    {
        return format!("timer:{target}");
    }

    if parser == "frontmatter" {
        return ROOT_ANCHOR.to_string();
    }

    match task.line {
        Some(line) => format!("L{}", line + 1),
        None => ROOT_ANCHOR.to_string(),
    }
}

fn sort_rows(rows: &mut [NormalizedTask]) {
    rows.sort_by(|left, right| match (left.line, right.line) {
        (Some(a), Some(b)) => a.cmp(&b).then_with(|| left.id.cmp(&right.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => left.id.cmp(&right.id),
    });
}
