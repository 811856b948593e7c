use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Debounce bounds accepted by [`IndexConfig::validated`].
pub const MIN_DEBOUNCE_MS: u64 = 100;
pub const MAX_DEBOUNCE_MS: u64 = 5000;

/// Upper bound on per-call write retries.
pub const MAX_WRITE_RETRIES: u32 = 10;

const DEFAULT_FILE_NAME: &str = "tasks-index";
const DEFAULT_FOLDER: &str = ".taskindex";

// ── Index export settings ─────────────────────────────────────────────────────

/// Settings for the exported task index (`[index]` section).
///
/// | Key                     | Effect                                                      |
/// |-------------------------|-------------------------------------------------------------|
/// | `enabled`               | Master switch; disabling tears down timers and output state |
/// | `folder` / `file_name`  | Output location, `<folder>/<file_name>.ndjson`              |
/// | `place_in_root`         | Ignore `folder` and write next to the vault root            |
/// | `debounce_ms`           | Quiet period before a burst of edits is flushed             |
/// | `include_*`             | Inclusion filters applied during normalization              |
/// | `keep_done_days`        | Retention window for completed tasks (`0` = unlimited)      |
/// | `create_backup`         | Keep a `.bak` of the previous artifact during the swap      |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub enabled: bool,
    pub folder: String,
    /// Base name of the artifact pair, without extension.
    pub file_name: String,
    pub place_in_root: bool,
    pub debounce_ms: u64,
    /// Canonical parser kinds to export (`inline`, `frontmatter`, ...).
    pub include_parsers: Vec<String>,
    pub include_done: bool,
    /// Copy the original source line into each exported row.
    pub include_raw: bool,
    pub keep_done_days: u32,
    pub create_backup: bool,
    /// Status characters that count as completed.  `-` maps to cancelled and
    /// `!` to exception when present.
    pub complete_status_chars: Vec<char>,
    pub max_write_retries: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            folder: DEFAULT_FOLDER.to_string(),
            file_name: DEFAULT_FILE_NAME.to_string(),
            place_in_root: false,
            debounce_ms: 500,
            include_parsers: vec!["inline".to_string(), "frontmatter".to_string()],
            include_done: true,
            include_raw: false,
            keep_done_days: 0,
            create_backup: true,
            complete_status_chars: vec!['x', 'X', '-', '!'],
            max_write_retries: 3,
        }
    }
}

impl IndexConfig {
    /// Return a copy with every value brought into its accepted range.
    pub fn validated(&self) -> Self {
        let mut out = self.clone();
        out.debounce_ms = self.debounce_ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS);
        out.max_write_retries = self.max_write_retries.min(MAX_WRITE_RETRIES);

        let mut parsers = Vec::new();
        for name in &self.include_parsers {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() && !parsers.contains(&name) {
                parsers.push(name);
            }
        }
        out.include_parsers = parsers;

        let mut chars = Vec::new();
        for ch in &self.complete_status_chars {
            if !ch.is_whitespace() && !chars.contains(ch) {
                chars.push(*ch);
            }
        }
        out.complete_status_chars = if chars.is_empty() {
            Self::default().complete_status_chars
        } else {
            chars
        };

        let file_name = self.file_name.trim();
        let file_name = file_name.strip_suffix(".ndjson").unwrap_or(file_name);
        out.file_name = if file_name.is_empty() {
            DEFAULT_FILE_NAME.to_string()
        } else {
            file_name.to_string()
        };
        out.folder = self.folder.trim().trim_matches('/').to_string();
        out
    }

    /// Whether the resolved artifact location differs between two configs.
    pub fn output_differs(&self, other: &Self) -> bool {
        self.folder != other.folder
            || self.file_name != other.file_name
            || self.place_in_root != other.place_in_root
    }

    /// Whether the two configs would normalize the same tasks differently.
    pub fn filters_differ(&self, other: &Self) -> bool {
        self.include_parsers != other.include_parsers
            || self.include_done != other.include_done
            || self.include_raw != other.include_raw
            || self.keep_done_days != other.keep_done_days
            || self.complete_status_chars != other.complete_status_chars
    }
}

// ── Vault / telemetry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding the markdown notes and the exported artifacts.
    pub root: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub index: IndexConfig,
    pub vault: VaultConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(root) = env::var("TASKINDEX_VAULT_ROOT") {
            if !root.is_empty() {
                config.vault.root = root;
            }
        }

        if env::var("TASKINDEX_DISABLED").ok().as_deref() == Some("1") {
            config.index.enabled = false;
        }

        config.index = config.index.validated();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn index_defaults() {
        let cfg = IndexConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.debounce_ms, 500);
        assert_eq!(cfg.include_parsers, vec!["inline", "frontmatter"]);
        assert!(cfg.include_done);
        assert!(!cfg.include_raw);
        assert_eq!(cfg.keep_done_days, 0);
        assert!(cfg.create_backup);
        assert_eq!(cfg.file_name, "tasks-index");
    }

    // ── validated ──────────────────────────────────────────────────────────

    #[test]
    fn debounce_is_clamped() {
        let mut cfg = IndexConfig::default();
        cfg.debounce_ms = 5;
        assert_eq!(cfg.validated().debounce_ms, MIN_DEBOUNCE_MS);
        cfg.debounce_ms = 60_000;
        assert_eq!(cfg.validated().debounce_ms, MAX_DEBOUNCE_MS);
        cfg.debounce_ms = 750;
        assert_eq!(cfg.validated().debounce_ms, 750);
    }

    #[test]
    fn parser_names_are_normalized() {
        let mut cfg = IndexConfig::default();
        cfg.include_parsers = vec![
            " Inline ".to_string(),
            "inline".to_string(),
            "".to_string(),
            "FRONTMATTER".to_string(),
        ];
        assert_eq!(cfg.validated().include_parsers, vec!["inline", "frontmatter"]);
    }

    #[test]
    fn blank_file_name_falls_back_and_extension_is_stripped() {
        let mut cfg = IndexConfig::default();
        cfg.file_name = "   ".to_string();
        assert_eq!(cfg.validated().file_name, "tasks-index");
        cfg.file_name = "export.ndjson".to_string();
        assert_eq!(cfg.validated().file_name, "export");
    }

    #[test]
    fn status_chars_deduped_and_never_empty() {
        let mut cfg = IndexConfig::default();
        cfg.complete_status_chars = vec!['x', 'x', ' ', 'd'];
        assert_eq!(cfg.validated().complete_status_chars, vec!['x', 'd']);
        cfg.complete_status_chars = vec![' '];
        assert_eq!(
            cfg.validated().complete_status_chars,
            IndexConfig::default().complete_status_chars
        );
    }

    #[test]
    fn output_and_filter_diffs() {
        let base = IndexConfig::default();
        let mut moved = base.clone();
        moved.folder = "exports".to_string();
        assert!(base.output_differs(&moved));
        assert!(!base.filters_differ(&moved));

        let mut filtered = base.clone();
        filtered.keep_done_days = 7;
        assert!(base.filters_differ(&filtered));
        assert!(!base.output_differs(&filtered));
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.index.file_name, "tasks-index");
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn load_from_partial_toml_fills_defaults_and_validates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[index]
debounce_ms = 20
keep_done_days = 14
complete_status_chars = ["x", "-"]
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.index.debounce_ms, MIN_DEBOUNCE_MS);
        assert_eq!(cfg.index.keep_done_days, 14);
        assert_eq!(cfg.index.complete_status_chars, vec!['x', '-']);
        assert!(cfg.index.create_backup);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.index.folder = "exports/ai".to_string();
        cfg.index.include_raw = true;
        cfg.vault.root = "/tmp/vault".to_string();

        cfg.save_to(&path).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.index.folder, "exports/ai");
        assert!(loaded.index.include_raw);
        assert_eq!(loaded.vault.root, "/tmp/vault");
    }

    #[test]
    fn env_disabled_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(&path, "[index]\nenabled = true\n").unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("TASKINDEX_DISABLED", "1") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert!(!cfg.index.enabled);
        unsafe { env::remove_var("TASKINDEX_DISABLED") };
    }

    #[test]
    fn index_config_serializes_status_chars_as_strings() {
        let cfg = IndexConfig::default();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["complete_status_chars"][0], "x");
    }
}
