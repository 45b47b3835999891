//! # Project Configuration
//!
//! Loading, validation, and mutation of the per-project configuration,
//! persisted as TOML inside the project's storage directory. Every field has
//! a serde default so partially written files stay loadable, and presets
//! seed the ignore rule sets for common ecosystems.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STORAGE_DIR: &str = ".gencodedoc";
pub const CONFIG_FILE: &str = "config.toml";
pub const DB_FILE: &str = "gencodedoc.db";

/// Top-level configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project_name: String,

    #[serde(default)]
    pub project_path: String,

    /// Storage directory name under the project root.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    #[serde(default)]
    pub ignore: IgnoreConfig,

    #[serde(default)]
    pub autosave: AutosaveConfig,

    #[serde(default)]
    pub diff_format: DiffFormatConfig,

    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    /// Zstd compression level (1–22).
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IgnoreConfig {
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutosaveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: AutosaveModeKind,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub diff_threshold: DiffThresholdConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AutosaveModeKind::default(),
            timer: TimerConfig::default(),
            diff_threshold: DiffThresholdConfig::default(),
            hybrid: HybridConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutosaveModeKind {
    Timer,
    Diff,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Seconds between automatic snapshots.
    #[serde(default = "default_timer_interval")]
    pub interval: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            interval: default_timer_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffThresholdConfig {
    /// Significance at or above which a snapshot is cut.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Seconds between dirty-flag checks.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default)]
    pub ignore_whitespace: bool,
    #[serde(default)]
    pub ignore_comments: bool,
}

impl Default for DiffThresholdConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            check_interval: default_check_interval(),
            ignore_whitespace: false,
            ignore_comments: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default = "default_hybrid_min")]
    pub min_interval: u64,
    #[serde(default = "default_hybrid_max")]
    pub max_interval: u64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            min_interval: default_hybrid_min(),
            max_interval: default_hybrid_max(),
            threshold: default_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Newest autosaves kept after each trigger.
    #[serde(default = "default_max_autosaves")]
    pub max_autosaves: usize,
    /// Advisory; recorded but not acted on.
    #[serde(default)]
    pub compress_after_days: u32,
    /// Autosaves older than this are dropped (0 disables).
    #[serde(default)]
    pub delete_after_days: u32,
    #[serde(default = "default_true")]
    pub keep_manual: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_autosaves: default_max_autosaves(),
            compress_after_days: 0,
            delete_after_days: 0,
            keep_manual: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffFormatConfig {
    #[serde(default)]
    pub default: DiffFormatKind,
    #[serde(default = "default_unified_context")]
    pub unified_context: usize,
    #[serde(default)]
    pub json_include_content: bool,
    #[serde(default)]
    pub ast_enabled: bool,
}

impl Default for DiffFormatConfig {
    fn default() -> Self {
        Self {
            default: DiffFormatKind::default(),
            unified_context: default_unified_context(),
            json_include_content: false,
            ast_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffFormatKind {
    #[default]
    Unified,
    Json,
    Markdown,
    /// Falls back to unified rendering.
    Ast,
}

fn default_storage_path() -> String {
    STORAGE_DIR.to_string()
}
fn default_true() -> bool {
    true
}
fn default_compression_level() -> i32 {
    3
}
fn default_timer_interval() -> u64 {
    300
}
fn default_threshold() -> f64 {
    0.05
}
fn default_check_interval() -> u64 {
    30
}
fn default_hybrid_min() -> u64 {
    120
}
fn default_hybrid_max() -> u64 {
    1800
}
fn default_max_autosaves() -> usize {
    20
}
fn default_unified_context() -> usize {
    3
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            project_path: String::new(),
            storage_path: default_storage_path(),
            ignore: preset_ignore("default"),
            autosave: AutosaveConfig::default(),
            diff_format: DiffFormatConfig::default(),
            compression_enabled: true,
            compression_level: default_compression_level(),
        }
    }
}

impl ProjectConfig {
    /// Storage directory for a project root.
    pub fn storage_dir(root: &Path) -> PathBuf {
        root.join(STORAGE_DIR)
    }

    pub fn config_path(root: &Path) -> PathBuf {
        Self::storage_dir(root).join(CONFIG_FILE)
    }

    pub fn db_path(root: &Path) -> PathBuf {
        Self::storage_dir(root).join(DB_FILE)
    }

    /// Loads the project configuration, or defaults when none was written.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        if !path.exists() {
            let mut config = Self::default();
            config.project_path = root.to_string_lossy().to_string();
            return Ok(config);
        }
        let content = std::fs::read_to_string(&path)?;
        let config: ProjectConfig = toml::from_str(&content)
            .map_err(|e| EngineError::Invalid(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = Self::config_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Invalid(format!("failed to serialize config: {e}")))?;
        std::fs::write(&path, toml_str)?;
        Ok(())
    }

    /// Validates configuration invariants after parsing or mutation.
    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(EngineError::Invalid(format!(
                "compression_level must be between 1 and 22, got {}",
                self.compression_level
            )));
        }
        if self.autosave.timer.interval == 0 {
            return Err(EngineError::Invalid(
                "autosave.timer.interval must be greater than 0".into(),
            ));
        }
        if self.autosave.diff_threshold.check_interval == 0 {
            return Err(EngineError::Invalid(
                "autosave.diff_threshold.check_interval must be greater than 0".into(),
            ));
        }
        if self.autosave.hybrid.min_interval > self.autosave.hybrid.max_interval {
            return Err(EngineError::Invalid(
                "autosave.hybrid.min_interval must not exceed max_interval".into(),
            ));
        }
        Ok(())
    }

    /// Applies a named preset's ignore rules, replacing the current sets.
    pub fn apply_preset(&mut self, name: &str) -> Result<()> {
        if !matches!(name, "default" | "python" | "node" | "javascript" | "rust") {
            return Err(EngineError::Invalid(format!("unknown preset '{name}'")));
        }
        self.ignore = preset_ignore(name);
        Ok(())
    }

    /// Sets a configuration value by dotted key path, e.g.
    /// `autosave.timer.interval = 120`. The value is a JSON scalar/array as
    /// received from the request layer.
    pub fn set_value(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut tree = serde_json::to_value(&*self)
            .map_err(|e| EngineError::Invalid(format!("config serialization failed: {e}")))?;

        let mut node = &mut tree;
        let mut segments = key.split('.').peekable();
        while let Some(segment) = segments.next() {
            if segment.is_empty() {
                return Err(EngineError::Invalid(format!("bad config key '{key}'")));
            }
            let map = node
                .as_object_mut()
                .ok_or_else(|| EngineError::Invalid(format!("bad config key '{key}'")))?;
            if segments.peek().is_none() {
                map.insert(segment.to_string(), value);
                break;
            }
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
        }

        let updated: ProjectConfig = serde_json::from_value(tree)
            .map_err(|e| EngineError::Invalid(format!("invalid value for '{key}': {e}")))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Adds or removes ignore rules. `kind` is one of dirs / files /
    /// extensions / patterns; `action` is add / remove.
    pub fn manage_ignore_rules(&mut self, action: &str, kind: &str, values: &[String]) -> Result<()> {
        let list = match kind {
            "dirs" => &mut self.ignore.dirs,
            "files" => &mut self.ignore.files,
            "extensions" => &mut self.ignore.extensions,
            "patterns" => &mut self.ignore.patterns,
            other => {
                return Err(EngineError::Invalid(format!(
                    "unknown ignore rule kind '{other}'"
                )))
            }
        };
        match action {
            "add" => {
                for v in values {
                    if !list.contains(v) {
                        list.push(v.clone());
                    }
                }
            }
            "remove" => list.retain(|v| !values.contains(v)),
            other => {
                return Err(EngineError::Invalid(format!(
                    "unknown ignore action '{other}' (expected add or remove)"
                )))
            }
        }
        Ok(())
    }
}

/// Ignore rule sets seeded by preset name.
fn preset_ignore(name: &str) -> IgnoreConfig {
    let mut ignore = IgnoreConfig {
        dirs: vec![
            ".git".into(),
            STORAGE_DIR.into(),
            ".idea".into(),
            ".vscode".into(),
            "node_modules".into(),
            "dist".into(),
            "build".into(),
        ],
        files: vec![".DS_Store".into(), "Thumbs.db".into()],
        extensions: vec![".log".into(), ".tmp".into(), ".swp".into()],
        patterns: Vec::new(),
    };

    match name {
        "python" => {
            ignore.dirs.extend([
                "__pycache__".into(),
                ".venv".into(),
                "venv".into(),
                ".pytest_cache".into(),
                ".mypy_cache".into(),
                ".tox".into(),
            ]);
            ignore
                .extensions
                .extend([".pyc".into(), ".pyo".into(), ".pyd".into()]);
            ignore.patterns.push("*.egg-info/**".into());
        }
        "node" | "javascript" => {
            ignore
                .dirs
                .extend([".next".into(), "coverage".into(), ".turbo".into()]);
            ignore.extensions.push(".map".into());
        }
        "rust" => {
            ignore.dirs.push("target".into());
            ignore.extensions.push(".rlib".into());
        }
        _ => {}
    }
    ignore
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ProjectConfig::default().validate().unwrap();
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.project_name = "demo".into();
        config.apply_preset("python").unwrap();
        config.save(dir.path()).unwrap();

        let loaded = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.project_name, "demo");
        assert!(loaded.ignore.dirs.contains(&"__pycache__".to_string()));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.storage_path, STORAGE_DIR);
        assert!(config.compression_enabled);
    }

    #[test]
    fn set_value_by_dotted_path() {
        let mut config = ProjectConfig::default();
        config
            .set_value("autosave.timer.interval", serde_json::json!(120))
            .unwrap();
        assert_eq!(config.autosave.timer.interval, 120);

        config
            .set_value("compression_enabled", serde_json::json!(false))
            .unwrap();
        assert!(!config.compression_enabled);

        config
            .set_value("autosave.mode", serde_json::json!("timer"))
            .unwrap();
        assert_eq!(config.autosave.mode, AutosaveModeKind::Timer);
    }

    #[test]
    fn set_value_rejects_out_of_range() {
        let mut config = ProjectConfig::default();
        let err = config
            .set_value("compression_level", serde_json::json!(99))
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
        // unchanged on failure
        assert_eq!(config.compression_level, 3);
    }

    #[test]
    fn set_value_rejects_bad_type() {
        let mut config = ProjectConfig::default();
        assert!(config
            .set_value("autosave.timer.interval", serde_json::json!("soon"))
            .is_err());
    }

    #[test]
    fn manage_ignore_rules_add_remove() {
        let mut config = ProjectConfig::default();
        config
            .manage_ignore_rules("add", "extensions", &[".bak".into()])
            .unwrap();
        assert!(config.ignore.extensions.contains(&".bak".to_string()));
        // adding again does not duplicate
        config
            .manage_ignore_rules("add", "extensions", &[".bak".into()])
            .unwrap();
        let n = config
            .ignore
            .extensions
            .iter()
            .filter(|e| *e == ".bak")
            .count();
        assert_eq!(n, 1);

        config
            .manage_ignore_rules("remove", "extensions", &[".bak".into()])
            .unwrap();
        assert!(!config.ignore.extensions.contains(&".bak".to_string()));

        assert!(config.manage_ignore_rules("toggle", "dirs", &[]).is_err());
        assert!(config.manage_ignore_rules("add", "globs", &[]).is_err());
    }

    #[test]
    fn unknown_preset_is_invalid() {
        let mut config = ProjectConfig::default();
        assert!(config.apply_preset("haskell").is_err());
    }

    #[test]
    fn storage_dir_always_ignored() {
        for preset in ["default", "python", "node", "rust"] {
            assert!(preset_ignore(preset).dirs.contains(&STORAGE_DIR.to_string()));
        }
    }
}
