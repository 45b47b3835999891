//! # Request Router
//!
//! Single entry point translating line-delimited JSON-RPC 2.0 requests into
//! engine calls. Method dispatch is a static name→handler table; every tool
//! result carries a human-readable text block plus machine-readable fields.
//! The router owns the per-project manager cache and the live autosave
//! controllers, and stops the latter on shutdown.

use crate::autosave::{AutosaveController, AutosaveMode};
use crate::config::{AutosaveModeKind, DiffFormatKind, ProjectConfig};
use crate::db::SnapshotMetadata;
use crate::error::{EngineError, Result};
use crate::version::{format_size, label, CreateOptions, VersionManager, CURRENT_REF};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error codes used by the transport layer.
const PARSE_ERROR: i64 = -32700;
const INTERNAL_ERROR: i64 = -32603;

/// Methods that require `project_path` and read it without popping it.
const PATH_REQUIRED_TOOLS: &[&str] = &["init_project", "start_autosave", "stop_autosave"];

type Handler = fn(&RequestRouter, &Path, Map<String, Value>) -> Result<ToolReply>;

struct ToolDef {
    name: &'static str,
    description: &'static str,
    handler: Handler,
}

/// A tool result: text for humans, fields for machines.
struct ToolReply {
    text: String,
    data: Map<String, Value>,
}

impl ToolReply {
    fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: Map::new(),
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

pub struct RequestRouter {
    default_project: PathBuf,
    managers: Mutex<HashMap<PathBuf, Arc<VersionManager>>>,
    autosaves: Mutex<HashMap<PathBuf, AutosaveController>>,
}

impl RequestRouter {
    pub fn new(default_project: PathBuf) -> Self {
        Self {
            default_project,
            managers: Mutex::new(HashMap::new()),
            autosaves: Mutex::new(HashMap::new()),
        }
    }

    /// Handles one request line. `None` means no reply is sent
    /// (notifications and `notifications/*` methods).
    pub fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            // Unparseable input is echoed back with id 0.
            Err(e) => return Some(error_envelope(json!(0), PARSE_ERROR, &format!("parse error: {e}"))),
        };

        let id = request.get("id").cloned();
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if method.starts_with("notifications/") {
            return None;
        }
        let Some(id) = id else {
            // A notification: execute nothing, reply with nothing.
            return None;
        };
        let id = if id.is_null() { json!(0) } else { id };

        let params = request.get("params").cloned().unwrap_or(Value::Null);
        debug!(%method, "request");

        match method.as_str() {
            "initialize" => Some(result_envelope(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "gencodedoc", "version": env!("CARGO_PKG_VERSION")},
                }),
            )),
            "tools/list" => Some(result_envelope(id, json!({"tools": tool_descriptors()}))),
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = params
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                Some(result_envelope(id, self.call_tool(&name, arguments)))
            }
            other => Some(error_envelope(
                id,
                INTERNAL_ERROR,
                &format!("unknown method: {other}"),
            )),
        }
    }

    /// Stops all autosave controllers. Called when the channel closes.
    pub fn shutdown(&self) {
        let mut autosaves = self.autosaves.lock().expect("autosave map poisoned");
        for (_, mut controller) in autosaves.drain() {
            controller.stop();
        }
    }

    // ─── Tool dispatch ──────────────────────────────────────────────────────

    fn call_tool(&self, name: &str, mut args: Map<String, Value>) -> Value {
        let Some(tool) = TOOLS.iter().find(|t| t.name == name) else {
            return tool_error(&EngineError::Invalid(format!("unknown tool '{name}'")));
        };

        let project = if PATH_REQUIRED_TOOLS.contains(&name) {
            match args.get("project_path").and_then(Value::as_str) {
                Some(p) => PathBuf::from(p),
                None => {
                    return tool_error(&EngineError::Invalid(format!(
                        "'{name}' requires project_path"
                    )))
                }
            }
        } else {
            match args.remove("project_path") {
                Some(Value::String(p)) => PathBuf::from(p),
                _ => self.default_project.clone(),
            }
        };
        let project = absolutize(&project);

        match (tool.handler)(self, &project, args) {
            Ok(reply) => {
                let mut result = Map::new();
                result.insert(
                    "content".into(),
                    json!([{"type": "text", "text": reply.text}]),
                );
                result.extend(reply.data);
                Value::Object(result)
            }
            Err(e) => {
                warn!(tool = name, kind = e.kind(), error = %e, "tool call failed");
                tool_error(&e)
            }
        }
    }

    // ─── Project cache ──────────────────────────────────────────────────────

    /// Manager for an initialized project, cached per absolute path.
    fn manager_for(&self, root: &Path) -> Result<Arc<VersionManager>> {
        if !ProjectConfig::db_path(root).exists() {
            return Err(EngineError::NotInitialized(root.to_path_buf()));
        }
        let mut managers = self.managers.lock().expect("manager cache poisoned");
        if let Some(manager) = managers.get(root) {
            return Ok(Arc::clone(manager));
        }
        let config = ProjectConfig::load(root)?;
        let manager = Arc::new(VersionManager::open(root, config)?);
        managers.insert(root.to_path_buf(), Arc::clone(&manager));
        Ok(manager)
    }

    /// Drops the cached manager so configuration changes take effect on the
    /// next request.
    fn invalidate(&self, root: &Path) {
        self.managers
            .lock()
            .expect("manager cache poisoned")
            .remove(root);
    }

    fn autosave_running(&self, root: &Path) -> bool {
        self.autosaves
            .lock()
            .expect("autosave map poisoned")
            .get(root)
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    // ─── Tool handlers ──────────────────────────────────────────────────────

    fn tool_init_project(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        std::fs::create_dir_all(root)?;
        let root = absolutize(root);

        let mut config = ProjectConfig::load(&root)?;
        config.project_path = root.to_string_lossy().to_string();
        if config.project_name.is_empty() {
            config.project_name = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
        }
        if let Some(preset) = arg_str(&args, "preset") {
            config.apply_preset(&preset)?;
        }
        config.save(&root)?;

        // Opening the manager creates the metadata store.
        let manager = Arc::new(VersionManager::open(&root, config)?);
        self.managers
            .lock()
            .expect("manager cache poisoned")
            .insert(root.clone(), manager);

        let config_path = ProjectConfig::config_path(&root);
        let storage_dir = ProjectConfig::storage_dir(&root);
        Ok(ToolReply::new(format!(
            "Initialized project at {}\nConfig: {}\nStorage: {}",
            root.display(),
            config_path.display(),
            storage_dir.display()
        ))
        .with("config_path", json!(config_path.to_string_lossy()))
        .with("storage_path", json!(storage_dir.to_string_lossy())))
    }

    fn tool_get_project_status(&self, root: &Path, _args: Map<String, Value>) -> Result<ToolReply> {
        let initialized = ProjectConfig::db_path(root).exists();
        if !initialized {
            return Ok(ToolReply::new(format!(
                "Project at {} is not initialized.",
                root.display()
            ))
            .with("initialized", json!(false)));
        }

        let manager = self.manager_for(root)?;
        let (manual, autosave) = manager.db().snapshot_counts()?;
        let (blobs, stored_bytes) = manager.db().content_stats()?;
        let running = self.autosave_running(root);

        Ok(ToolReply::new(format!(
            "Project: {}\nSnapshots: {} manual, {} autosave\nContent blobs: {} ({})\nAutosave: {}",
            root.display(),
            manual,
            autosave,
            blobs,
            format_size(stored_bytes),
            if running { "running" } else { "stopped" }
        ))
        .with("initialized", json!(true))
        .with("manual_snapshots", json!(manual))
        .with("autosave_snapshots", json!(autosave))
        .with("content_blobs", json!(blobs))
        .with("stored_bytes", json!(stored_bytes))
        .with("autosave_running", json!(running)))
    }

    fn tool_create_snapshot(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let opts = CreateOptions {
            message: arg_str(&args, "message"),
            tag: arg_str(&args, "tag"),
            include_paths: arg_str_vec(&args, "include_paths"),
            exclude_paths: arg_str_vec(&args, "exclude_paths"),
            include_binary: arg_bool(&args, "include_binary", false),
            is_autosave: false,
            trigger_type: None,
        };

        match manager.create_snapshot(opts) {
            Ok(snapshot) => Ok(ToolReply::new(format!(
                "Created snapshot.\nSnapshot ID: {}\nFiles: {}\nTotal size: {}\nNewly stored: {}",
                snapshot.meta.id,
                snapshot.meta.files_count,
                format_size(snapshot.meta.total_size),
                format_size(snapshot.meta.compressed_size)
            ))
            .with("snapshot_id", json!(snapshot.meta.id))
            .with("files_count", json!(snapshot.meta.files_count))
            .with("total_size", json!(snapshot.meta.total_size))
            .with("compressed_size", json!(snapshot.meta.compressed_size))
            .with("tag", json!(snapshot.meta.tag))),
            // Soft failure: the caller asked for a snapshot of an unchanged
            // tree, which is routine under autosave-heavy workflows.
            Err(EngineError::NoChanges) => Ok(ToolReply::new(
                "No changes detected since last snapshot.",
            )
            .with("no_changes", json!(true))),
            Err(e) => Err(e),
        }
    }

    fn tool_list_snapshots(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let limit = arg_usize(&args, "limit");
        let include_autosave = arg_bool(&args, "include_autosave", false);
        let snapshots = manager.list_snapshots(limit, include_autosave)?;

        let mut lines = vec![format!("{} snapshot(s):", snapshots.len())];
        for meta in &snapshots {
            lines.push(format!(
                "  #{} {} [{}] {} files, {} — {}",
                meta.id,
                meta.tag.as_deref().unwrap_or("-"),
                meta.created_at.format("%Y-%m-%d %H:%M:%S"),
                meta.files_count,
                format_size(meta.total_size),
                meta.message.as_deref().unwrap_or("")
            ));
        }

        let headers: Vec<Value> = snapshots.iter().map(snapshot_header).collect();
        Ok(ToolReply::new(lines.join("\n")).with("snapshots", json!(headers)))
    }

    fn tool_get_snapshot_details(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let snapshot_ref = arg_str_req(&args, "snapshot_ref")?;
        let (meta, files) = manager.snapshot_files(&snapshot_ref)?;

        const PREVIEW: usize = 20;
        let mut text = format!(
            "Snapshot {} ({})\nCreated: {}\nMessage: {}\nFiles: {} ({} total)\n",
            label(&meta),
            meta.trigger_type,
            meta.created_at.format("%Y-%m-%d %H:%M:%S"),
            meta.message.as_deref().unwrap_or("-"),
            meta.files_count,
            format_size(meta.total_size)
        );
        for file in files.iter().take(PREVIEW) {
            text.push_str(&format!("  {} ({})\n", file.path, format_size(file.size)));
        }
        if files.len() > PREVIEW {
            text.push_str(&format!("  … and {} more\n", files.len() - PREVIEW));
        }

        Ok(ToolReply::new(text)
            .with("snapshot", snapshot_header(&meta))
            .with(
                "files",
                json!(files
                    .iter()
                    .map(|f| json!({"path": f.path, "size": f.size, "hash": f.hash}))
                    .collect::<Vec<_>>()),
            ))
    }

    fn tool_restore_snapshot(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let snapshot_ref = arg_str_req(&args, "snapshot_ref")?;
        let force = arg_bool(&args, "force", false);
        let filters = arg_str_vec(&args, "file_filters");
        let report = manager.restore(&snapshot_ref, None, force, filters.as_deref())?;
        Ok(restore_reply(&snapshot_ref, report))
    }

    fn tool_restore_files(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let snapshot_ref = arg_str_req(&args, "snapshot_ref")?;
        let filters = arg_str_vec(&args, "file_filters")
            .ok_or_else(|| EngineError::Invalid("'file_filters' is required".into()))?;
        let force = arg_bool(&args, "force", false);
        let report = manager.restore(&snapshot_ref, None, force, Some(&filters))?;
        Ok(restore_reply(&snapshot_ref, report))
    }

    fn tool_delete_snapshot(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let snapshot_ref = arg_str_req(&args, "snapshot_ref")?;
        let meta = manager.delete_snapshot(&snapshot_ref)?;
        Ok(
            ToolReply::new(format!("Deleted snapshot {}.", label(&meta)))
                .with("success", json!(true))
                .with("snapshot_id", json!(meta.id)),
        )
    }

    fn tool_diff_versions(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let from_ref = arg_str_req(&args, "from_ref")?;
        let to_ref = arg_str(&args, "to_ref").unwrap_or_else(|| CURRENT_REF.to_string());
        let filters = arg_str_vec(&args, "file_filters");
        let format = match arg_str(&args, "format") {
            Some(raw) => parse_diff_format(&raw)?,
            None => manager.config().diff_format.default,
        };

        let diff = manager.diff(&from_ref, &to_ref, filters.as_deref())?;
        let rendered = manager.render_diff(&diff, format);

        Ok(ToolReply::new(rendered)
            .with("total_changes", json!(diff.total_changes))
            .with("significance", json!(diff.significance))
            .with("added", json!(diff.added))
            .with("removed", json!(diff.removed))
            .with(
                "modified",
                json!(diff
                    .modified
                    .iter()
                    .map(|m| m.path.clone())
                    .collect::<Vec<_>>()),
            ))
    }

    fn tool_get_file_at_version(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let snapshot_ref = arg_str_req(&args, "snapshot_ref")?;
        let file_path = arg_str_req(&args, "file_path")?;
        let bytes = manager.get_file_at_version(&snapshot_ref, &file_path)?;

        match String::from_utf8(bytes.clone()) {
            Ok(text) => Ok(ToolReply::new(text.clone())
                .with("path", json!(file_path))
                .with("size", json!(bytes.len()))
                .with("content", json!(text))
                .with("is_text", json!(true))),
            Err(_) => Ok(ToolReply::new(format!(
                "Binary file {} ({})",
                file_path,
                format_size(bytes.len() as u64)
            ))
            .with("path", json!(file_path))
            .with("size", json!(bytes.len()))
            .with("is_text", json!(false))),
        }
    }

    fn tool_list_files_at_version(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let snapshot_ref = arg_str_req(&args, "snapshot_ref")?;
        let pattern = arg_str(&args, "pattern");
        let files = manager.list_files_at_version(&snapshot_ref, pattern.as_deref())?;

        let mut lines = vec![format!("{} file(s):", files.len())];
        for file in &files {
            lines.push(format!("  {} ({})", file.path, format_size(file.size)));
        }
        Ok(ToolReply::new(lines.join("\n")).with(
            "files",
            json!(files
                .iter()
                .map(|f| json!({"path": f.path, "size": f.size}))
                .collect::<Vec<_>>()),
        ))
    }

    fn tool_export_snapshot(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let snapshot_ref = arg_str_req(&args, "snapshot_ref")?;
        let output_path = PathBuf::from(arg_str_req(&args, "output_path")?);
        let archive = arg_bool(&args, "archive", false);
        let filters = arg_str_vec(&args, "file_filters");

        let report = manager.export(&snapshot_ref, &output_path, archive, filters.as_deref())?;
        let mut reply = ToolReply::new(format!(
            "Exported {} file(s) ({}) to {}",
            report.files_exported,
            format_size(report.total_size),
            report.output_path
        ))
        .with("files_exported", json!(report.files_exported))
        .with("total_size", json!(report.total_size))
        .with("output_path", json!(report.output_path));
        if let Some(size) = report.archive_size {
            reply = reply.with("archive_size", json!(size));
        }
        Ok(reply)
    }

    fn tool_cleanup_orphaned_contents(
        &self,
        root: &Path,
        _args: Map<String, Value>,
    ) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let count = manager.cleanup_orphaned_contents()?;
        Ok(
            ToolReply::new(format!("Removed {count} orphaned content blob(s)."))
                .with("deleted", json!(count)),
        )
    }

    fn tool_get_file_history(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let file_path = arg_str_req(&args, "file_path")?;
        let history = manager.file_history(&file_path)?;

        let mut lines = vec![format!("History of {file_path} ({} entries):", history.len())];
        for entry in &history {
            lines.push(format!(
                "  #{} [{}] {} {}",
                entry.snapshot_id,
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.status,
                entry.tag.as_deref().unwrap_or("")
            ));
        }
        Ok(ToolReply::new(lines.join("\n"))
            .with("history", serde_json::to_value(&history).unwrap_or_default()))
    }

    fn tool_search_snapshots(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let query = arg_str_req(&args, "query")?;
        let file_filter = arg_str(&args, "file_filter");
        let snapshot_ref = arg_str(&args, "snapshot_ref");
        let case_sensitive = arg_bool(&args, "case_sensitive", false);

        let results = manager.search(
            &query,
            file_filter.as_deref(),
            snapshot_ref.as_deref(),
            case_sensitive,
        )?;

        let mut lines = vec![format!("{} file(s) with matches:", results.len())];
        for result in &results {
            lines.push(format!(
                "  {} @ {} ({} match(es))",
                result.path, result.snapshot_label, result.total_matches
            ));
            for m in &result.matches {
                lines.push(format!("    {}: {}", m.line, m.content));
            }
        }
        Ok(ToolReply::new(lines.join("\n"))
            .with("results", serde_json::to_value(&results).unwrap_or_default()))
    }

    fn tool_generate_changelog(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let from_ref = arg_str_req(&args, "from_ref")?;
        let to_ref = arg_str(&args, "to_ref");
        let markdown = manager.changelog(&from_ref, to_ref.as_deref())?;
        Ok(ToolReply::new(markdown.clone()).with("markdown", json!(markdown)))
    }

    fn tool_get_config(&self, root: &Path, _args: Map<String, Value>) -> Result<ToolReply> {
        let config = ProjectConfig::load(root)?;
        let value = serde_json::to_value(&config)
            .map_err(|e| EngineError::Invalid(format!("config serialization failed: {e}")))?;
        let pretty = serde_json::to_string_pretty(&value).unwrap_or_default();
        Ok(ToolReply::new(pretty).with("config", value))
    }

    fn tool_set_config_value(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let key = arg_str_req(&args, "key")?;
        let value = args
            .get("value")
            .cloned()
            .ok_or_else(|| EngineError::Invalid("'value' is required".into()))?;

        let mut config = ProjectConfig::load(root)?;
        config.set_value(&key, value.clone())?;
        config.save(root)?;
        self.invalidate(root);

        Ok(
            ToolReply::new(format!("Set {key} = {value}\nConfiguration reloaded."))
                .with("key", json!(key))
                .with("value", value),
        )
    }

    fn tool_apply_preset(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let preset = arg_str_req(&args, "preset")?;
        let mut config = ProjectConfig::load(root)?;
        config.apply_preset(&preset)?;
        config.save(root)?;
        self.invalidate(root);

        Ok(ToolReply::new(format!(
            "Applied preset '{preset}' ({} ignored dirs, {} extensions).",
            config.ignore.dirs.len(),
            config.ignore.extensions.len()
        ))
        .with("preset", json!(preset)))
    }

    fn tool_manage_ignore_rules(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let action = arg_str_req(&args, "action")?;
        let rule_type = arg_str_req(&args, "rule_type")?;
        let values = arg_str_vec(&args, "values")
            .ok_or_else(|| EngineError::Invalid("'values' is required".into()))?;

        let mut config = ProjectConfig::load(root)?;
        config.manage_ignore_rules(&action, &rule_type, &values)?;
        config.save(root)?;
        self.invalidate(root);

        Ok(ToolReply::new(format!(
            "Ignore rules updated: {action} {rule_type} {values:?}"
        ))
        .with("ignore", serde_json::to_value(&config.ignore).unwrap_or_default()))
    }

    fn tool_start_autosave(&self, root: &Path, args: Map<String, Value>) -> Result<ToolReply> {
        let manager = self.manager_for(root)?;
        let mut config = manager.config().clone();
        if let Some(mode) = arg_str(&args, "mode") {
            config.autosave.mode = parse_autosave_mode(&mode)?;
        }
        let mode = AutosaveMode::from_config(&config.autosave);

        let mut autosaves = self.autosaves.lock().expect("autosave map poisoned");
        if let Some(existing) = autosaves.get(root) {
            if existing.is_running() {
                return Ok(ToolReply::new(format!(
                    "Autosave already running for {} ({} mode).",
                    root.display(),
                    existing.mode().label()
                ))
                .with("running", json!(true)));
            }
        }

        let mut controller =
            AutosaveController::new(Arc::clone(&manager), mode, config.autosave.retention.clone());
        controller.start()?;
        autosaves.insert(root.to_path_buf(), controller);

        Ok(ToolReply::new(format!(
            "Autosave started for {} in {} mode.",
            root.display(),
            mode.label()
        ))
        .with("running", json!(true))
        .with("mode", json!(mode.label())))
    }

    fn tool_stop_autosave(&self, root: &Path, _args: Map<String, Value>) -> Result<ToolReply> {
        let removed = self
            .autosaves
            .lock()
            .expect("autosave map poisoned")
            .remove(root);
        match removed {
            Some(mut controller) => {
                controller.stop();
                Ok(
                    ToolReply::new(format!("Autosave stopped for {}.", root.display()))
                        .with("running", json!(false)),
                )
            }
            None => Ok(ToolReply::new(format!(
                "Autosave was not running for {}.",
                root.display()
            ))
            .with("running", json!(false))),
        }
    }

    fn tool_get_autosave_status(&self, _root: &Path, _args: Map<String, Value>) -> Result<ToolReply> {
        let autosaves = self.autosaves.lock().expect("autosave map poisoned");
        let mut lines = vec![format!("{} autosave controller(s):", autosaves.len())];
        let mut entries = Vec::new();
        for (path, controller) in autosaves.iter() {
            lines.push(format!(
                "  {} — {} ({})",
                path.display(),
                controller.mode().label(),
                if controller.is_running() {
                    "running"
                } else {
                    "stopped"
                }
            ));
            entries.push(json!({
                "project_path": path.to_string_lossy(),
                "mode": controller.mode().label(),
                "running": controller.is_running(),
            }));
        }
        Ok(ToolReply::new(lines.join("\n")).with("controllers", json!(entries)))
    }
}

/// Static dispatch table: tool name → handler.
static TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "init_project",
        description: "Initialize version tracking for a project directory",
        handler: RequestRouter::tool_init_project,
    },
    ToolDef {
        name: "get_project_status",
        description: "Report initialization state, snapshot counts, and autosave status",
        handler: RequestRouter::tool_get_project_status,
    },
    ToolDef {
        name: "create_snapshot",
        description: "Create a snapshot of the working tree",
        handler: RequestRouter::tool_create_snapshot,
    },
    ToolDef {
        name: "list_snapshots",
        description: "List snapshots, newest first",
        handler: RequestRouter::tool_list_snapshots,
    },
    ToolDef {
        name: "get_snapshot_details",
        description: "Show a snapshot's metadata and file list",
        handler: RequestRouter::tool_get_snapshot_details,
    },
    ToolDef {
        name: "restore_snapshot",
        description: "Restore files from a snapshot into the working tree",
        handler: RequestRouter::tool_restore_snapshot,
    },
    ToolDef {
        name: "restore_files",
        description: "Restore selected files from a snapshot",
        handler: RequestRouter::tool_restore_files,
    },
    ToolDef {
        name: "delete_snapshot",
        description: "Delete a snapshot by id or tag",
        handler: RequestRouter::tool_delete_snapshot,
    },
    ToolDef {
        name: "diff_versions",
        description: "Diff two snapshots, or a snapshot against the working tree",
        handler: RequestRouter::tool_diff_versions,
    },
    ToolDef {
        name: "get_file_at_version",
        description: "Read one file's content as recorded in a snapshot",
        handler: RequestRouter::tool_get_file_at_version,
    },
    ToolDef {
        name: "list_files_at_version",
        description: "List a snapshot's files, optionally filtered by glob",
        handler: RequestRouter::tool_list_files_at_version,
    },
    ToolDef {
        name: "export_snapshot",
        description: "Export a snapshot to a folder or a .tar.gz archive",
        handler: RequestRouter::tool_export_snapshot,
    },
    ToolDef {
        name: "cleanup_orphaned_contents",
        description: "Remove content blobs not referenced by any snapshot",
        handler: RequestRouter::tool_cleanup_orphaned_contents,
    },
    ToolDef {
        name: "get_file_history",
        description: "Chronological history of one file across snapshots",
        handler: RequestRouter::tool_get_file_history,
    },
    ToolDef {
        name: "search_snapshots",
        description: "Search snapshot content for a substring",
        handler: RequestRouter::tool_search_snapshots,
    },
    ToolDef {
        name: "generate_changelog",
        description: "Generate Keep-a-Changelog Markdown between two refs",
        handler: RequestRouter::tool_generate_changelog,
    },
    ToolDef {
        name: "get_config",
        description: "Show the project configuration",
        handler: RequestRouter::tool_get_config,
    },
    ToolDef {
        name: "set_config_value",
        description: "Set a configuration value by dotted key path",
        handler: RequestRouter::tool_set_config_value,
    },
    ToolDef {
        name: "apply_preset",
        description: "Apply a named ignore-rule preset",
        handler: RequestRouter::tool_apply_preset,
    },
    ToolDef {
        name: "manage_ignore_rules",
        description: "Add or remove ignore rules",
        handler: RequestRouter::tool_manage_ignore_rules,
    },
    ToolDef {
        name: "start_autosave",
        description: "Start the autosave loop for a project",
        handler: RequestRouter::tool_start_autosave,
    },
    ToolDef {
        name: "stop_autosave",
        description: "Stop the autosave loop for a project",
        handler: RequestRouter::tool_stop_autosave,
    },
    ToolDef {
        name: "get_autosave_status",
        description: "List live autosave controllers",
        handler: RequestRouter::tool_get_autosave_status,
    },
];

fn tool_descriptors() -> Vec<Value> {
    TOOLS
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "inputSchema": {"type": "object"},
            })
        })
        .collect()
}

// ─── Envelope helpers ───────────────────────────────────────────────────────

fn result_envelope(id: Value, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

fn error_envelope(id: Value, code: i64, message: &str) -> String {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}).to_string()
}

/// Tool-level failures are reported inside the result, with the stable kind.
fn tool_error(e: &EngineError) -> Value {
    json!({
        "content": [{"type": "text", "text": format!("Error [{}]: {e}", e.kind())}],
        "isError": true,
        "error_kind": e.kind(),
    })
}

/// Machine-readable summary of a snapshot's metadata fields.
fn snapshot_header(meta: &SnapshotMetadata) -> Value {
    json!({
        "id": meta.id,
        "tag": meta.tag,
        "message": meta.message,
        "created_at": meta.created_at,
        "is_autosave": meta.is_autosave,
        "trigger_type": meta.trigger_type,
        "files_count": meta.files_count,
        "total_size": meta.total_size,
        "compressed_size": meta.compressed_size,
    })
}

fn restore_reply(snapshot_ref: &str, report: crate::version::RestoreReport) -> ToolReply {
    ToolReply::new(format!(
        "Restored {} file(s) from {} ({} skipped, {} selected).",
        report.restored, snapshot_ref, report.skipped, report.total
    ))
    .with("restored", json!(report.restored))
    .with("skipped", json!(report.skipped))
    .with("total", json!(report.total))
    .with("files_restored", json!(report.files_restored))
    .with("files_skipped", json!(report.files_skipped))
}

// ─── Argument helpers ───────────────────────────────────────────────────────

fn arg_str(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(String::from)
}

fn arg_str_req(args: &Map<String, Value>, key: &str) -> Result<String> {
    arg_str(args, key).ok_or_else(|| EngineError::Invalid(format!("'{key}' is required")))
}

fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn arg_usize(args: &Map<String, Value>, key: &str) -> Option<usize> {
    args.get(key).and_then(Value::as_u64).map(|n| n as usize)
}

fn arg_str_vec(args: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    args.get(key).and_then(Value::as_array).map(|values| {
        values
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect()
    })
}

fn parse_diff_format(raw: &str) -> Result<DiffFormatKind> {
    match raw {
        "unified" => Ok(DiffFormatKind::Unified),
        "json" => Ok(DiffFormatKind::Json),
        "markdown" => Ok(DiffFormatKind::Markdown),
        "ast" => Ok(DiffFormatKind::Ast),
        other => Err(EngineError::Invalid(format!("unknown diff format '{other}'"))),
    }
}

fn parse_autosave_mode(raw: &str) -> Result<AutosaveModeKind> {
    match raw {
        "timer" => Ok(AutosaveModeKind::Timer),
        "diff" | "diff_threshold" => Ok(AutosaveModeKind::Diff),
        "hybrid" => Ok(AutosaveModeKind::Hybrid),
        other => Err(EngineError::Invalid(format!(
            "unknown autosave mode '{other}'"
        ))),
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn rpc(router: &RequestRouter, id: u64, method: &str, params: Value) -> Value {
        let line = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let reply = router.handle_line(&line.to_string()).expect("expected a reply");
        serde_json::from_str(&reply).unwrap()
    }

    fn call(router: &RequestRouter, name: &str, arguments: Value) -> Value {
        let reply = rpc(
            router,
            1,
            "tools/call",
            json!({"name": name, "arguments": arguments}),
        );
        reply["result"].clone()
    }

    fn text_of(result: &Value) -> String {
        result["content"][0]["text"].as_str().unwrap_or("").to_string()
    }

    fn setup() -> (tempfile::TempDir, RequestRouter) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::write(dir.path().join("b/c.py"), "print(1)").unwrap();
        let router = RequestRouter::new(dir.path().to_path_buf());
        (dir, router)
    }

    fn init(router: &RequestRouter, dir: &tempfile::TempDir) {
        let result = call(
            router,
            "init_project",
            json!({"project_path": dir.path().to_string_lossy(), "preset": "python"}),
        );
        assert!(result.get("isError").is_none(), "init failed: {result}");
    }

    #[test]
    fn initialize_handshake() {
        let (_dir, router) = setup();
        let reply = rpc(&router, 1, "initialize", json!({}));
        assert_eq!(reply["jsonrpc"], "2.0");
        assert_eq!(reply["result"]["serverInfo"]["name"], "gencodedoc");
        assert!(reply["result"]["capabilities"]["tools"].is_object());
    }

    #[test]
    fn tools_list_is_static_and_complete() {
        let (_dir, router) = setup();
        let reply = rpc(&router, 2, "tools/list", json!({}));
        let tools = reply["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), TOOLS.len());
        assert!(tools.iter().any(|t| t["name"] == "create_snapshot"));
    }

    #[test]
    fn notifications_get_no_reply() {
        let (_dir, router) = setup();
        let note = json!({"jsonrpc": "2.0", "method": "tools/call", "params": {}});
        assert!(router.handle_line(&note.to_string()).is_none());
        let prefixed =
            json!({"jsonrpc": "2.0", "id": 5, "method": "notifications/initialized"});
        assert!(router.handle_line(&prefixed.to_string()).is_none());
        assert!(router.handle_line("").is_none());
    }

    #[test]
    fn parse_error_echoes_id_zero() {
        let (_dir, router) = setup();
        let reply: Value =
            serde_json::from_str(&router.handle_line("{not json").unwrap()).unwrap();
        assert_eq!(reply["id"], 0);
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
    }

    #[test]
    fn unknown_method_is_error() {
        let (_dir, router) = setup();
        let reply = rpc(&router, 9, "frobnicate", json!({}));
        assert_eq!(reply["error"]["code"], INTERNAL_ERROR);
    }

    #[test]
    fn uninitialized_project_is_gated() {
        let (_dir, router) = setup();
        let result = call(&router, "create_snapshot", json!({}));
        assert_eq!(result["isError"], true);
        assert_eq!(result["error_kind"], "NotInitialized");
    }

    #[test]
    fn scenario_init_and_first_snapshot() {
        let (dir, router) = setup();
        init(&router, &dir);

        let result = call(
            &router,
            "create_snapshot",
            json!({"message": "first", "tag": "v1"}),
        );
        assert_eq!(result["snapshot_id"], 1);
        assert_eq!(result["files_count"], 2);
        assert!(text_of(&result).contains("Snapshot ID: 1"));
    }

    #[test]
    fn scenario_dedup_diff_restore_nochange() {
        let (dir, router) = setup();
        init(&router, &dir);
        call(&router, "create_snapshot", json!({"message": "first", "tag": "v1"}));

        // dedup across snapshots
        fs::write(dir.path().join("a.txt"), "hello!").unwrap();
        let second = call(&router, "create_snapshot", json!({"tag": "v2"}));
        assert_eq!(second["snapshot_id"], 2);

        // diff v1 -> v2
        let diff = call(
            &router,
            "diff_versions",
            json!({"from_ref": "v1", "to_ref": "v2"}),
        );
        assert_eq!(diff["total_changes"], 1);
        assert_eq!(diff["modified"][0], "a.txt");
        assert!((diff["significance"].as_f64().unwrap() - 0.5).abs() < 1e-9);

        // partial restore
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        let restore = call(
            &router,
            "restore_files",
            json!({"snapshot_ref": "v1", "file_filters": ["a.txt"], "force": true}),
        );
        assert_eq!(restore["restored"], 1);
        assert_eq!(restore["skipped"], 0);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"hello");

        // no-change snapshot fails softly
        let unchanged = call(&router, "create_snapshot", json!({"tag": "v3"}));
        assert!(text_of(&unchanged).contains("No changes detected"));
        assert_eq!(unchanged["no_changes"], true);
        let listing = call(&router, "list_snapshots", json!({}));
        assert_eq!(listing["snapshots"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn duplicate_tag_surfaces_kind() {
        let (dir, router) = setup();
        init(&router, &dir);
        call(&router, "create_snapshot", json!({"tag": "v1"}));
        fs::write(dir.path().join("a.txt"), "changed").unwrap();
        let result = call(&router, "create_snapshot", json!({"tag": "v1"}));
        assert_eq!(result["isError"], true);
        assert_eq!(result["error_kind"], "DuplicateTag");
    }

    #[test]
    fn file_access_and_search_tools() {
        let (dir, router) = setup();
        init(&router, &dir);
        call(&router, "create_snapshot", json!({"tag": "v1"}));

        let file = call(
            &router,
            "get_file_at_version",
            json!({"snapshot_ref": "v1", "file_path": "a.txt"}),
        );
        assert_eq!(file["content"], "hello");
        assert_eq!(file["is_text"], true);

        let listing = call(
            &router,
            "list_files_at_version",
            json!({"snapshot_ref": "v1", "pattern": "**/*.py"}),
        );
        assert_eq!(listing["files"].as_array().unwrap().len(), 1);

        let search = call(
            &router,
            "search_snapshots",
            json!({"query": "print"}),
        );
        let results = search["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["path"], "b/c.py");

        let history = call(
            &router,
            "get_file_history",
            json!({"file_path": "a.txt"}),
        );
        assert_eq!(history["history"][0]["status"], "added");
    }

    #[test]
    fn config_mutation_invalidates_cache() {
        let (dir, router) = setup();
        init(&router, &dir);
        call(&router, "create_snapshot", json!({"tag": "v1"}));

        // ignore *.py from now on
        let result = call(
            &router,
            "manage_ignore_rules",
            json!({"action": "add", "rule_type": "extensions", "values": [".py"]}),
        );
        assert!(result.get("isError").is_none());

        fs::write(dir.path().join("a.txt"), "hello again").unwrap();
        let snap = call(&router, "create_snapshot", json!({"tag": "v2"}));
        // c.py no longer tracked after the config change
        assert_eq!(snap["files_count"], 1);

        let config = call(&router, "get_config", json!({}));
        assert!(config["config"]["ignore"]["extensions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == ".py"));
    }

    #[test]
    fn autosave_lifecycle_over_rpc() {
        let (dir, router) = setup();
        init(&router, &dir);
        let path = dir.path().to_string_lossy().to_string();

        let missing = call(&router, "start_autosave", json!({}));
        assert_eq!(missing["isError"], true);

        let started = call(
            &router,
            "start_autosave",
            json!({"project_path": path, "mode": "timer"}),
        );
        assert_eq!(started["running"], true);

        let status = call(&router, "get_autosave_status", json!({}));
        assert_eq!(status["controllers"].as_array().unwrap().len(), 1);

        let stopped = call(
            &router,
            "stop_autosave",
            json!({"project_path": path}),
        );
        assert_eq!(stopped["running"], false);

        let status = call(&router, "get_autosave_status", json!({}));
        assert!(status["controllers"].as_array().unwrap().is_empty());
        router.shutdown();
    }

    #[test]
    fn project_status_reports_counts() {
        let (dir, router) = setup();
        let before = call(&router, "get_project_status", json!({}));
        assert_eq!(before["initialized"], false);

        init(&router, &dir);
        call(&router, "create_snapshot", json!({"tag": "v1"}));
        let after = call(&router, "get_project_status", json!({}));
        assert_eq!(after["initialized"], true);
        assert_eq!(after["manual_snapshots"], 1);
        assert_eq!(after["autosave_running"], false);
    }

    #[test]
    fn export_and_changelog_tools() {
        let (dir, router) = setup();
        init(&router, &dir);
        call(&router, "create_snapshot", json!({"tag": "v1"}));
        fs::write(dir.path().join("d.txt"), "new").unwrap();
        call(&router, "create_snapshot", json!({"tag": "v2"}));

        let out = dir.path().join("exports/snap");
        let export = call(
            &router,
            "export_snapshot",
            json!({"snapshot_ref": "v1", "output_path": out.to_string_lossy(), "archive": true}),
        );
        assert!(export["output_path"].as_str().unwrap().ends_with(".tar.gz"));
        assert!(export["archive_size"].as_u64().unwrap() > 0);

        let changelog = call(
            &router,
            "generate_changelog",
            json!({"from_ref": "v1", "to_ref": "v2"}),
        );
        assert!(text_of(&changelog).contains("# Changelog"));
        assert!(text_of(&changelog).contains("- `d.txt`"));
    }
}
