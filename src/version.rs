//! # Version Manager
//!
//! Orchestrates snapshot creation, retrieval, diffing, restore, export, file
//! history, content search, changelog generation, and the cleanup
//! operations. Creation is atomic: the metadata row, file links, and newly
//! persisted blobs either all commit or none do.

use crate::config::{DiffFormatKind, ProjectConfig, STORAGE_DIR};
use crate::db::{FileEntry, MetadataDB, Snapshot, SnapshotMetadata};
use crate::diff::{ModifiedEntry, SnapshotDiff};
use crate::error::{EngineError, Result};
use crate::hasher;
use crate::ignore::IgnoreFilter;
use crate::scanner::Scanner;
use crate::store::ContentStore;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Reserved ref meaning "the working tree at the moment of the call".
pub const CURRENT_REF: &str = "current";

/// Search caps: files per query, preview lines per file.
const SEARCH_MAX_FILES: usize = 50;
const SEARCH_MAX_LINES: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub message: Option<String>,
    pub tag: Option<String>,
    pub include_paths: Option<Vec<String>>,
    pub exclude_paths: Option<Vec<String>>,
    pub include_binary: bool,
    pub is_autosave: bool,
    pub trigger_type: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
    pub total: usize,
    pub files_restored: Vec<String>,
    pub files_skipped: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ExportReport {
    pub files_exported: usize,
    pub total_size: u64,
    pub output_path: String,
    /// Set in archive mode only.
    pub archive_size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub snapshot_id: i64,
    pub tag: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// "added", "modified", "unchanged", or "removed".
    pub status: String,
    pub hash: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SearchMatch {
    pub line: usize,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub snapshot_id: i64,
    pub snapshot_label: String,
    pub path: String,
    pub matches: Vec<SearchMatch>,
    pub total_matches: usize,
}

pub struct VersionManager {
    root: PathBuf,
    config: ProjectConfig,
    db: Arc<MetadataDB>,
    store: ContentStore,
    scanner: Scanner,
}

impl VersionManager {
    /// Opens the manager over an existing (or fresh) metadata store.
    pub fn open(root: &Path, config: ProjectConfig) -> Result<Self> {
        let db = Arc::new(MetadataDB::open(&ProjectConfig::db_path(root))?);
        Ok(Self::with_db(root, config, db))
    }

    pub fn with_db(root: &Path, config: ProjectConfig, db: Arc<MetadataDB>) -> Self {
        let store = ContentStore::new(
            Arc::clone(&db),
            config.compression_enabled,
            config.compression_level,
        );

        // The storage directory is never tracked, whatever the config says.
        let mut dirs = config.ignore.dirs.clone();
        if !dirs.iter().any(|d| d == STORAGE_DIR) {
            dirs.push(STORAGE_DIR.to_string());
        }
        let filter = IgnoreFilter::new(
            &dirs,
            &config.ignore.files,
            &config.ignore.extensions,
            &config.ignore.patterns,
        );
        let scanner = Scanner::new(root.to_path_buf(), filter);

        Self {
            root: root.to_path_buf(),
            config,
            db,
            store,
            scanner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<MetadataDB> {
        &self.db
    }

    // ─── Creation ───────────────────────────────────────────────────────────

    /// Scans the tree and records a snapshot.
    ///
    /// Fails with `NoChanges` when the deterministic snapshot hash matches an
    /// existing snapshot, and `DuplicateTag` when the tag is taken.
    pub fn create_snapshot(&self, opts: CreateOptions) -> Result<Snapshot> {
        if let Some(tag) = &opts.tag {
            if tag == CURRENT_REF {
                return Err(EngineError::Invalid(format!(
                    "'{CURRENT_REF}' is a reserved reference and cannot be used as a tag"
                )));
            }
        }

        let entries = self.scanner.scan(
            opts.include_paths.as_deref(),
            opts.exclude_paths.as_deref(),
            opts.include_binary,
        )?;
        let snap_hash =
            hasher::snapshot_hash(entries.iter().map(|e| (e.path.as_str(), e.hash.as_str())));
        let trigger = opts.trigger_type.as_deref().unwrap_or("manual");

        let id = self.db.with_tx(|tx| {
            if MetadataDB::snapshot_hash_exists(tx, &snap_hash)? {
                return Err(EngineError::NoChanges);
            }
            if let Some(tag) = &opts.tag {
                if MetadataDB::tag_exists(tx, tag)? {
                    return Err(EngineError::DuplicateTag(tag.clone()));
                }
            }

            let parent_id = MetadataDB::latest_snapshot_id(tx)?;
            let id = MetadataDB::insert_snapshot(
                tx,
                &snap_hash,
                opts.message.as_deref(),
                opts.tag.as_deref(),
                parent_id,
                opts.is_autosave,
                trigger,
            )?;

            let mut total_size = 0u64;
            let mut compressed_size = 0u64;
            for entry in &entries {
                MetadataDB::add_file(tx, id, entry)?;
                let abs = self.root.join(&entry.path);
                let (_, stored) = self.store.ingest(tx, &abs, &entry.hash)?;
                total_size += entry.size;
                compressed_size += stored;
            }
            MetadataDB::finalize_snapshot(tx, id, entries.len() as u64, total_size, compressed_size)?;
            Ok(id)
        })?;

        info!(id, files = entries.len(), trigger, "created snapshot");
        let meta = self
            .db
            .get_snapshot(id)?
            .ok_or_else(|| EngineError::SnapshotNotFound(id.to_string()))?;
        Ok(Snapshot {
            meta,
            files: entries,
        })
    }

    // ─── Retrieval ──────────────────────────────────────────────────────────

    /// Looks up a snapshot by ref: integers resolve as ids, anything else as
    /// a tag. `None` when not found.
    pub fn get_snapshot(&self, snapshot_ref: &str) -> Result<Option<SnapshotMetadata>> {
        if let Ok(id) = snapshot_ref.parse::<i64>() {
            self.db.get_snapshot(id)
        } else {
            self.db.get_snapshot_by_tag(snapshot_ref)
        }
    }

    fn resolve(&self, snapshot_ref: &str) -> Result<SnapshotMetadata> {
        self.get_snapshot(snapshot_ref)?
            .ok_or_else(|| EngineError::SnapshotNotFound(snapshot_ref.to_string()))
    }

    pub fn list_snapshots(
        &self,
        limit: Option<usize>,
        include_autosave: bool,
    ) -> Result<Vec<SnapshotMetadata>> {
        self.db.list_snapshots(limit, include_autosave)
    }

    pub fn snapshot_files(&self, snapshot_ref: &str) -> Result<(SnapshotMetadata, Vec<FileEntry>)> {
        let meta = self.resolve(snapshot_ref)?;
        let files = self.db.snapshot_files(meta.id)?;
        Ok((meta, files))
    }

    pub fn delete_snapshot(&self, snapshot_ref: &str) -> Result<SnapshotMetadata> {
        let meta = self.resolve(snapshot_ref)?;
        self.db.delete_snapshot(meta.id)?;
        info!(id = meta.id, "deleted snapshot");
        Ok(meta)
    }

    /// Bytes of one file as recorded in a snapshot.
    pub fn get_file_at_version(&self, snapshot_ref: &str, path: &str) -> Result<Vec<u8>> {
        let (meta, files) = self.snapshot_files(snapshot_ref)?;
        let entry = files
            .iter()
            .find(|f| f.path == path)
            .ok_or_else(|| EngineError::FileNotInSnapshot {
                snapshot: label(&meta),
                path: path.to_string(),
            })?;
        self.store
            .content_bytes(&entry.hash)?
            .ok_or_else(|| EngineError::ContentMissing {
                hash: entry.hash.clone(),
            })
    }

    /// Files in a snapshot, optionally filtered by a full-path glob.
    pub fn list_files_at_version(
        &self,
        snapshot_ref: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<FileEntry>> {
        let (_, files) = self.snapshot_files(snapshot_ref)?;
        match pattern {
            None => Ok(files),
            Some(raw) => {
                let pattern = glob::Pattern::new(raw)?;
                Ok(files
                    .into_iter()
                    .filter(|f| pattern.matches(&f.path))
                    .collect())
            }
        }
    }

    // ─── Restore & export ───────────────────────────────────────────────────

    /// Restores files from a snapshot into `target_dir` (the project root by
    /// default). Existing files are skipped unless `force` is set.
    pub fn restore(
        &self,
        snapshot_ref: &str,
        target_dir: Option<&Path>,
        force: bool,
        file_filters: Option<&[String]>,
    ) -> Result<RestoreReport> {
        let (_, files) = self.snapshot_files(snapshot_ref)?;
        let base = target_dir.unwrap_or(&self.root);

        let mut report = RestoreReport::default();
        for entry in files
            .iter()
            .filter(|f| matches_filters(&f.path, file_filters))
        {
            report.total += 1;
            let target = base.join(&entry.path);
            if self
                .store
                .restore_file(&entry.hash, &target, entry.mode, force)?
            {
                report.restored += 1;
                report.files_restored.push(entry.path.clone());
            } else {
                report.skipped += 1;
                report.files_skipped.push(entry.path.clone());
            }
        }
        info!(
            snapshot = snapshot_ref,
            restored = report.restored,
            skipped = report.skipped,
            "restore finished"
        );
        Ok(report)
    }

    /// Exports a snapshot to a folder, or to a gzip-compressed tar when
    /// `archive` is set (the output path is normalized to `.tar.gz`).
    pub fn export(
        &self,
        snapshot_ref: &str,
        output_path: &Path,
        archive: bool,
        file_filters: Option<&[String]>,
    ) -> Result<ExportReport> {
        let (meta, files) = self.snapshot_files(snapshot_ref)?;
        let selected: Vec<&FileEntry> = files
            .iter()
            .filter(|f| matches_filters(&f.path, file_filters))
            .collect();
        let total_size: u64 = selected.iter().map(|f| f.size).sum();

        if !archive {
            for entry in &selected {
                let target = output_path.join(&entry.path);
                self.store
                    .restore_file(&entry.hash, &target, entry.mode, true)?;
            }
            return Ok(ExportReport {
                files_exported: selected.len(),
                total_size,
                output_path: output_path.to_string_lossy().to_string(),
                archive_size: None,
            });
        }

        let archive_path = normalize_archive_path(output_path);
        if let Some(parent) = archive_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = std::fs::File::create(&archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mtime = meta.created_at.timestamp().max(0) as u64;
        for entry in &selected {
            let bytes =
                self.store
                    .content_bytes(&entry.hash)?
                    .ok_or_else(|| EngineError::ContentMissing {
                        hash: entry.hash.clone(),
                    })?;
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(entry.mode);
            header.set_mtime(mtime);
            header.set_cksum();
            builder.append_data(&mut header, &entry.path, bytes.as_slice())?;
        }
        builder.into_inner()?.finish()?;

        let archive_size = std::fs::metadata(&archive_path)?.len();
        Ok(ExportReport {
            files_exported: selected.len(),
            total_size,
            output_path: archive_path.to_string_lossy().to_string(),
            archive_size: Some(archive_size),
        })
    }

    // ─── Diffing ────────────────────────────────────────────────────────────

    /// Compares two refs; `"current"` on the to-side (and from-side) means a
    /// live scan of the working tree.
    pub fn diff(
        &self,
        from_ref: &str,
        to_ref: &str,
        file_filters: Option<&[String]>,
    ) -> Result<SnapshotDiff> {
        let (from_label, from_map) = self.side_map(from_ref, file_filters)?;
        let (to_label, to_map) = self.side_map(to_ref, file_filters)?;
        Ok(SnapshotDiff::compute(
            &from_label,
            &to_label,
            &from_map,
            &to_map,
        ))
    }

    fn side_map(
        &self,
        snapshot_ref: &str,
        file_filters: Option<&[String]>,
    ) -> Result<(String, BTreeMap<String, String>)> {
        let (label, entries) = if snapshot_ref == CURRENT_REF {
            (
                CURRENT_REF.to_string(),
                self.scanner.scan(None, None, false)?,
            )
        } else {
            let (meta, files) = self.snapshot_files(snapshot_ref)?;
            (label(&meta), files)
        };
        let map = entries
            .into_iter()
            .filter(|e| matches_filters(&e.path, file_filters))
            .map(|e| (e.path, e.hash))
            .collect();
        Ok((label, map))
    }

    /// Renders a computed diff in the requested format. `Ast` is not a
    /// separate engine and degrades to unified output with a preamble.
    pub fn render_diff(&self, diff: &SnapshotDiff, format: DiffFormatKind) -> String {
        let context = self.config.diff_format.unified_context;
        let to_is_current = diff.to_label == CURRENT_REF;
        match format {
            DiffFormatKind::Json => diff.render_json(),
            DiffFormatKind::Markdown => diff.render_markdown(),
            DiffFormatKind::Unified => self.render_unified(diff, context, to_is_current),
            DiffFormatKind::Ast => format!(
                "AST diff is not available; falling back to unified output.\n{}",
                self.render_unified(diff, context, to_is_current)
            ),
        }
    }

    fn render_unified(&self, diff: &SnapshotDiff, context: usize, to_is_current: bool) -> String {
        diff.render_unified(
            context,
            |entry: &ModifiedEntry| self.store.content_text(&entry.old_hash).ok().flatten(),
            |entry: &ModifiedEntry| {
                if to_is_current {
                    std::fs::read_to_string(self.root.join(&entry.path)).ok()
                } else {
                    self.store.content_text(&entry.new_hash).ok().flatten()
                }
            },
        )
    }

    // ─── History, search, changelog ─────────────────────────────────────────

    /// Chronological history of one file across all snapshots (ascending id),
    /// including the transition to "removed" when it disappears.
    pub fn file_history(&self, path: &str) -> Result<Vec<HistoryEntry>> {
        let mut history = Vec::new();
        let mut previous: Option<String> = None;

        for meta in self.db.all_snapshots_ascending()? {
            let entry = self
                .db
                .snapshot_files(meta.id)?
                .into_iter()
                .find(|f| f.path == path);

            match entry {
                Some(file) => {
                    let status = match &previous {
                        None => "added",
                        Some(prev) if *prev != file.hash => "modified",
                        Some(_) => "unchanged",
                    };
                    history.push(HistoryEntry {
                        snapshot_id: meta.id,
                        tag: meta.tag.clone(),
                        message: meta.message.clone(),
                        created_at: meta.created_at,
                        status: status.to_string(),
                        hash: Some(file.hash.clone()),
                        size: Some(file.size),
                    });
                    previous = Some(file.hash);
                }
                None => {
                    if previous.is_some() {
                        history.push(HistoryEntry {
                            snapshot_id: meta.id,
                            tag: meta.tag.clone(),
                            message: meta.message.clone(),
                            created_at: meta.created_at,
                            status: "removed".to_string(),
                            hash: None,
                            size: None,
                        });
                        previous = None;
                    }
                }
            }
        }
        Ok(history)
    }

    /// Searches snapshot content for a substring. Each unique content hash is
    /// decompressed at most once; repeated (path, hash) pairs across
    /// snapshots are reported once. Capped at 50 files, 5 preview lines each.
    pub fn search(
        &self,
        query: &str,
        file_filter: Option<&str>,
        snapshot_ref: Option<&str>,
        case_sensitive: bool,
    ) -> Result<Vec<SearchResult>> {
        let snapshots = match snapshot_ref {
            Some(r) => vec![self.resolve(r)?],
            None => self.db.list_snapshots(None, false)?,
        };
        let pattern = file_filter.map(glob::Pattern::new).transpose()?;
        let needle = if case_sensitive {
            query.to_string()
        } else {
            query.to_lowercase()
        };

        let mut content_cache: HashMap<String, Option<String>> = HashMap::new();
        let mut reported: HashSet<(String, String)> = HashSet::new();
        let mut results = Vec::new();

        'outer: for meta in &snapshots {
            for file in self.db.snapshot_files(meta.id)? {
                if results.len() >= SEARCH_MAX_FILES {
                    break 'outer;
                }
                if let Some(p) = &pattern {
                    if !p.matches(&file.path) {
                        continue;
                    }
                }
                let key = (file.hash.clone(), file.path.clone());
                if reported.contains(&key) {
                    continue;
                }

                let text = match content_cache.get(&file.hash) {
                    Some(cached) => cached.clone(),
                    None => {
                        let text = self.store.content_text(&file.hash)?;
                        content_cache.insert(file.hash.clone(), text.clone());
                        text
                    }
                };
                let Some(text) = text else { continue };

                let mut matches = Vec::new();
                let mut total_matches = 0usize;
                for (idx, line) in text.lines().enumerate() {
                    let haystack = if case_sensitive {
                        line.to_string()
                    } else {
                        line.to_lowercase()
                    };
                    let count = haystack.matches(needle.as_str()).count();
                    if count > 0 {
                        total_matches += count;
                        if matches.len() < SEARCH_MAX_LINES {
                            matches.push(SearchMatch {
                                line: idx + 1,
                                content: line.trim().to_string(),
                            });
                        }
                    }
                }

                if total_matches > 0 {
                    reported.insert(key);
                    results.push(SearchResult {
                        snapshot_id: meta.id,
                        snapshot_label: label(meta),
                        path: file.path,
                        matches,
                        total_matches,
                    });
                }
            }
        }
        debug!(query, hits = results.len(), "search finished");
        Ok(results)
    }

    /// Keep-a-Changelog Markdown between two refs (`to` defaults to the
    /// working tree).
    pub fn changelog(&self, from_ref: &str, to_ref: Option<&str>) -> Result<String> {
        let to_ref = to_ref.unwrap_or(CURRENT_REF);
        let to_date = if to_ref == CURRENT_REF {
            Utc::now().format("%Y-%m-%d").to_string()
        } else {
            self.resolve(to_ref)?.created_at.format("%Y-%m-%d").to_string()
        };
        let diff = self.diff(from_ref, to_ref, None)?;
        Ok(diff.render_changelog(&to_date))
    }

    // ─── Cleanup ────────────────────────────────────────────────────────────

    pub fn cleanup_old_autosaves(&self, max_keep: usize) -> Result<usize> {
        self.db.cleanup_old_autosaves(max_keep)
    }

    pub fn cleanup_expired_autosaves(&self, days: u32) -> Result<usize> {
        self.db.cleanup_expired_autosaves(days)
    }

    pub fn cleanup_orphaned_contents(&self) -> Result<usize> {
        self.db.cleanup_orphaned_contents()
    }
}

/// Display label for a snapshot: its tag when present, else `#id`.
pub fn label(meta: &SnapshotMetadata) -> String {
    meta.tag
        .clone()
        .unwrap_or_else(|| format!("#{}", meta.id))
}

/// File-filter semantics shared by restore, export, and diff: a filter
/// selects a path when it glob-matches the full path or is a literal prefix.
pub fn matches_filters(path: &str, filters: Option<&[String]>) -> bool {
    match filters {
        None => true,
        Some(filters) if filters.is_empty() => true,
        Some(filters) => filters.iter().any(|f| {
            glob::Pattern::new(f)
                .map(|p| p.matches(path))
                .unwrap_or(false)
                || path.starts_with(f.as_str())
        }),
    }
}

/// Formats a byte count as a human-readable size string.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}

fn normalize_archive_path(path: &Path) -> PathBuf {
    match path.file_name() {
        Some(name) if name.to_string_lossy().ends_with(".tar.gz") => path.to_path_buf(),
        Some(_) => path.with_extension("tar.gz"),
        None => path.with_file_name("export.tar.gz"),
    }
}
