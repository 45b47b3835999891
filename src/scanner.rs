//! # Working-Tree Scanner
//!
//! Walks the project through the ignore filter and produces the ordered list
//! of file entries for a snapshot: project-relative forward-slash path,
//! streamed SHA-256 content hash, byte size, and mode bits. Unreadable files
//! are logged and skipped; they never fail the scan.

use crate::db::FileEntry;
use crate::error::Result;
use crate::hasher;
use crate::ignore::{self, IgnoreFilter};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

/// How many leading bytes the binary sniff inspects.
const SNIFF_LEN: usize = 8 * 1024;

/// Fraction of non-text bytes above which a file counts as binary.
const BINARY_THRESHOLD: f64 = 0.30;

pub struct Scanner {
    root: PathBuf,
    filter: IgnoreFilter,
}

impl Scanner {
    pub fn new(root: PathBuf, filter: IgnoreFilter) -> Self {
        Self { root, filter }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scans the tree and returns entries ordered by path.
    ///
    /// `include_paths` restricts the walk to the given files or directories
    /// (still filtered through the ignore rules); `exclude_paths` removes
    /// exact project-relative matches afterwards.
    pub fn scan(
        &self,
        include_paths: Option<&[String]>,
        exclude_paths: Option<&[String]>,
        include_binary: bool,
    ) -> Result<Vec<FileEntry>> {
        let mut candidates: Vec<PathBuf> = Vec::new();

        match include_paths {
            Some(paths) => {
                for raw in paths {
                    let abs = self.absolute(raw);
                    if abs.is_dir() {
                        candidates.extend(self.filter.scan_directory(&abs));
                    } else if abs.is_file() {
                        let rel = abs.strip_prefix(&self.root).unwrap_or(&abs).to_path_buf();
                        if !self.filter.should_ignore(&rel, false) {
                            candidates.push(abs);
                        }
                    }
                }
            }
            None => candidates.extend(self.filter.scan_directory(&self.root)),
        }

        let excluded: HashSet<&str> = exclude_paths
            .map(|p| p.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        for abs in candidates {
            let rel = match abs.strip_prefix(&self.root) {
                Ok(rel) => ignore::normalize(rel),
                Err(_) => continue,
            };
            if excluded.contains(rel.as_str()) || !seen.insert(rel.clone()) {
                continue;
            }

            match self.entry_for(&abs, rel, include_binary) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(path = %abs.display(), error = %e, "skipping unreadable file"),
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn entry_for(&self, abs: &Path, rel: String, include_binary: bool) -> Result<Option<FileEntry>> {
        if !include_binary && is_binary(abs)? {
            return Ok(None);
        }

        let metadata = std::fs::metadata(abs)?;
        let hash = hasher::hash_file(abs)?;

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = 0o644;

        Ok(Some(FileEntry {
            path: rel,
            hash,
            size: metadata.len(),
            mode,
        }))
    }

    fn absolute(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

/// Sniffs the first 8 KiB: a null byte or a >30% non-text fraction marks the
/// file as binary.
fn is_binary(path: &Path) -> Result<bool> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let n = file.read(&mut buf)?;
    let head = &buf[..n];

    if head.is_empty() {
        return Ok(false);
    }
    if head.contains(&0) {
        return Ok(true);
    }

    let non_text = head.iter().filter(|&&b| !is_text_byte(b)).count();
    Ok(non_text as f64 / head.len() as f64 > BINARY_THRESHOLD)
}

/// Text bytes: bell, backspace, tab, newline, form feed, carriage return,
/// escape, and 0x20–0xFF minus DEL.
fn is_text_byte(b: u8) -> bool {
    matches!(b, 7 | 8 | 9 | 10 | 12 | 13 | 27) || (b >= 0x20 && b != 0x7F)
}
