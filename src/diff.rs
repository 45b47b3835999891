//! # Snapshot Diffing
//!
//! Set-level comparison of two snapshot file-maps (added / removed /
//! modified with hash pairs), a scalar significance, and the renderings the
//! request layer exposes: unified line diffs, structured JSON, Markdown, and
//! the Keep-a-Changelog document.

use serde::Serialize;
use std::collections::BTreeMap;

/// A file present on both sides with differing content.
#[derive(Debug, Clone, Serialize)]
pub struct ModifiedEntry {
    pub path: String,
    pub old_hash: String,
    pub new_hash: String,
}

/// Differences between two snapshots (or a snapshot and the working tree).
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDiff {
    pub from_label: String,
    pub to_label: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<ModifiedEntry>,
    pub from_files: usize,
    pub to_files: usize,
    pub total_changes: usize,
    pub significance: f64,
}

impl SnapshotDiff {
    /// Compares two path→content-hash maps.
    pub fn compute(
        from_label: &str,
        to_label: &str,
        from: &BTreeMap<String, String>,
        to: &BTreeMap<String, String>,
    ) -> Self {
        let mut added = Vec::new();
        let mut modified = Vec::new();

        for (path, new_hash) in to {
            match from.get(path) {
                None => added.push(path.clone()),
                Some(old_hash) if old_hash != new_hash => modified.push(ModifiedEntry {
                    path: path.clone(),
                    old_hash: old_hash.clone(),
                    new_hash: new_hash.clone(),
                }),
                Some(_) => {}
            }
        }

        let removed: Vec<String> = from
            .keys()
            .filter(|p| !to.contains_key(*p))
            .cloned()
            .collect();

        let total_changes = added.len() + removed.len() + modified.len();
        let denominator = from.len().max(to.len()).max(1);

        Self {
            from_label: from_label.to_string(),
            to_label: to_label.to_string(),
            added,
            removed,
            modified,
            from_files: from.len(),
            to_files: to.len(),
            total_changes,
            significance: total_changes as f64 / denominator as f64,
        }
    }

    pub fn has_changes(&self) -> bool {
        self.total_changes > 0
    }

    /// Unified line diff for every modified file, with file-level markers for
    /// additions and removals. `old_text` / `new_text` resolve a modified
    /// entry to its text content; non-text files degrade to a binary note.
    pub fn render_unified<F, G>(&self, context: usize, old_text: F, new_text: G) -> String
    where
        F: Fn(&ModifiedEntry) -> Option<String>,
        G: Fn(&ModifiedEntry) -> Option<String>,
    {
        let mut out = String::new();
        out.push_str(&format!(
            "diff {} -> {} ({} changes, significance {:.2})\n",
            self.from_label, self.to_label, self.total_changes, self.significance
        ));

        for path in &self.added {
            out.push_str(&format!("added: {path}\n"));
        }
        for path in &self.removed {
            out.push_str(&format!("removed: {path}\n"));
        }

        for entry in &self.modified {
            out.push('\n');
            match (old_text(entry), new_text(entry)) {
                (Some(old), Some(new)) => {
                    let text_diff = similar::TextDiff::from_lines(&old, &new);
                    let unified = text_diff
                        .unified_diff()
                        .context_radius(context)
                        .header(
                            &format!("a/{}", entry.path),
                            &format!("b/{}", entry.path),
                        )
                        .to_string();
                    out.push_str(&unified);
                }
                _ => {
                    out.push_str(&format!(
                        "binary files a/{path} and b/{path} differ\n",
                        path = entry.path
                    ));
                }
            }
        }
        out
    }

    /// Structured JSON rendering.
    pub fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Human/LLM-oriented Markdown rendering.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "## Diff: {} → {}\n\n",
            self.from_label, self.to_label
        ));
        if !self.has_changes() {
            out.push_str("No changes.\n");
            return out;
        }
        if !self.added.is_empty() {
            out.push_str("### Added\n\n");
            for path in &self.added {
                out.push_str(&format!("- `{path}`\n"));
            }
            out.push('\n');
        }
        if !self.modified.is_empty() {
            out.push_str("### Modified\n\n");
            for entry in &self.modified {
                out.push_str(&format!("- `{}`\n", entry.path));
            }
            out.push('\n');
        }
        if !self.removed.is_empty() {
            out.push_str("### Removed\n\n");
            for path in &self.removed {
                out.push_str(&format!("- `{path}`\n"));
            }
            out.push('\n');
        }
        out.push_str(&format!(
            "**Total**: {} change(s), significance {:.2}\n",
            self.total_changes, self.significance
        ));
        out
    }

    /// Keep-a-Changelog-style Markdown: Added / Changed / Removed sections
    /// sorted alphabetically, with a comparison line and a counts trailer.
    pub fn render_changelog(&self, to_date: &str) -> String {
        let mut out = String::new();
        out.push_str("# Changelog\n\n");
        out.push_str(&format!("## {} - {}\n\n", self.to_label, to_date));
        out.push_str(&format!("Compared with {}.\n\n", self.from_label));

        if !self.added.is_empty() {
            out.push_str("### Added\n\n");
            let mut added = self.added.clone();
            added.sort();
            for path in added {
                out.push_str(&format!("- `{path}`\n"));
            }
            out.push('\n');
        }
        if !self.modified.is_empty() {
            out.push_str("### Changed\n\n");
            let mut changed: Vec<&str> = self.modified.iter().map(|m| m.path.as_str()).collect();
            changed.sort();
            for path in changed {
                out.push_str(&format!("- `{path}`\n"));
            }
            out.push('\n');
        }
        if !self.removed.is_empty() {
            out.push_str("### Removed\n\n");
            let mut removed = self.removed.clone();
            removed.sort();
            for path in removed {
                out.push_str(&format!("- `{path}`\n"));
            }
            out.push('\n');
        }

        if !self.has_changes() {
            out.push_str("No changes.\n\n");
        }
        out.push_str(&format!(
            "---\n{} added, {} changed, {} removed ({} total, significance {:.2})\n",
            self.added.len(),
            self.modified.len(),
            self.removed.len(),
            self.total_changes,
            self.significance
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect()
    }

    #[test]
    fn classifies_added_removed_modified() {
        let a = map(&[("a.txt", "h1"), ("b.txt", "h2"), ("c.txt", "h3")]);
        let b = map(&[("a.txt", "h1"), ("b.txt", "h2x"), ("d.txt", "h4")]);
        let diff = SnapshotDiff::compute("v1", "v2", &a, &b);

        assert_eq!(diff.added, vec!["d.txt"]);
        assert_eq!(diff.removed, vec!["c.txt"]);
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].path, "b.txt");
        assert_eq!(diff.modified[0].old_hash, "h2");
        assert_eq!(diff.modified[0].new_hash, "h2x");
        assert_eq!(diff.total_changes, 3);
        assert!((diff.significance - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn set_symmetry() {
        let a = map(&[("a", "1"), ("b", "2")]);
        let b = map(&[("b", "2"), ("c", "3")]);
        let ab = SnapshotDiff::compute("a", "b", &a, &b);
        let ba = SnapshotDiff::compute("b", "a", &b, &a);
        assert_eq!(ab.added, ba.removed);
        assert_eq!(ab.removed, ba.added);
    }

    #[test]
    fn self_diff_is_empty() {
        let a = map(&[("a", "1")]);
        let diff = SnapshotDiff::compute("a", "a", &a, &a);
        assert_eq!(diff.total_changes, 0);
        assert!(!diff.has_changes());
        assert_eq!(diff.significance, 0.0);
    }

    #[test]
    fn significance_denominator_uses_larger_side() {
        let a = map(&[("a", "1"), ("b", "2")]);
        let b = map(&[("a", "1"), ("b", "2x")]);
        let diff = SnapshotDiff::compute("v1", "v2", &a, &b);
        assert!((diff.significance - 0.5).abs() < f64::EPSILON);

        // pure additions stay below 1.0 by design
        let empty = map(&[]);
        let grown = map(&[("a", "1"), ("b", "2")]);
        let diff = SnapshotDiff::compute("v0", "v1", &empty, &grown);
        assert!((diff.significance - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_vs_empty_has_zero_significance() {
        let empty = map(&[]);
        let diff = SnapshotDiff::compute("a", "b", &empty, &empty);
        assert_eq!(diff.significance, 0.0);
    }

    #[test]
    fn unified_rendering_includes_hunks() {
        let a = map(&[("a.txt", "h1")]);
        let b = map(&[("a.txt", "h2")]);
        let diff = SnapshotDiff::compute("v1", "v2", &a, &b);

        let text = diff.render_unified(
            3,
            |_| Some("line one\nline two\n".to_string()),
            |_| Some("line one\nline 2\n".to_string()),
        );
        assert!(text.contains("a/a.txt"));
        assert!(text.contains("b/a.txt"));
        assert!(text.contains("-line two"));
        assert!(text.contains("+line 2"));
    }

    #[test]
    fn unified_rendering_marks_binary() {
        let a = map(&[("blob", "h1")]);
        let b = map(&[("blob", "h2")]);
        let diff = SnapshotDiff::compute("v1", "v2", &a, &b);
        let text = diff.render_unified(3, |_| None, |_| Some("x".into()));
        assert!(text.contains("binary files a/blob and b/blob differ"));
    }

    #[test]
    fn changelog_sections_are_sorted() {
        let a = map(&[("zebra.txt", "1"), ("mid.txt", "2")]);
        let b = map(&[("alpha.txt", "3"), ("mid.txt", "2x")]);
        let diff = SnapshotDiff::compute("v1", "v2", &a, &b);
        let text = diff.render_changelog("2026-08-01");

        assert!(text.starts_with("# Changelog"));
        assert!(text.contains("## v2 - 2026-08-01"));
        assert!(text.contains("Compared with v1."));
        let added_pos = text.find("### Added").unwrap();
        let changed_pos = text.find("### Changed").unwrap();
        let removed_pos = text.find("### Removed").unwrap();
        assert!(added_pos < changed_pos && changed_pos < removed_pos);
        assert!(text.contains("1 added, 1 changed, 1 removed"));
    }

    #[test]
    fn json_rendering_is_structured() {
        let a = map(&[("a", "1")]);
        let b = map(&[]);
        let diff = SnapshotDiff::compute("v1", "current", &a, &b);
        let parsed: serde_json::Value = serde_json::from_str(&diff.render_json()).unwrap();
        assert_eq!(parsed["removed"][0], "a");
        assert_eq!(parsed["total_changes"], 1);
    }
}
