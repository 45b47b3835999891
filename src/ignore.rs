//! # Ignore Rules
//!
//! Decides which paths the scanner tracks. Four rule sets, all evaluated
//! against project-relative paths: directory base-names (whole subtree),
//! file base-names, lower-case extensions, and gitignore-style glob
//! patterns. Ignored directories are pruned during the walk, never
//! descended into.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Path filter configured from the project's ignore rules.
pub struct IgnoreFilter {
    dirs: HashSet<String>,
    files: HashSet<String>,
    /// Extensions stored without the leading dot, lower-cased.
    extensions: HashSet<String>,
    patterns: Vec<glob::Pattern>,
}

impl IgnoreFilter {
    pub fn new(dirs: &[String], files: &[String], extensions: &[String], patterns: &[String]) -> Self {
        Self {
            dirs: dirs.iter().map(|d| d.trim_matches('/').to_string()).collect(),
            files: files.iter().cloned().collect(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            // Invalid patterns are dropped rather than failing the scan.
            patterns: patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .collect(),
        }
    }

    /// Whether `rel_path` (project-relative) should be ignored.
    pub fn should_ignore(&self, rel_path: &Path, is_directory: bool) -> bool {
        // Any component matching an ignored directory name prunes the subtree.
        for component in rel_path.components() {
            if let Component::Normal(name) = component {
                if self.dirs.contains(&name.to_string_lossy().to_string()) {
                    return true;
                }
            }
        }

        if !is_directory {
            if let Some(name) = rel_path.file_name() {
                if self.files.contains(&name.to_string_lossy().to_string()) {
                    return true;
                }
            }
            if let Some(ext) = rel_path.extension() {
                if self
                    .extensions
                    .contains(&ext.to_string_lossy().to_ascii_lowercase())
                {
                    return true;
                }
            }
        }

        let rel_str = normalize(rel_path);
        self.patterns.iter().any(|p| p.matches(&rel_str))
    }

    /// Walks `root` depth-first, pruning ignored directories and yielding
    /// only kept regular files. Unreadable directories are skipped silently.
    pub fn scan_directory<'a>(&'a self, root: &'a Path) -> impl Iterator<Item = PathBuf> + 'a {
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
                if rel.as_os_str().is_empty() {
                    return true; // the root itself
                }
                !self.should_ignore(rel, entry.file_type().is_dir())
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
    }
}

/// Project-relative path with forward slashes regardless of host separator.
pub fn normalize(rel_path: &Path) -> String {
    rel_path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn filter() -> IgnoreFilter {
        IgnoreFilter::new(
            &["__pycache__".into(), ".git".into()],
            &[".DS_Store".into()],
            &[".pyc".into(), ".log".into()],
            &["build/**".into(), "*.tmp".into()],
        )
    }

    #[test]
    fn directory_names_prune_subtrees() {
        let f = filter();
        assert!(f.should_ignore(Path::new("__pycache__"), true));
        assert!(f.should_ignore(Path::new("pkg/__pycache__/mod.cpython.pyc"), false));
        assert!(f.should_ignore(Path::new(".git/config"), false));
        assert!(!f.should_ignore(Path::new("src/main.py"), false));
    }

    #[test]
    fn file_names_and_extensions_match() {
        let f = filter();
        assert!(f.should_ignore(Path::new("docs/.DS_Store"), false));
        assert!(f.should_ignore(Path::new("a/b/cache.PYC"), false));
        assert!(f.should_ignore(Path::new("server.log"), false));
        assert!(!f.should_ignore(Path::new("changelog"), false));
    }

    #[test]
    fn glob_patterns_match_relative_path() {
        let f = filter();
        assert!(f.should_ignore(Path::new("build/out/app.bin"), false));
        assert!(f.should_ignore(Path::new("scratch.tmp"), false));
        assert!(!f.should_ignore(Path::new("builder/x"), false));
    }

    #[test]
    fn walk_prunes_ignored_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("__pycache__/deep")).unwrap();
        fs::write(root.join("src/main.py"), "print(1)").unwrap();
        fs::write(root.join("__pycache__/deep/x.bin"), "x").unwrap();
        fs::write(root.join("notes.log"), "skip me").unwrap();
        fs::write(root.join("keep.txt"), "keep").unwrap();

        let f = filter();
        let mut found: Vec<String> = f
            .scan_directory(root)
            .map(|p| normalize(p.strip_prefix(root).unwrap()))
            .collect();
        found.sort();

        assert_eq!(found, vec!["keep.txt", "src/main.py"]);
    }

    #[test]
    fn invalid_pattern_is_dropped() {
        let f = IgnoreFilter::new(&[], &[], &[], &["[".into()]);
        assert!(!f.should_ignore(Path::new("anything"), false));
    }
}
