//! Before/after snapshots of a project tree.
//!
//! A snapshot maps project-relative file paths to modification times. Comparing
//! two snapshots yields files that are new or whose mtime changed. Files that
//! disappear between snapshots are not reported.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Interpreter bytecode caches, skipped like dot-directories.
const SKIPPED_DIRS: [&str; 1] = ["__pycache__"];

/// Modification times of every regular file under a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    files: BTreeMap<String, SystemTime>,
}

impl FileSnapshot {
    /// Walk `root`, skipping dot-directories and interpreter caches.
    /// Unreadable entries are left out.
    pub fn capture(root: &Path) -> Self {
        let mut files = BTreeMap::new();

        let walker = WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            // Links to regular files count, with the target's mtime. Links to
            // directories are not descended into.
            let metadata = if entry.path_is_symlink() {
                std::fs::metadata(entry.path()).ok()
            } else {
                entry.metadata().ok()
            };
            let Some(modified) = metadata
                .filter(std::fs::Metadata::is_file)
                .and_then(|m| m.modified().ok())
            else {
                continue;
            };
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            files.insert(relative.to_string_lossy().into_owned(), modified);
        }

        Self { files }
    }

    /// Paths that are new in `after` or whose mtime differs, sorted.
    pub fn modified_since(&self, after: &Self) -> Vec<String> {
        after
            .files
            .iter()
            .filter(|(path, mtime)| self.files.get(*path) != Some(*mtime))
            .map(|(path, _)| path.clone())
            .collect()
    }

    #[cfg(test)]
    fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&&*name)
}
