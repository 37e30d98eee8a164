//! Local tree enumeration for directory uploads.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A regular file under the enumerated root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Path relative to the root, `/`-separated.
    pub relative: String,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct LocalTree {
    pub files: Vec<FileEntry>,
    /// Relative paths of directories with nothing in them.
    pub empty_dirs: Vec<String>,
}

/// Name patterns to skip; `*` matches any run of characters.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub exclude: Vec<String>,
}

impl FileFilter {
    fn excludes(&self, name: &str) -> bool {
        self.exclude.iter().any(|p| glob_match(p, name))
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if text.len() < first.len() + last.len() || !text.starts_with(first) || !text.ends_with(last) {
        return false;
    }
    let mut rest = &text[first.len()..text.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(i) => rest = &rest[i + middle.len()..],
            None => return false,
        }
    }
    true
}

fn relative_string(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Walk `root` without following links. Unreadable entries are skipped.
pub fn enumerate_tree(root: &Path, filter: &FileFilter) -> Result<LocalTree> {
    let meta = std::fs::metadata(root).with_context(|| format!("stat {}", root.display()))?;
    let mut tree = LocalTree::default();
    if meta.is_file() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tree.files.push(FileEntry {
            path: root.to_path_buf(),
            relative: name,
            size: meta.len(),
        });
        return Ok(tree);
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !filter.excludes(&e.file_name().to_string_lossy()));
    for entry in walker.filter_map(|e| e.ok()) {
        if entry.depth() == 0 {
            continue;
        }
        let Some(relative) = relative_string(root, entry.path()) else {
            continue;
        };
        if entry.file_type().is_file() {
            if let Ok(m) = entry.metadata() {
                tree.files.push(FileEntry {
                    path: entry.path().to_path_buf(),
                    relative,
                    size: m.len(),
                });
            }
        } else if entry.file_type().is_dir() {
            let empty = std::fs::read_dir(entry.path())
                .map(|mut d| d.next().is_none())
                .unwrap_or(false);
            if empty {
                tree.empty_dirs.push(relative);
            }
        }
    }
    Ok(tree)
}
