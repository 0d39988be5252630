//! Recursive file discovery by extension.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursively collect regular files under `directory` whose names end in one
/// of `extensions` (given without the leading dot, e.g. `"tar.gz"`).
///
/// Results are sorted so repeated runs see the same order. Unreadable
/// directory entries are skipped.
pub fn discover_files(directory: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let suffixes: Vec<String> = extensions.iter().map(|ext| format!(".{ext}")).collect();

    let mut files: Vec<PathBuf> = WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort_by(|a, b| a.to_string_lossy().cmp(&b.to_string_lossy()));
    files
}
