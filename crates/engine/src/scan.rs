//! Expands import arguments into media files.
//!
//! Plain files are taken as given. Directories are walked recursively for
//! files with a media extension; hidden directories are not entered.

use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Media file extensions picked up from directories (case-insensitive matching).
pub const MEDIA_EXTENSIONS: &[&str] = &[
    ".mov", ".mp4", ".m4v", ".mkv", ".avi", ".webm", ".mts", ".m2ts", ".ts",
];

/// Checks if a file has a media extension (case-insensitive).
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            MEDIA_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

fn is_hidden_dir(entry: &walkdir::DirEntry) -> bool {
    // The root itself may be hidden.
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Media files below `root`, sorted by path.
pub fn scan_dir(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !is_hidden_dir(entry))
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_media_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    debug!(root = %root.display(), found = files.len(), "Scanned directory");
    files
}

/// Expand a list of import arguments, keeping their order.
///
/// Duplicates are dropped; paths that do not exist are passed through so the
/// import reports them as errors.
pub fn collect_media(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for path in paths {
        let found = if path.is_dir() {
            scan_dir(path)
        } else {
            vec![path.clone()]
        };
        for file in found {
            if !out.contains(&file) {
                out.push(file);
            }
        }
    }
    out
}
