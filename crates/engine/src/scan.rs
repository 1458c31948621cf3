//! Scanner module for discovering video files in a directory tree.
//!
//! Filters by extension (case-insensitive), skips hidden directories, and
//! returns paths in stable sorted order so repeated runs visit files in the
//! same sequence.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Video file extensions recognized by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".webm", ".m4v", ".mpg", ".mpeg",
];

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Finds all video files under `directory`.
///
/// With `recursive` set, walks the whole tree; otherwise only the top level.
/// Hidden directories (names starting with `.`) are never descended into.
/// Results are sorted by path.
pub fn find_videos(directory: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut videos = Vec::new();

    if !directory.exists() {
        return videos;
    }

    let max_depth = if recursive { usize::MAX } else { 1 };

    let walker = WalkDir::new(directory)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            if entry.file_type().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    // Allow the root directory even if it starts with '.'
                    if name.starts_with('.') && entry.depth() > 0 {
                        return false;
                    }
                }
            }
            true
        });

    for entry in walker.filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && is_video_file(entry.path()) {
            videos.push(entry.path().to_path_buf());
        }
    }

    videos.sort();
    videos
}
