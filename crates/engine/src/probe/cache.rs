//! Disk-backed probe cache keyed by (absolute path, file size, mtime).
//!
//! Each entry is a small JSON file named by a stable hash of the absolute
//! path. A lookup only returns the stored result when both size and mtime
//! still match; any mismatch deletes the stale record. Paths the current run
//! has written to are marked dirty and bypass the cache until the process
//! exits.

use super::MediaInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

/// One cached probe result with its freshness key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    size: u64,
    mtime_unix: i64,
    info: MediaInfo,
}

/// Disk-backed cache of probe results.
pub struct ProbeCache {
    dir: PathBuf,
    dirty: Mutex<HashSet<PathBuf>>,
}

impl ProbeCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            dirty: Mutex::new(HashSet::new()),
        })
    }

    /// Cache file path for a video path: a stable uuid derived from the
    /// absolute path string.
    fn record_path(&self, video_path: &Path) -> PathBuf {
        let absolute = video_path
            .canonicalize()
            .unwrap_or_else(|_| video_path.to_path_buf());
        let key = Uuid::new_v5(&Uuid::NAMESPACE_URL, absolute.to_string_lossy().as_bytes());
        self.dir.join(format!("{}.json", key))
    }

    /// Returns the cached probe result if the file is unchanged and the path
    /// has not been written to during this run.
    pub fn get(&self, video_path: &Path) -> Option<MediaInfo> {
        {
            let dirty = self.dirty.lock().ok()?;
            if dirty.contains(video_path) {
                return None;
            }
        }

        let record_path = self.record_path(video_path);
        let content = fs::read_to_string(&record_path).ok()?;
        let record: CacheRecord = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(_) => {
                let _ = fs::remove_file(&record_path);
                return None;
            }
        };

        let (size, mtime) = file_key(video_path)?;
        if record.size != size || record.mtime_unix != mtime {
            let _ = fs::remove_file(&record_path);
            return None;
        }

        Some(record.info)
    }

    /// Stores a probe result keyed by the file's current size and mtime.
    pub fn put(&self, video_path: &Path, info: &MediaInfo) {
        let Some((size, mtime)) = file_key(video_path) else {
            return;
        };

        let record = CacheRecord {
            size,
            mtime_unix: mtime,
            info: info.clone(),
        };

        if let Ok(json) = serde_json::to_string(&record) {
            let _ = fs::write(self.record_path(video_path), json);
        }
    }

    /// Marks a path as written by the current run: its cache entry is removed
    /// and lookups for it return nothing until the process exits.
    pub fn mark_written(&self, video_path: &Path) {
        let _ = fs::remove_file(self.record_path(video_path));
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(video_path.to_path_buf());
        }
    }
}

/// Current (size, mtime-seconds) for a file, None if unreadable.
fn file_key(path: &Path) -> Option<(u64, i64)> {
    let metadata = fs::metadata(path).ok()?;
    let mtime = metadata
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Some((metadata.len(), mtime))
}
