//! Three-stage pipeline for encoding videos that live on slow remote
//! storage: download to local staging, encode locally, upload the result.
//!
//! Exactly three workers run concurrently (downloader, encoder, uploader) as
//! kernel threads. All queue state lives in one mutex-protected vector and
//! is rewritten durably (write-to-temp then rename) after every state
//! change, so a killed process resumes from the last persisted state.
//! Previously failed entries are never retried automatically.

use crate::shutdown::ShutdownFlag;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Queue state file schema version.
const QUEUE_SCHEMA: u32 = 1;

/// Queue state file name inside the staging directory.
const QUEUE_STATE_FILE: &str = "queue_state.json";

/// Idle poll interval for workers waiting on upstream stages.
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Pause while the staging buffer is full.
const PAUSE_INTERVAL: Duration = Duration::from_millis(500);

/// Error type for queue persistence.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue state unreadable: {0}")]
    Parse(String),

    #[error("Unsupported queue schema {0}")]
    SchemaMismatch(u32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Stage of one file in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting to be downloaded.
    Pending,
    /// Copy from remote storage in flight.
    Downloading,
    /// Staged locally, waiting for the encoder.
    Local,
    /// Encoder running.
    Encoding,
    /// Encoded output staged, waiting for upload.
    Encoded,
    /// Copy to remote storage in flight.
    Uploading,
    /// Fully processed and uploaded.
    Complete,
    /// A stage failed; the entry is terminal until the operator clears it.
    Failed,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Complete | EntryState::Failed)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryState::Pending => "pending",
            EntryState::Downloading => "downloading",
            EntryState::Local => "local",
            EntryState::Encoding => "encoding",
            EntryState::Encoded => "encoded",
            EntryState::Uploading => "uploading",
            EntryState::Complete => "complete",
            EntryState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Durable record of one file moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Original remote path.
    pub source_path: PathBuf,
    /// Staged copy of the source (set once downloaded).
    pub local_input_path: Option<PathBuf>,
    /// Staged encoder output (set once encoded).
    pub local_output_path: Option<PathBuf>,
    /// Final remote destination (set once encoded).
    pub final_remote_path: Option<PathBuf>,
    pub state: EntryState,
    pub error: Option<String>,
    /// Size of the source in bytes (set at download).
    pub source_bytes: u64,
    /// Size of the encoded output in bytes (set at encode).
    pub output_bytes: u64,
    /// Unix millis when the entry was enqueued.
    pub created_at: i64,
    /// Unix millis of the last state change.
    pub updated_at: i64,
}

impl QueueEntry {
    fn new(source_path: PathBuf) -> Self {
        let now = current_timestamp_ms();
        Self {
            source_path,
            local_input_path: None,
            local_output_path: None,
            final_remote_path: None,
            state: EntryState::Pending,
            error: None,
            source_bytes: 0,
            output_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// On-disk shape of the queue state file.
#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    schema: u32,
    entries: Vec<QueueEntry>,
}

/// Snapshot of per-state entry counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineProgress {
    pub total: usize,
    pub pending: usize,
    pub downloading: usize,
    pub local: usize,
    pub encoding: usize,
    pub encoded: usize,
    pub uploading: usize,
    pub complete: usize,
    pub failed: usize,
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Local staging directory.
    pub temp_dir: PathBuf,
    /// Max in-flight entries between download and upload (clamped to 2-5).
    pub buffer_size: usize,
    /// Max bytes of on-disk staging before downloads pause.
    pub max_temp_bytes: u64,
    /// Replace remote originals instead of writing `_reencoded` siblings.
    pub replace_original: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            buffer_size: 4,
            max_temp_bytes: 50 * 1024 * 1024 * 1024,
            replace_original: false,
        }
    }
}

/// Default staging directory: the system temp dir plus "videosentinel".
pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("videosentinel")
}

struct Shared {
    config: PipelineConfig,
    state_path: PathBuf,
    entries: Mutex<Vec<QueueEntry>>,
    shutdown: ShutdownFlag,
    downloads_done: AtomicBool,
    encodes_done: AtomicBool,
}

/// The three-stage download/encode/upload pipeline.
pub struct NetworkPipeline {
    shared: Arc<Shared>,
}

impl NetworkPipeline {
    /// Creates a pipeline, clamping the buffer size into its valid range and
    /// creating the staging directory.
    pub fn new(mut config: PipelineConfig, shutdown: ShutdownFlag) -> io::Result<Self> {
        config.buffer_size = config.buffer_size.clamp(2, 5);
        fs::create_dir_all(&config.temp_dir)?;

        let state_path = config.temp_dir.join(QUEUE_STATE_FILE);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state_path,
                entries: Mutex::new(Vec::new()),
                shutdown,
                downloads_done: AtomicBool::new(false),
                encodes_done: AtomicBool::new(false),
            }),
        })
    }

    /// Enqueues files for processing. A source path already in the queue is
    /// not enqueued twice.
    pub fn add_files(&self, paths: &[PathBuf]) {
        let mut entries = self.shared.lock_entries();
        for path in paths {
            if entries.iter().any(|e| e.source_path == *path) {
                continue;
            }
            entries.push(QueueEntry::new(path.clone()));
        }
        self.shared.persist(&entries);
    }

    /// Loads persisted queue state and normalizes interrupted entries.
    ///
    /// Terminal entries are kept as-is (failed entries are not retried).
    /// Entries interrupted mid-stage are re-enqueued at the earliest stage
    /// whose inputs still exist; partial downloads are discarded.
    ///
    /// Returns true when a state file was found.
    pub fn resume(&self) -> Result<bool, QueueError> {
        let loaded = match load_queue(&self.shared.state_path)? {
            Some(entries) => entries,
            None => return Ok(false),
        };

        let mut entries = self.shared.lock_entries();
        *entries = loaded;

        for entry in entries.iter_mut() {
            normalize_for_resume(entry);
        }

        self.shared.persist(&entries);
        Ok(true)
    }

    /// Per-state entry counts.
    pub fn progress(&self) -> PipelineProgress {
        let entries = self.shared.lock_entries();
        let mut p = PipelineProgress {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.iter() {
            match entry.state {
                EntryState::Pending => p.pending += 1,
                EntryState::Downloading => p.downloading += 1,
                EntryState::Local => p.local += 1,
                EntryState::Encoding => p.encoding += 1,
                EntryState::Encoded => p.encoded += 1,
                EntryState::Uploading => p.uploading += 1,
                EntryState::Complete => p.complete += 1,
                EntryState::Failed => p.failed += 1,
            }
        }
        p
    }

    /// A copy of the current queue entries.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.shared.lock_entries().clone()
    }

    /// Runs the pipeline to completion (or cooperative shutdown).
    ///
    /// The downloader and uploader run on their own threads; encoding runs
    /// on the calling thread. `encode_fn(local_input, local_output)` returns
    /// whether the encode succeeded.
    pub fn run<F>(&self, encode_fn: F)
    where
        F: Fn(&Path, &Path) -> bool + Send + Sync,
    {
        let shared = &self.shared;
        shared.downloads_done.store(false, Ordering::SeqCst);
        shared.encodes_done.store(false, Ordering::SeqCst);

        thread::scope(|scope| {
            scope.spawn(|| download_worker(shared));
            scope.spawn(|| upload_worker(shared));

            encode_worker(shared, &encode_fn);
        });
    }
}

impl Shared {
    fn lock_entries(&self) -> MutexGuard<'_, Vec<QueueEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rewrites the queue file. Called with the entries lock held so state
    /// changes serialize with their persistence.
    fn persist(&self, entries: &[QueueEntry]) {
        if let Err(e) = save_queue(&self.state_path, entries) {
            eprintln!("Warning: failed to save queue state: {}", e);
        }
    }

    /// Claims the oldest entry in `from`, moving it to `to`.
    fn claim(&self, from: EntryState, to: EntryState) -> Option<QueueEntry> {
        let mut entries = self.lock_entries();
        let index = entries.iter().position(|e| e.state == from)?;
        entries[index].state = to;
        entries[index].updated_at = current_timestamp_ms();
        let claimed = entries[index].clone();
        self.persist(&entries);
        Some(claimed)
    }

    /// Applies `update` to the entry for `source`, then persists.
    fn update_entry(&self, source: &Path, update: impl FnOnce(&mut QueueEntry)) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.iter_mut().find(|e| e.source_path == source) {
            update(entry);
            entry.updated_at = current_timestamp_ms();
        }
        self.persist(&entries);
    }

    fn count_in_states(&self, states: &[EntryState]) -> usize {
        let entries = self.lock_entries();
        entries.iter().filter(|e| states.contains(&e.state)).count()
    }

    /// Bytes currently staged on disk (excluding the state file itself).
    fn staging_bytes(&self) -> u64 {
        let mut total = 0;
        if let Ok(dir) = fs::read_dir(&self.config.temp_dir) {
            for item in dir.flatten() {
                if item.file_name() == QUEUE_STATE_FILE {
                    continue;
                }
                if let Ok(metadata) = item.metadata() {
                    if metadata.is_file() {
                        total += metadata.len();
                    }
                }
            }
        }
        total
    }

    /// Downloads pause while the in-flight window or staging budget is full.
    fn should_pause_downloads(&self) -> bool {
        let in_flight = self.count_in_states(&[
            EntryState::Local,
            EntryState::Encoding,
            EntryState::Encoded,
            EntryState::Uploading,
        ]);
        if in_flight >= self.config.buffer_size {
            return true;
        }
        self.staging_bytes() >= self.config.max_temp_bytes
    }

    fn fail_entry(&self, source: &Path, message: String) {
        self.update_entry(source, |entry| {
            entry.state = EntryState::Failed;
            entry.error = Some(message);
        });
    }
}

/// Downloader: stages pending sources into the temp directory.
fn download_worker(shared: &Shared) {
    loop {
        if shared.shutdown.is_stopped() {
            break;
        }

        if shared.count_in_states(&[EntryState::Pending]) == 0 {
            break;
        }

        if shared.should_pause_downloads() {
            thread::sleep(PAUSE_INTERVAL);
            continue;
        }

        let Some(entry) = shared.claim(EntryState::Pending, EntryState::Downloading) else {
            continue;
        };

        let source = entry.source_path.clone();
        let basename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let local = shared.config.temp_dir.join(format!("download_{}", basename));

        match copy_with_metadata(&source, &local) {
            Ok(bytes) => {
                shared.update_entry(&source, |e| {
                    e.local_input_path = Some(local.clone());
                    e.source_bytes = bytes;
                    e.state = EntryState::Local;
                });
            }
            Err(e) => {
                let _ = fs::remove_file(&local);
                shared.fail_entry(&source, format!("Download failed: {}", e));
            }
        }
    }

    shared.downloads_done.store(true, Ordering::SeqCst);
}

/// Encoder: single-threaded; runs on the pipeline caller's thread.
fn encode_worker<F>(shared: &Shared, encode_fn: &F)
where
    F: Fn(&Path, &Path) -> bool,
{
    loop {
        if shared.shutdown.is_stopped() {
            break;
        }

        let claimed = shared.claim(EntryState::Local, EntryState::Encoding);

        let Some(entry) = claimed else {
            let upstream = shared.count_in_states(&[
                EntryState::Pending,
                EntryState::Downloading,
                EntryState::Local,
            ]);
            if upstream == 0 && shared.downloads_done.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(POLL_INTERVAL);
            continue;
        };

        let source = entry.source_path.clone();
        let Some(input) = entry.local_input_path.clone() else {
            shared.fail_entry(&source, "Local input missing at encode".to_string());
            continue;
        };

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let output = shared.config.temp_dir.join(format!("encoded_{}.mp4", stem));

        let success = encode_fn(&input, &output);

        if success && output.exists() {
            let output_bytes = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
            let final_path = final_remote_path(&source, shared.config.replace_original);
            shared.update_entry(&source, |e| {
                e.local_output_path = Some(output.clone());
                e.final_remote_path = Some(final_path.clone());
                e.output_bytes = output_bytes;
                e.state = EntryState::Encoded;
            });
        } else {
            let _ = fs::remove_file(&input);
            let _ = fs::remove_file(&output);
            shared.fail_entry(&source, "Encoding failed or output missing".to_string());
        }
    }

    shared.encodes_done.store(true, Ordering::SeqCst);
}

/// Uploader: copies encoded outputs to their remote destination.
fn upload_worker(shared: &Shared) {
    loop {
        if shared.shutdown.is_stopped() {
            break;
        }

        let claimed = shared.claim(EntryState::Encoded, EntryState::Uploading);

        let Some(entry) = claimed else {
            let upstream = shared.count_in_states(&[
                EntryState::Pending,
                EntryState::Downloading,
                EntryState::Local,
                EntryState::Encoding,
                EntryState::Encoded,
            ]);
            if upstream == 0 && shared.encodes_done.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(POLL_INTERVAL);
            continue;
        };

        let source = entry.source_path.clone();
        let (Some(output), Some(final_path)) =
            (entry.local_output_path.clone(), entry.final_remote_path.clone())
        else {
            shared.fail_entry(&source, "Encoded output missing at upload".to_string());
            continue;
        };

        let result = (|| -> io::Result<()> {
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_with_metadata(&output, &final_path)?;

            // In replace mode the remote original goes away once the
            // replacement is in place.
            if shared.config.replace_original && source != final_path && source.exists() {
                fs::remove_file(&source)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                if let Some(input) = &entry.local_input_path {
                    let _ = fs::remove_file(input);
                }
                let _ = fs::remove_file(&output);
                shared.update_entry(&source, |e| {
                    e.state = EntryState::Complete;
                    e.error = None;
                });
            }
            Err(e) => {
                if let Some(input) = &entry.local_input_path {
                    let _ = fs::remove_file(input);
                }
                let _ = fs::remove_file(&output);
                shared.fail_entry(&source, format!("Upload failed: {}", e));
            }
        }
    }
}

/// Final remote destination for a source: the renamed original in replace
/// mode, a `_reencoded` sibling otherwise.
pub fn final_remote_path(source: &Path, replace_original: bool) -> PathBuf {
    if replace_original {
        source.with_extension("mp4")
    } else {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        source.with_file_name(format!("{}_reencoded.mp4", stem))
    }
}

/// Re-enqueues an interrupted entry at the earliest stage whose inputs still
/// exist. Terminal states are kept.
fn normalize_for_resume(entry: &mut QueueEntry) {
    let input_present = entry
        .local_input_path
        .as_ref()
        .map(|p| p.exists())
        .unwrap_or(false);
    let output_present = entry
        .local_output_path
        .as_ref()
        .map(|p| p.exists())
        .unwrap_or(false);

    let new_state = match entry.state {
        EntryState::Complete | EntryState::Failed => return,
        EntryState::Pending => EntryState::Pending,
        EntryState::Downloading => {
            // Partial downloads are discarded.
            if let Some(partial) = &entry.local_input_path {
                let _ = fs::remove_file(partial);
            }
            entry.local_input_path = None;
            EntryState::Pending
        }
        EntryState::Local => {
            if input_present {
                EntryState::Local
            } else {
                EntryState::Pending
            }
        }
        EntryState::Encoding => {
            // Interrupted mid-encode; any partial output is stale.
            if let Some(partial) = &entry.local_output_path {
                let _ = fs::remove_file(partial);
            }
            entry.local_output_path = None;
            if input_present {
                EntryState::Local
            } else {
                EntryState::Pending
            }
        }
        EntryState::Encoded | EntryState::Uploading => {
            if output_present {
                EntryState::Encoded
            } else if input_present {
                EntryState::Local
            } else {
                EntryState::Pending
            }
        }
    };

    if new_state == EntryState::Pending {
        entry.local_input_path = None;
    }
    entry.state = new_state;
    entry.updated_at = current_timestamp_ms();
}

/// Copies a file, carrying the source mtime when the filesystem allows it.
/// Network filesystems that refuse timestamp updates still get the data.
fn copy_with_metadata(source: &Path, dest: &Path) -> io::Result<u64> {
    let bytes = fs::copy(source, dest)?;

    if let Ok(metadata) = fs::metadata(source) {
        let mtime = filetime::FileTime::from_last_modification_time(&metadata);
        // The data arrived either way; a refused timestamp is not an error.
        let _ = filetime::set_file_mtime(dest, mtime);
    }

    Ok(bytes)
}

/// Writes the queue file durably: serialize to a temp sibling, fsync, rename.
pub fn save_queue(path: &Path, entries: &[QueueEntry]) -> Result<(), QueueError> {
    let file = QueueFile {
        schema: QUEUE_SCHEMA,
        entries: entries.to_vec(),
    };
    let json = serde_json::to_string_pretty(&file).map_err(|e| QueueError::Parse(e.to_string()))?;

    let tmp = path.with_extension("json.tmp");
    {
        use std::io::Write;
        let mut f = fs::File::create(&tmp)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads the queue file. Returns None when no file exists; a corrupt or
/// unsupported file is an error so the operator can intervene.
pub fn load_queue(path: &Path) -> Result<Option<Vec<QueueEntry>>, QueueError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)?;
    let file: QueueFile =
        serde_json::from_str(&content).map_err(|e| QueueError::Parse(e.to_string()))?;

    if file.schema != QUEUE_SCHEMA {
        return Err(QueueError::SchemaMismatch(file.schema));
    }

    Ok(Some(file.entries))
}

/// Current timestamp in milliseconds since the Unix epoch.
fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(content).unwrap();
    }

    fn make_pipeline(temp_dir: &Path, replace_original: bool) -> NetworkPipeline {
        let config = PipelineConfig {
            temp_dir: temp_dir.to_path_buf(),
            buffer_size: 3,
            max_temp_bytes: 50 * 1024 * 1024 * 1024,
            replace_original,
        };
        NetworkPipeline::new(config, ShutdownFlag::new()).unwrap()
    }

    #[test]
    fn test_entry_state_serde_snake_case() {
        let json = serde_json::to_string(&EntryState::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");

        let state: EntryState = serde_json::from_str("\"encoded\"").unwrap();
        assert_eq!(state, EntryState::Encoded);
    }

    #[test]
    fn test_entry_state_display_and_terminal() {
        assert_eq!(EntryState::Pending.to_string(), "pending");
        assert_eq!(EntryState::Complete.to_string(), "complete");
        assert!(EntryState::Complete.is_terminal());
        assert!(EntryState::Failed.is_terminal());
        assert!(!EntryState::Uploading.is_terminal());
    }

    #[test]
    fn test_save_and_load_queue() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join(QUEUE_STATE_FILE);

        let entries = vec![QueueEntry::new(PathBuf::from("/remote/a.wmv"))];
        save_queue(&state_path, &entries).unwrap();

        let loaded = load_queue(&state_path).unwrap().unwrap();
        assert_eq!(loaded, entries);

        // No stray temp file remains after the atomic rename.
        assert!(!state_path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_queue_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(load_queue(&dir.path().join(QUEUE_STATE_FILE)).unwrap().is_none());
    }

    #[test]
    fn test_load_queue_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join(QUEUE_STATE_FILE);
        write_file(&state_path, b"{ half written");

        assert!(matches!(load_queue(&state_path), Err(QueueError::Parse(_))));
    }

    #[test]
    fn test_load_queue_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join(QUEUE_STATE_FILE);
        write_file(&state_path, br#"{ "schema": 99, "entries": [] }"#);

        assert!(matches!(
            load_queue(&state_path),
            Err(QueueError::SchemaMismatch(99))
        ));
    }

    #[test]
    fn test_add_files_dedupes_by_source() {
        let dir = TempDir::new().unwrap();
        let pipeline = make_pipeline(dir.path(), false);

        let a = PathBuf::from("/remote/a.wmv");
        pipeline.add_files(&[a.clone(), a.clone()]);
        pipeline.add_files(&[a.clone()]);

        assert_eq!(pipeline.entries().len(), 1);
    }

    #[test]
    fn test_buffer_size_clamped() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            temp_dir: dir.path().to_path_buf(),
            buffer_size: 99,
            ..Default::default()
        };
        let pipeline = NetworkPipeline::new(config, ShutdownFlag::new()).unwrap();
        assert_eq!(pipeline.shared.config.buffer_size, 5);

        let config = PipelineConfig {
            temp_dir: dir.path().to_path_buf(),
            buffer_size: 0,
            ..Default::default()
        };
        let pipeline = NetworkPipeline::new(config, ShutdownFlag::new()).unwrap();
        assert_eq!(pipeline.shared.config.buffer_size, 2);
    }

    #[test]
    fn test_final_remote_path() {
        assert_eq!(
            final_remote_path(Path::new("/remote/c.wmv"), true),
            PathBuf::from("/remote/c.mp4")
        );
        assert_eq!(
            final_remote_path(Path::new("/remote/c.wmv"), false),
            PathBuf::from("/remote/c_reencoded.mp4")
        );
    }

    #[test]
    fn test_run_processes_all_files() {
        let remote = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let mut sources = Vec::new();
        for i in 0..3 {
            let path = remote.path().join(format!("video_{}.wmv", i));
            write_file(&path, format!("source {}", i).as_bytes());
            sources.push(path);
        }

        let pipeline = make_pipeline(staging.path(), false);
        pipeline.add_files(&sources);

        pipeline.run(|input, output| {
            fs::copy(input, output).is_ok()
        });

        let progress = pipeline.progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.complete, 3);
        assert_eq!(progress.failed, 0);

        for source in &sources {
            // Source untouched, sibling output present.
            assert!(source.exists());
            assert!(final_remote_path(source, false).exists());
        }

        // Staging is clean: only the state file remains.
        let leftovers: Vec<_> = fs::read_dir(staging.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name() != QUEUE_STATE_FILE)
            .collect();
        assert!(leftovers.is_empty(), "staging should be empty: {:?}", leftovers);
    }

    #[test]
    fn test_run_replace_original_deletes_remote_source() {
        let remote = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let source = remote.path().join("video.wmv");
        write_file(&source, b"source");

        let pipeline = make_pipeline(staging.path(), true);
        pipeline.add_files(&[source.clone()]);

        pipeline.run(|input, output| fs::copy(input, output).is_ok());

        assert_eq!(pipeline.progress().complete, 1);
        assert!(!source.exists());
        assert!(remote.path().join("video.mp4").exists());
    }

    #[test]
    fn test_run_encode_failure_marks_failed_and_cleans_up() {
        let remote = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let source = remote.path().join("broken.wmv");
        write_file(&source, b"source");

        let pipeline = make_pipeline(staging.path(), false);
        pipeline.add_files(&[source.clone()]);

        pipeline.run(|_input, _output| false);

        let entries = pipeline.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, EntryState::Failed);
        assert!(entries[0].error.as_deref().unwrap_or("").contains("Encoding failed"));

        // Remote source untouched; local staging cleaned.
        assert!(source.exists());
        assert!(!staging.path().join("download_broken.wmv").exists());
    }

    #[test]
    fn test_failed_entries_not_retried_on_rerun() {
        let remote = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let source = remote.path().join("broken.wmv");
        write_file(&source, b"source");

        {
            let pipeline = make_pipeline(staging.path(), false);
            pipeline.add_files(&[source.clone()]);
            pipeline.run(|_, _| false);
            assert_eq!(pipeline.progress().failed, 1);
        }

        // Second run resumes from the state file; the failed entry stays
        // terminal and the encoder callback is never invoked.
        let pipeline = make_pipeline(staging.path(), false);
        assert!(pipeline.resume().unwrap());

        let invoked = AtomicBool::new(false);
        pipeline.run(|_, _| {
            invoked.store(true, Ordering::SeqCst);
            true
        });

        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(pipeline.progress().failed, 1);
        assert_eq!(pipeline.progress().complete, 0);
    }

    #[test]
    fn test_resume_normalization_table() {
        let remote = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let make_entry = |name: &str, state: EntryState| {
            let mut entry = QueueEntry::new(remote.path().join(name));
            entry.state = state;
            entry
        };

        // Staged artifacts for selected entries.
        let local_input = staging.path().join("download_has_input.wmv");
        write_file(&local_input, b"staged input");
        let local_output = staging.path().join("encoded_has_output.mp4");
        write_file(&local_output, b"staged output");
        let partial = staging.path().join("download_partial.wmv");
        write_file(&partial, b"partial download");

        let mut entries = vec![
            make_entry("done.wmv", EntryState::Complete),
            make_entry("dead.wmv", EntryState::Failed),
            make_entry("waiting.wmv", EntryState::Pending),
            make_entry("partial.wmv", EntryState::Downloading),
            make_entry("has_input.wmv", EntryState::Encoding),
            make_entry("has_output.wmv", EntryState::Uploading),
            make_entry("lost_input.wmv", EntryState::Local),
            make_entry("lost_output.wmv", EntryState::Encoded),
        ];
        entries[3].local_input_path = Some(partial.clone());
        entries[4].local_input_path = Some(local_input.clone());
        entries[5].local_output_path = Some(local_output.clone());
        entries[6].local_input_path = Some(staging.path().join("download_gone.wmv"));
        entries[7].local_output_path = Some(staging.path().join("encoded_gone.mp4"));

        save_queue(&staging.path().join(QUEUE_STATE_FILE), &entries).unwrap();

        let pipeline = make_pipeline(staging.path(), false);
        assert!(pipeline.resume().unwrap());

        let by_name = |name: &str| {
            pipeline
                .entries()
                .into_iter()
                .find(|e| e.source_path.file_name().unwrap().to_str().unwrap() == name)
                .unwrap()
        };

        assert_eq!(by_name("done.wmv").state, EntryState::Complete);
        assert_eq!(by_name("dead.wmv").state, EntryState::Failed);
        assert_eq!(by_name("waiting.wmv").state, EntryState::Pending);
        // Partial download discarded.
        assert_eq!(by_name("partial.wmv").state, EntryState::Pending);
        assert!(!partial.exists());
        // Interrupted encode with staged input re-enters the local stage.
        assert_eq!(by_name("has_input.wmv").state, EntryState::Local);
        // Interrupted upload with staged output goes back to encoded.
        assert_eq!(by_name("has_output.wmv").state, EntryState::Encoded);
        // Missing artifacts fall back to the download stage.
        assert_eq!(by_name("lost_input.wmv").state, EntryState::Pending);
        assert_eq!(by_name("lost_output.wmv").state, EntryState::Pending);
    }

    #[test]
    fn test_resume_without_state_file() {
        let staging = TempDir::new().unwrap();
        let pipeline = make_pipeline(staging.path(), false);
        assert!(!pipeline.resume().unwrap());
    }

    #[test]
    fn test_shutdown_before_run_processes_nothing() {
        let remote = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let source = remote.path().join("video.wmv");
        write_file(&source, b"source");

        let shutdown = ShutdownFlag::new();
        shutdown.request_stop();

        let config = PipelineConfig {
            temp_dir: staging.path().to_path_buf(),
            ..Default::default()
        };
        let pipeline = NetworkPipeline::new(config, shutdown).unwrap();
        pipeline.add_files(&[source.clone()]);

        pipeline.run(|_, _| unreachable!("encoder must not run after shutdown"));

        let progress = pipeline.progress();
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.complete, 0);
        assert!(source.exists());
    }

    #[test]
    fn test_queue_entry_json_round_trip() {
        let mut entry = QueueEntry::new(PathBuf::from("/remote/a.wmv"));
        entry.state = EntryState::Encoded;
        entry.local_input_path = Some(PathBuf::from("/tmp/vs/download_a.wmv"));
        entry.local_output_path = Some(PathBuf::from("/tmp/vs/encoded_download_a.mp4"));
        entry.final_remote_path = Some(PathBuf::from("/remote/a_reencoded.mp4"));
        entry.source_bytes = 123;
        entry.output_bytes = 45;
        entry.error = None;

        let json = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
