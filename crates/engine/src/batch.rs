//! Batch controller: drives a set of files through probe, classification,
//! encode/remux, validation, and optional replacement.
//!
//! Files are processed one at a time in stable path order, which makes
//! interrupted runs resume deterministically. Before re-encoding, a
//! resume-probe looks for outputs a previous run already produced. Per-file
//! failures are contained; the batch continues. No destructive action runs
//! before the replacement output has validated.

use crate::encoder::{self, EncodeError, EncodeRequest, QUICKLOOK_SUFFIX, REENCODED_SUFFIX};
use crate::policy::{self, ComplianceAction, TargetCodec};
use crate::probe::{self, MediaInfo, ProbeCache};
use crate::progress::ProgressSink;
use crate::shutdown::ShutdownFlag;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Attempts for delete/rename steps that can fail transiently on network
/// filesystems.
const REPLACE_ATTEMPTS: u32 = 3;

/// Pause between replacement attempts.
const REPLACE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Error type for the replacement step.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Deleting the original failed after retries.
    #[error("Failed to delete original: {0}")]
    DeleteFailed(io::Error),

    /// Renaming the intermediate into place failed after retries.
    #[error("Failed to install output: {0}")]
    RenameFailed(io::Error),
}

/// Options for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub target: TargetCodec,
    pub preset: String,
    /// Manual CRF override replacing the quality table.
    pub crf_override: Option<u8>,
    /// Delete the source and install the output as `<stem>.mp4`.
    pub replace_original: bool,
    /// Cap outputs at 1080p.
    pub downscale: bool,
    /// Tolerate decode errors in damaged sources.
    pub recover: bool,
    /// Fix preview compatibility only: remux when possible, re-encode when
    /// the pixel format forces it. Outputs use the `_quicklook` suffix.
    pub fix_preview_only: bool,
    /// Cap on the number of files actually processed.
    pub max_files: Option<usize>,
    /// Restrict processing to these extensions (lowercase, no dot).
    pub file_types: Option<Vec<String>>,
    /// Directory for intermediate outputs (None = alongside the source).
    pub output_dir: Option<PathBuf>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            target: TargetCodec::Hevc,
            preset: "medium".to_string(),
            crf_override: None,
            replace_original: false,
            downscale: false,
            recover: false,
            fix_preview_only: false,
            max_files: None,
            file_types: None,
            output_dir: None,
        }
    }
}

/// Final disposition of one file in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// Already meets the policy; nothing to do.
    Compliant,
    /// Re-encoded (and validated).
    Encoded { output: PathBuf, replaced: bool },
    /// Stream-copied into a compliant container.
    Remuxed { output: PathBuf, replaced: bool },
    /// A valid output from an earlier run was found; no work ran.
    ResumedExisting { output: PathBuf, replaced: bool },
    /// The original is gone and a validated replacement is in place.
    AlreadyReplaced { output: PathBuf },
    /// The probe could not analyze the file; it was skipped.
    ProbeFailed(String),
    /// Excluded by the file-type filter.
    FilteredOut,
    /// Encode, validation, or replacement failed; the source is preserved.
    Failed(String),
    /// Not reached before shutdown or the batch cap.
    Unprocessed,
}

/// Per-file work item while a batch is running.
#[derive(Debug, Clone)]
struct EncodeJob {
    source: PathBuf,
    intermediate: PathBuf,
    verdict_action: ComplianceAction,
    crf: Option<u8>,
    info: MediaInfo,
}

/// Outcome list for a finished batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<(PathBuf, FileOutcome)>,
}

impl BatchReport {
    fn count(&self, f: impl Fn(&FileOutcome) -> bool) -> usize {
        self.results.iter().filter(|(_, o)| f(o)).count()
    }

    pub fn compliant(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Compliant))
    }

    pub fn completed(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                FileOutcome::Encoded { .. }
                    | FileOutcome::Remuxed { .. }
                    | FileOutcome::ResumedExisting { .. }
                    | FileOutcome::AlreadyReplaced { .. }
            )
        })
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed(_) | FileOutcome::ProbeFailed(_)))
    }

    pub fn unprocessed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Unprocessed))
    }
}

/// Drives batches of files through the encoding state machine.
pub struct BatchController {
    options: BatchOptions,
    shutdown: ShutdownFlag,
    cache: Option<ProbeCache>,
}

impl BatchController {
    pub fn new(options: BatchOptions, shutdown: ShutdownFlag, cache: Option<ProbeCache>) -> Self {
        Self {
            options,
            shutdown,
            cache,
        }
    }

    /// Probe with the disk cache when one is attached.
    fn probe_cached(&self, path: &Path) -> Result<MediaInfo, probe::ProbeError> {
        if let Some(cache) = &self.cache {
            if let Some(info) = cache.get(path) {
                return Ok(info);
            }
        }

        let info = probe::probe_file(path)?;
        if let Some(cache) = &self.cache {
            cache.put(path, &info);
        }
        Ok(info)
    }

    fn mark_written(&self, path: &Path) {
        if let Some(cache) = &self.cache {
            cache.mark_written(path);
        }
    }

    /// Runs a batch over `files`, in stable path order.
    ///
    /// Selection probes files until enough non-compliant work is found:
    /// with `max_files` set, probing stops once `2 * max_files` candidates
    /// are located so a small batch never scans a whole library. The
    /// shutdown flag is polled between files; remaining files are reported
    /// unprocessed.
    pub fn run(&self, files: &[PathBuf], sink: &dyn ProgressSink) -> BatchReport {
        let mut ordered: Vec<PathBuf> = files.to_vec();
        ordered.sort();

        let mut report = BatchReport::default();
        let mut jobs: Vec<EncodeJob> = Vec::new();

        // A zero cap means "classify only": probe everything, process nothing.
        let probe_cap = self
            .options
            .max_files
            .filter(|m| *m > 0)
            .map(|m| m.saturating_mul(2));

        // Selection pass: classify until enough candidates are located.
        for path in &ordered {
            if self.shutdown.is_stopped() {
                report.results.push((path.clone(), FileOutcome::Unprocessed));
                continue;
            }

            if let Some(cap) = probe_cap {
                if jobs.len() >= cap {
                    report.results.push((path.clone(), FileOutcome::Unprocessed));
                    continue;
                }
            }

            if !passes_type_filter(path, self.options.file_types.as_deref()) {
                report.results.push((path.clone(), FileOutcome::FilteredOut));
                continue;
            }

            // Completed-replacement detection: the source is gone but a
            // validated replacement sits at its final name.
            if !path.exists() {
                let final_path = final_replacement_path(path);
                if final_path.exists() && encoder::inspect_output(&final_path, None, true).is_ok() {
                    report
                        .results
                        .push((path.clone(), FileOutcome::AlreadyReplaced { output: final_path }));
                } else {
                    report.results.push((
                        path.clone(),
                        FileOutcome::Failed("source file missing".to_string()),
                    ));
                }
                continue;
            }

            let info = match self.probe_cached(path) {
                Ok(info) => info,
                Err(e) => {
                    report
                        .results
                        .push((path.clone(), FileOutcome::ProbeFailed(e.to_string())));
                    continue;
                }
            };

            if !info.is_probe_valid() {
                report.results.push((
                    path.clone(),
                    FileOutcome::ProbeFailed("missing dimensions or duration".to_string()),
                ));
                continue;
            }

            let verdict = policy::classify(&info, self.options.target, self.options.crf_override);
            let mut action = verdict.action;
            let mut crf = verdict.crf;

            if verdict.is_compliant() {
                if self.needs_preview_fix(&info) {
                    // Policy-compliant codec that preview tools still reject
                    // (e.g. vp9 in mp4): only a re-encode fixes it.
                    action = ComplianceAction::NeedsFullFix;
                    crf = Some(
                        self.options
                            .crf_override
                            .unwrap_or_else(|| policy::select_crf(&info, self.options.target)),
                    );
                } else {
                    report.results.push((path.clone(), FileOutcome::Compliant));
                    continue;
                }
            }

            let suffix = if self.options.fix_preview_only {
                QUICKLOOK_SUFFIX
            } else {
                REENCODED_SUFFIX
            };

            jobs.push(EncodeJob {
                source: path.clone(),
                intermediate: encoder::output_path_for(path, self.options.output_dir.as_deref(), suffix),
                verdict_action: action,
                crf,
                info,
            });
        }

        // Processing pass: only the first max_files candidates run.
        let take = self.options.max_files.unwrap_or(jobs.len());
        for (index, job) in jobs.iter().enumerate() {
            if index >= take || self.shutdown.is_stopped() {
                report
                    .results
                    .push((job.source.clone(), FileOutcome::Unprocessed));
                continue;
            }

            let outcome = self.process_job(job, sink);
            report.results.push((job.source.clone(), outcome));
        }

        report
    }

    /// Compliant files may still need a preview fix in fix-preview mode.
    fn needs_preview_fix(&self, info: &MediaInfo) -> bool {
        self.options.fix_preview_only && !policy::is_preview_compatible(info)
    }

    /// One file through the state machine. The classification already
    /// happened; this runs resume-probe, then remux or encode, then the
    /// optional replacement.
    fn process_job(&self, job: &EncodeJob, sink: &dyn ProgressSink) -> FileOutcome {
        let duration = job.info.duration_secs;

        // Resume-probe: a prior run may have left a valid output sibling.
        if let Some(existing) =
            encoder::find_existing_output(&job.source, &[REENCODED_SUFFIX, QUICKLOOK_SUFFIX], duration)
        {
            return self.finish(job, existing, |output, replaced| FileOutcome::ResumedExisting {
                output,
                replaced,
            });
        }

        match job.verdict_action {
            ComplianceAction::NeedsRemux { fix_tag } => {
                match encoder::remux(&job.source, &job.intermediate, fix_tag, Some(&job.info)) {
                    Ok(()) => self.finish(job, job.intermediate.clone(), |output, replaced| {
                        FileOutcome::Remuxed { output, replaced }
                    }),
                    Err(e) => FileOutcome::Failed(e.to_string()),
                }
            }
            ComplianceAction::NeedsFullFix | ComplianceAction::NeedsReencode => {
                let request = EncodeRequest {
                    input: job.source.clone(),
                    output: job.intermediate.clone(),
                    target: self.options.target,
                    crf: job
                        .crf
                        .unwrap_or_else(|| policy::select_crf(&job.info, self.options.target)),
                    preset: self.options.preset.clone(),
                    downscale: self.options.downscale,
                    recover: self.options.recover,
                    source_info: Some(job.info.clone()),
                };

                match encoder::encode(&request, sink) {
                    Ok(outcome) if outcome.reused_existing => {
                        self.finish(job, job.intermediate.clone(), |output, replaced| {
                            FileOutcome::ResumedExisting { output, replaced }
                        })
                    }
                    Ok(_) => self.finish(job, job.intermediate.clone(), |output, replaced| {
                        FileOutcome::Encoded { output, replaced }
                    }),
                    Err(EncodeError::Interrupted) => {
                        FileOutcome::Failed("encoder interrupted".to_string())
                    }
                    Err(e) => FileOutcome::Failed(e.to_string()),
                }
            }
            ComplianceAction::Compliant => FileOutcome::Compliant,
        }
    }

    /// Common tail after a validated output exists: cache invalidation and
    /// the optional atomic replacement.
    fn finish(
        &self,
        job: &EncodeJob,
        output: PathBuf,
        make: impl Fn(PathBuf, bool) -> FileOutcome,
    ) -> FileOutcome {
        self.mark_written(&output);

        if !self.options.replace_original {
            return make(output, false);
        }

        match replace_original(&job.source, &output) {
            Ok(final_path) => {
                self.mark_written(&job.source);
                self.mark_written(&final_path);
                make(final_path, true)
            }
            Err(e) => {
                eprintln!(
                    "Warning: replacement failed for {}: {}",
                    job.source.display(),
                    e
                );
                FileOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Final path after replacement: the source name with an `.mp4` extension.
pub fn final_replacement_path(source: &Path) -> PathBuf {
    source.with_extension("mp4")
}

/// True when the file passes the optional extension filter.
pub fn passes_type_filter(path: &Path, filter: Option<&[String]>) -> bool {
    let Some(types) = filter else {
        return true;
    };

    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            types.iter().any(|t| t.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// Installs a validated intermediate as `<stem>.mp4`, removing the source.
///
/// When the final name differs from the source, the intermediate is renamed
/// into place first and the source deleted afterwards, so a failure at any
/// step leaves at least one playable file. When the source already occupies
/// the final name it must be deleted first. Both steps retry on transient
/// errors. On failure the intermediate is left in place.
pub fn replace_original(source: &Path, intermediate: &Path) -> Result<PathBuf, ReplaceError> {
    let final_path = final_replacement_path(source);

    if final_path == *source {
        retry_io(|| fs::remove_file(source)).map_err(ReplaceError::DeleteFailed)?;
        retry_io(|| fs::rename(intermediate, &final_path)).map_err(ReplaceError::RenameFailed)?;
    } else {
        retry_io(|| fs::rename(intermediate, &final_path)).map_err(ReplaceError::RenameFailed)?;
        retry_io(|| fs::remove_file(source)).map_err(ReplaceError::DeleteFailed)?;
    }

    Ok(final_path)
}

/// Retries a filesystem operation a few times with a short pause.
fn retry_io<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut last_err = None;
    for attempt in 0..REPLACE_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < REPLACE_ATTEMPTS {
                    thread::sleep(REPLACE_RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "retry failed")))
}
