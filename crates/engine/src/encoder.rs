//! Encoder driver: builds ffmpeg command lines, runs the subprocess with
//! line-oriented progress reporting, and validates outputs.
//!
//! All outputs are `.mp4` with the header up front (faststart) so preview
//! tools can play them without reading the tail. HEVC outputs carry the
//! `hvc1` tag. A failing encode always deletes its partial output before
//! returning.

use crate::policy::TargetCodec;
use crate::probe::{self, MediaInfo};
use crate::progress::{parse_progress_line, ProgressSink};
use std::collections::VecDeque;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Suffix for re-encoded intermediate outputs.
pub const REENCODED_SUFFIX: &str = "_reencoded";

/// Suffix for preview-fix intermediate outputs.
pub const QUICKLOOK_SUFFIX: &str = "_quicklook";

/// Minimum plausible output size in bytes.
const MIN_OUTPUT_BYTES: u64 = 1024;

/// Duration drift tolerated between source and output, seconds.
const DURATION_TOLERANCE_SECS: f64 = 2.0;

/// Stderr lines retained for error reports.
const STDERR_TAIL_LINES: usize = 12;

/// Why an output failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReason {
    #[error("output file does not exist")]
    Missing,

    #[error("output file too small ({0} bytes)")]
    TooSmall(u64),

    #[error("output unreadable by probe: {0}")]
    Unreadable(String),

    #[error("output has invalid dimensions ({width}x{height})")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("output has no duration")]
    NoDuration,

    #[error("duration mismatch (output {output:.1}s vs source {expected:.1}s)")]
    DurationMismatch { output: f64, expected: f64 },
}

/// Error type for encoder driver operations.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Input file could not be probed.
    #[error("Probe failed: {0}")]
    ProbeFailed(#[from] probe::ProbeError),

    /// Input file is missing.
    #[error("Input file does not exist: {0}")]
    InputMissing(PathBuf),

    /// Encoder subprocess exited with a non-zero status.
    #[error("Encoder exited with code {code}: {tail}")]
    EncoderExitNonZero { code: i32, tail: String },

    /// Encoder subprocess was terminated by a signal.
    #[error("Encoder interrupted")]
    Interrupted,

    /// Output failed post-encode validation.
    #[error("Validation failed: {0}")]
    ValidationFailed(InvalidReason),

    /// IO error spawning or driving the subprocess.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for one encode invocation.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// Path to the source video.
    pub input: PathBuf,
    /// Path for the encoded output (always `.mp4`).
    pub output: PathBuf,
    /// Target codec.
    pub target: TargetCodec,
    /// Constant rate factor from the quality policy.
    pub crf: u8,
    /// Encoder preset (fast, medium, slow, veryslow).
    pub preset: String,
    /// Cap output at 1080p, preserving aspect with even dimensions.
    pub downscale: bool,
    /// Tolerate decode errors in damaged sources.
    pub recover: bool,
    /// Probe result for the source, used for validation and progress.
    pub source_info: Option<MediaInfo>,
}

/// Result of a successful encode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOutcome {
    /// True when a prior valid output was found and no encode ran.
    pub reused_existing: bool,
}

/// Generates the intermediate output path for a source file.
///
/// `<dir>/<stem><suffix>.mp4`, where dir is `output_dir` or the source's own
/// directory.
pub fn output_path_for(input: &Path, output_dir: Option<&Path>, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = format!("{}{}.mp4", stem, suffix);

    match output_dir {
        Some(dir) => dir.join(filename),
        None => input.with_file_name(filename),
    }
}

/// Output dimensions after an optional downscale to the 1080p envelope.
///
/// Sources at or below 1920x1080 keep their dimensions. Larger sources are
/// scaled to fit, preserving aspect, with each dimension rounded down to an
/// even integer.
pub fn downscaled_dims(width: u32, height: u32) -> (u32, u32) {
    if width <= 1920 && height <= 1080 {
        return (width, height);
    }

    let scale = f64::min(1920.0 / width as f64, 1080.0 / height as f64);
    let even = |v: f64| ((v as u32) / 2) * 2;
    (even(width as f64 * scale), even(height as f64 * scale))
}

/// Pixel format for an encode: 10-bit 4:2:0 by default, 8-bit permitted when
/// the source is 8-bit and recovery mode is off.
fn pick_pix_fmt(request: &EncodeRequest) -> &'static str {
    let source_is_8bit = request
        .source_info
        .as_ref()
        .map(|info| info.color_depth <= 8)
        .unwrap_or(false);

    if source_is_8bit && !request.recover {
        "yuv420p"
    } else {
        "yuv420p10le"
    }
}

/// Builds the ffmpeg transcode command for a request.
pub fn build_encode_command(request: &EncodeRequest) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner");

    if request.recover {
        // Input-side flags: decode through damage instead of aborting.
        cmd.args(["-err_detect", "ignore_err"]);
        cmd.args(["-fflags", "+genpts+discardcorrupt+igndts"]);
        cmd.arg("-ignore_unknown");
    }

    cmd.arg("-i").arg(&request.input);

    let needs_downscale = request.downscale
        && request
            .source_info
            .as_ref()
            .map(|info| info.width > 1920 || info.height > 1080)
            .unwrap_or(false);

    if needs_downscale {
        cmd.args([
            "-vf",
            "scale=1920:1080:force_original_aspect_ratio=decrease:force_divisible_by=2",
        ]);
    }

    cmd.args(["-c:v", request.target.encoder_name()]);
    cmd.args(["-preset", &request.preset]);
    cmd.args(["-crf", &request.crf.to_string()]);
    cmd.args(["-pix_fmt", pick_pix_fmt(request)]);

    match request.target {
        TargetCodec::Hevc => {
            cmd.args(["-tag:v", "hvc1"]);
            cmd.args(["-x265-params", "log-level=error"]);
        }
        TargetCodec::Av1 => {
            cmd.args(["-cpu-used", "4"]);
        }
        TargetCodec::H264 => {}
    }

    cmd.args(["-c:a", "aac"]);
    cmd.args(["-movflags", "+faststart"]);

    if request.recover {
        cmd.args(["-max_muxing_queue_size", "1024"]);
        cmd.args(["-max_error_rate", "1.0"]);
    }

    cmd.arg("-y").arg(&request.output);
    cmd
}

/// Builds the stream-copy remux command.
pub fn build_remux_command(source: &Path, dest: &Path, fix_tag: bool) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner");
    cmd.arg("-i").arg(source);
    cmd.args(["-c", "copy"]);
    if fix_tag {
        cmd.args(["-tag:v", "hvc1"]);
    }
    cmd.args(["-movflags", "+faststart"]);
    cmd.arg("-y").arg(dest);
    cmd
}

/// Runs an encode, streaming progress to `sink`.
///
/// A valid output already on disk is reused without re-encoding; an invalid
/// one is deleted first. On any failure the partial output is removed and
/// the source is left untouched.
pub fn encode(request: &EncodeRequest, sink: &dyn ProgressSink) -> Result<EncodeOutcome, EncodeError> {
    if !request.input.exists() {
        return Err(EncodeError::InputMissing(request.input.clone()));
    }

    if let Some(parent) = request.output.parent() {
        fs::create_dir_all(parent)?;
    }

    let expected_duration = request.source_info.as_ref().and_then(|i| i.duration_secs);

    // A prior run may have left a finished output behind.
    if request.output.exists() {
        match validate(&request.output, expected_duration, request.recover) {
            Ok(()) => return Ok(EncodeOutcome { reused_existing: true }),
            Err(_) => {
                // validate() already deleted the invalid file.
            }
        }
    }

    let mut cmd = build_encode_command(request);
    run_tool(&mut cmd, expected_duration, sink).map_err(|e| {
        let _ = fs::remove_file(&request.output);
        e
    })?;

    validate(&request.output, expected_duration, request.recover)
        .map_err(EncodeError::ValidationFailed)?;

    Ok(EncodeOutcome { reused_existing: false })
}

/// Remuxes `source` into an mp4 at `dest` via stream copy, optionally
/// rewriting the HEVC tag to the preview variant. Durations must match the
/// source; a failed remux deletes its output.
pub fn remux(
    source: &Path,
    dest: &Path,
    fix_tag: bool,
    source_info: Option<&MediaInfo>,
) -> Result<(), EncodeError> {
    if !source.exists() {
        return Err(EncodeError::InputMissing(source.to_path_buf()));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let expected_duration = source_info.and_then(|i| i.duration_secs);

    let mut cmd = build_remux_command(source, dest, fix_tag);
    run_tool(&mut cmd, None, &crate::progress::NullSink).map_err(|e| {
        let _ = fs::remove_file(dest);
        e
    })?;

    validate(dest, expected_duration, false).map_err(EncodeError::ValidationFailed)
}

/// Validates an encoder output.
///
/// Checks: file exists, size above 1 KiB, probe succeeds, video stream with
/// non-zero dimensions, and (unless `lenient`) duration within two seconds
/// of the source. A file failing any check is deleted.
pub fn validate(
    path: &Path,
    expected_duration: Option<f64>,
    lenient: bool,
) -> Result<(), InvalidReason> {
    let result = validate_checks(path, expected_duration, lenient);
    if result.is_err() && path.exists() {
        let _ = fs::remove_file(path);
    }
    result
}

/// Non-destructive variant of [`validate`]: reports the verdict without
/// deleting the file. For checking files this tool did not produce.
pub fn inspect_output(
    path: &Path,
    expected_duration: Option<f64>,
    lenient: bool,
) -> Result<(), InvalidReason> {
    validate_checks(path, expected_duration, lenient)
}

fn validate_checks(
    path: &Path,
    expected_duration: Option<f64>,
    lenient: bool,
) -> Result<(), InvalidReason> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Err(InvalidReason::Missing),
    };

    if metadata.len() < MIN_OUTPUT_BYTES {
        return Err(InvalidReason::TooSmall(metadata.len()));
    }

    let info = probe::probe_file(path).map_err(|e| InvalidReason::Unreadable(e.to_string()))?;

    if info.width == 0 || info.height == 0 {
        return Err(InvalidReason::InvalidDimensions {
            width: info.width,
            height: info.height,
        });
    }

    if let Some(source_duration) = expected_duration {
        if source_duration > 0.0 && !lenient {
            let output_duration = match info.duration_secs {
                Some(d) if d > 0.0 => d,
                _ => return Err(InvalidReason::NoDuration),
            };

            if (output_duration - source_duration).abs() > DURATION_TOLERANCE_SECS {
                return Err(InvalidReason::DurationMismatch {
                    output: output_duration,
                    expected: source_duration,
                });
            }
        }
    }

    Ok(())
}

/// Looks for a prior output sibling of `source` named `<stem><suffix>.<ext>`
/// for each given suffix and supported extension. A valid sibling is
/// returned; invalid siblings are deleted.
pub fn find_existing_output(
    source: &Path,
    suffixes: &[&str],
    expected_duration: Option<f64>,
) -> Option<PathBuf> {
    let stem = source.file_stem()?.to_string_lossy().into_owned();
    let dir = source.parent()?;

    for suffix in suffixes {
        for ext in crate::scan::VIDEO_EXTENSIONS {
            let candidate = dir.join(format!("{}{}{}", stem, suffix, ext));
            if !candidate.exists() || candidate == source {
                continue;
            }

            match validate(&candidate, expected_duration, false) {
                Ok(()) => return Some(candidate),
                Err(_) => {
                    // validate() deleted the invalid sibling.
                }
            }
        }
    }

    None
}

/// Checks that ffmpeg is runnable.
pub fn check_ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Runs an ffmpeg invocation, consuming its stderr line-by-line.
///
/// Progress lines go to `sink`; other lines are kept in a bounded tail for
/// the error report. Non-zero exit maps to `EncoderExitNonZero`; a signal
/// death maps to `Interrupted`.
fn run_tool(
    cmd: &mut Command,
    total_duration: Option<f64>,
    sink: &dyn ProgressSink,
) -> Result<(), EncodeError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    if let Some(stderr) = child.stderr.take() {
        let reader = BufReader::new(stderr);
        for_each_stderr_line(reader, |line| {
            match parse_progress_line(line, total_duration) {
                Some(update) => sink.update(&update),
                None => {
                    if !line.trim().is_empty() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                    }
                }
            }
        })?;
    }

    let status = child.wait()?;

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::EncoderExitNonZero {
                code,
                tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
            }),
            None => Err(EncodeError::Interrupted),
        }
    }
}

/// Feeds `f` each stderr line, treating both `\n` and `\r` as terminators.
/// ffmpeg rewrites its progress line in place with carriage returns, so a
/// plain line reader would see one giant line.
fn for_each_stderr_line<R: Read>(reader: R, mut f: impl FnMut(&str)) -> std::io::Result<()> {
    let mut buf = Vec::new();
    for byte in reader.bytes() {
        let byte = byte?;
        if byte == b'\n' || byte == b'\r' {
            if !buf.is_empty() {
                f(&String::from_utf8_lossy(&buf));
                buf.clear();
            }
        } else {
            buf.push(byte);
        }
    }

    if !buf.is_empty() {
        f(&String::from_utf8_lossy(&buf));
    }

    Ok(())
}
