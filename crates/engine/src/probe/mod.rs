//! Media probe module: extracts stream and format metadata via ffprobe.
//!
//! Runs `ffprobe -v quiet -print_format json -show_format -show_streams <path>`
//! and parses the JSON document into a [`MediaInfo`]. Absent fields are
//! reported as absent or zero, never fabricated.

pub mod cache;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

pub use cache::ProbeCache;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute or exited non-zero.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video stream.
    #[error("No video stream found in {0}")]
    NoVideoStream(PathBuf),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata for a single video file, as reported by the probe tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    /// Video codec name (e.g. "hevc", "h264", "mpeg4").
    pub codec: String,
    /// Four-character codec tag (e.g. "hvc1", "hev1", "avc1"). Empty if unknown.
    pub codec_tag: String,
    /// Pixel format (e.g. "yuv420p", "yuv420p10le"). Empty if unknown.
    pub pix_fmt: String,
    /// Color depth in bits (8 or 10).
    pub color_depth: u8,
    /// Container format (first token of ffprobe's format_name).
    pub container: String,
    /// Video width in pixels (0 if unknown).
    pub width: u32,
    /// Video height in pixels (0 if unknown).
    pub height: u32,
    /// Duration in seconds, absent when the tool reports none.
    pub duration_secs: Option<f64>,
    /// Frame rate in frames per second (0.0 if unknown).
    pub fps: f64,
    /// Overall bitrate in bits per second (0 if unknown).
    pub bitrate: u64,
    /// Whether the file has at least one audio stream.
    pub has_audio: bool,
    /// File size in bytes as reported by the container (0 if unknown).
    pub file_size: u64,
}

impl MediaInfo {
    /// A file is probe-valid when it has real dimensions and a positive duration.
    /// Probe-invalid files are unsuitable for normal processing.
    pub fn is_probe_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.duration_secs.map(|d| d > 0.0).unwrap_or(false)
    }

    /// Duration in seconds, or 0.0 when absent.
    pub fn duration_or_zero(&self) -> f64 {
        self.duration_secs.unwrap_or(0.0)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub codec_tag_string: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub pix_fmt: Option<String>,
        pub bits_per_raw_sample: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        pub size: Option<String>,
    }
}

/// Probes a video file with ffprobe and parses the result.
pub fn probe_file(path: &Path) -> Result<MediaInfo, ProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(path, &stdout)
}

/// Parses ffprobe JSON output into a [`MediaInfo`].
pub fn parse_probe_output(path: &Path, json_str: &str) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_stream = None;
    let mut has_audio = false;

    for stream in streams {
        match stream.codec_type.as_deref() {
            Some("video") if video_stream.is_none() => video_stream = Some(stream),
            Some("audio") => has_audio = true,
            _ => {}
        }
    }

    let video = video_stream.ok_or_else(|| ProbeError::NoVideoStream(path.to_path_buf()))?;

    let codec = video.codec_name.unwrap_or_default();
    let codec_tag = video.codec_tag_string.unwrap_or_default();
    let pix_fmt = video.pix_fmt.unwrap_or_default();
    let fps = video
        .r_frame_rate
        .as_deref()
        .map(parse_frame_rate)
        .unwrap_or(0.0);

    let color_depth = video
        .bits_per_raw_sample
        .as_deref()
        .and_then(|b| b.parse::<u8>().ok())
        .unwrap_or_else(|| if pix_fmt.contains("10") { 10 } else { 8 });

    let container = format
        .format_name
        .as_deref()
        .map(normalize_container)
        .unwrap_or_else(|| "unknown".to_string());

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite());

    let bitrate = format
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<u64>().ok())
        .unwrap_or(0);

    let file_size = format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(MediaInfo {
        codec,
        codec_tag,
        pix_fmt,
        color_depth,
        container,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_secs,
        fps,
        bitrate,
        has_audio,
        file_size,
    })
}

/// Normalizes ffprobe's comma-separated format_name into a single container
/// label. MP4 files report the demuxer group "mov,mp4,m4a,3gp,3g2,mj2"; the
/// mp4 token wins over the leading "mov" so compliance checks see "mp4".
fn normalize_container(format_name: &str) -> String {
    let tokens: Vec<&str> = format_name.split(',').collect();
    if tokens.iter().any(|t| *t == "mp4") {
        return "mp4".to_string();
    }
    tokens.first().copied().unwrap_or("unknown").to_string()
}

/// Parses an ffprobe rational frame rate like "30000/1001" into fps.
fn parse_frame_rate(rate: &str) -> f64 {
    let mut parts = rate.splitn(2, '/');
    let num = parts.next().and_then(|n| n.parse::<f64>().ok());
    let den = parts.next().and_then(|d| d.parse::<f64>().ok());

    match (num, den) {
        (Some(n), Some(d)) if d != 0.0 => n / d,
        (Some(n), None) => n,
        _ => 0.0,
    }
}
