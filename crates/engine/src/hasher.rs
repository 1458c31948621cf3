//! Perceptual frame hashing for duplicate detection.
//!
//! Samples frames at evenly-spaced positions, reduces each to a small
//! luminance grid via the decoder, and computes a DCT-based hash: the
//! low-frequency block of the 2-D DCT thresholded against its median. The
//! resulting bit-strings survive re-encoding and resolution changes, so two
//! renditions of the same video land within a small Hamming distance.

use crate::probe;
use std::f64::consts::PI;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Factor between the decoded grid side and the hash side. A hash of side W
/// is computed from a (4W)x(4W) luminance grid.
const GRID_FACTOR: usize = 4;

/// Error type for hashing operations.
#[derive(Debug, Error)]
pub enum HashError {
    /// The file could not be probed for duration.
    #[error("Probe failed: {0}")]
    ProbeFailed(#[from] probe::ProbeError),

    /// The file has no usable duration or dimensions.
    #[error("File is not decodable for hashing: {0}")]
    NotDecodable(String),

    /// Too few frames could be extracted.
    #[error("Only {got} of {wanted} frames decoded")]
    TooFewFrames { got: usize, wanted: usize },

    /// IO error running the frame extractor.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fixed-width perceptual hash: side*side bits, packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHash {
    bits: Vec<u8>,
    nbits: usize,
}

impl FrameHash {
    /// Builds a hash from individual bit values. Test and internal use.
    pub fn from_bits(bit_values: &[bool]) -> Self {
        let nbits = bit_values.len();
        let mut bits = vec![0u8; nbits.div_ceil(8)];
        for (i, &bit) in bit_values.iter().enumerate() {
            if bit {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        Self { bits, nbits }
    }

    /// Number of bits in the hash.
    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    /// Hamming distance between two hashes of equal width.
    pub fn distance(&self, other: &FrameHash) -> u32 {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Computes perceptual hashes for `samples` frames of a video.
///
/// Seeks to evenly-spaced positions inside the duration, decodes one frame
/// per position as a (4*hash_size)^2 luminance grid, and hashes each.
/// Positions that fail to decode are skipped; fewer than `samples / 2`
/// successes is a failure.
pub fn hash_video(path: &Path, samples: usize, hash_size: usize) -> Result<Vec<FrameHash>, HashError> {
    let info = probe::probe_file(path)?;
    if !info.is_probe_valid() {
        return Err(HashError::NotDecodable(format!(
            "{} has no dimensions or duration",
            path.display()
        )));
    }

    let duration = info.duration_or_zero();
    let side = hash_size * GRID_FACTOR;
    let mut hashes = Vec::with_capacity(samples);

    for i in 0..samples {
        // Positions at (i+1)/(samples+1) of the duration keep clear of both
        // the container header and the final partial GOP.
        let position = duration * (i + 1) as f64 / (samples + 1) as f64;

        match extract_gray_frame(path, position, side) {
            Ok(pixels) => hashes.push(phash(&pixels, side, hash_size)),
            Err(_) => continue,
        }
    }

    if hashes.len() * 2 < samples {
        return Err(HashError::TooFewFrames {
            got: hashes.len(),
            wanted: samples,
        });
    }

    Ok(hashes)
}

/// Mean per-index Hamming distance between two sampled-hash arrays.
///
/// Frames are paired in seek order; when the arrays differ in length the
/// comparison covers the common prefix. Empty inputs are incomparable.
pub fn similarity(a: &[FrameHash], b: &[FrameHash]) -> Option<f64> {
    let pairs = a.len().min(b.len());
    if pairs == 0 {
        return None;
    }

    let total: u32 = a.iter().zip(b.iter()).map(|(x, y)| x.distance(y)).sum();
    Some(total as f64 / pairs as f64)
}

/// Decodes one frame at `position` seconds as a side x side grayscale grid.
fn extract_gray_frame(path: &Path, position: f64, side: usize) -> Result<Vec<u8>, HashError> {
    let output = Command::new("ffmpeg")
        .arg("-v")
        .arg("error")
        .arg("-ss")
        .arg(format!("{:.3}", position))
        .arg("-i")
        .arg(path)
        .args(["-frames:v", "1"])
        .args(["-f", "rawvideo"])
        .args(["-pix_fmt", "gray"])
        .args(["-s", &format!("{}x{}", side, side)])
        .arg("pipe:1")
        .output()?;

    let expected = side * side;
    if !output.status.success() || output.stdout.len() != expected {
        return Err(HashError::NotDecodable(format!(
            "frame at {:.1}s: got {} of {} bytes",
            position,
            output.stdout.len(),
            expected
        )));
    }

    Ok(output.stdout)
}

/// DCT-based perceptual hash of a side x side grayscale grid.
///
/// Keeps the hash_size x hash_size low-frequency block of the 2-D DCT-II and
/// sets each bit where the coefficient exceeds the block median.
pub fn phash(pixels: &[u8], side: usize, hash_size: usize) -> FrameHash {
    debug_assert_eq!(pixels.len(), side * side);

    let block = dct_low_freq(pixels, side, hash_size);
    let med = median(&block);

    let bits: Vec<bool> = block.iter().map(|&c| c > med).collect();
    FrameHash::from_bits(&bits)
}

/// First `keep` x `keep` coefficients of the 2-D DCT-II of a square image.
///
/// Separable: rows first (only the kept frequencies), then columns.
fn dct_low_freq(pixels: &[u8], side: usize, keep: usize) -> Vec<f64> {
    let n = side as f64;

    // tmp[u][y] = sum_x pixels[y][x] * cos(pi (2x+1) u / 2N)
    let mut tmp = vec![0.0f64; keep * side];
    for u in 0..keep {
        for y in 0..side {
            let mut acc = 0.0;
            for x in 0..side {
                let px = pixels[y * side + x] as f64;
                acc += px * ((PI * (2 * x + 1) as f64 * u as f64) / (2.0 * n)).cos();
            }
            tmp[u * side + y] = acc;
        }
    }

    // out[v][u] = sum_y tmp[u][y] * cos(pi (2y+1) v / 2N)
    let mut out = vec![0.0f64; keep * keep];
    for v in 0..keep {
        for u in 0..keep {
            let mut acc = 0.0;
            for y in 0..side {
                acc += tmp[u * side + y] * ((PI * (2 * y + 1) as f64 * v as f64) / (2.0 * n)).cos();
            }
            out[v * keep + u] = acc;
        }
    }

    out
}

/// Median of a coefficient block (mean of the middle pair for even counts).
fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
