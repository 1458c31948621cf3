//! Duplicate grouping and survivor selection.
//!
//! Two grouping modes: perceptual (frame-hash distance) and filename
//! (normalized stem matching with a duration cross-check). Within a group
//! the quality ranking picks the keeper; a freshly produced `_reencoded` or
//! `_quicklook` file outranks any other member regardless of resolution or
//! bitrate.

use crate::hasher::{self, FrameHash};
use crate::policy;
use crate::probe::MediaInfo;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Score bonus for files produced by a prior encode run.
const PRODUCED_SUFFIX_BONUS: i64 = 50_000;

/// Score bonus for preview-compatible files.
const PREVIEW_COMPAT_BONUS: i64 = 5_000;

/// Filename suffixes that mark a produced file.
const PRODUCED_SUFFIXES: &[&str] = &["_reencoded", "_quicklook"];

/// A group of files considered the same video, with its designated survivor.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub members: Vec<PathBuf>,
    pub keeper: PathBuf,
}

/// Result of a perceptual duplicate scan.
#[derive(Debug, Default)]
pub struct PerceptualScan {
    /// Groups of two or more similar videos.
    pub groups: Vec<Vec<PathBuf>>,
    /// Files whose hashes could not be computed, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

/// Finds duplicate videos by perceptual hashing.
///
/// Hashes every candidate (skipping failures), then clusters greedily.
pub fn find_duplicates_perceptual(
    paths: &[PathBuf],
    samples: usize,
    hash_size: usize,
    threshold: f64,
) -> PerceptualScan {
    let mut hashed: Vec<(PathBuf, Vec<FrameHash>)> = Vec::new();
    let mut failed = Vec::new();

    for path in paths {
        match hasher::hash_video(path, samples, hash_size) {
            Ok(hashes) => hashed.push((path.clone(), hashes)),
            Err(e) => failed.push((path.clone(), e.to_string())),
        }
    }

    PerceptualScan {
        groups: group_by_hashes(&hashed, threshold),
        failed,
    }
}

/// Greedy clustering over precomputed hash arrays.
///
/// For each video not yet grouped, open a group and pull in every other
/// ungrouped video whose mean frame distance is at or below the threshold.
/// Singleton groups are discarded.
pub fn group_by_hashes(hashed: &[(PathBuf, Vec<FrameHash>)], threshold: f64) -> Vec<Vec<PathBuf>> {
    let mut groups = Vec::new();
    let mut taken = vec![false; hashed.len()];

    for i in 0..hashed.len() {
        if taken[i] {
            continue;
        }
        taken[i] = true;

        let mut group = vec![hashed[i].0.clone()];
        for j in (i + 1)..hashed.len() {
            if taken[j] {
                continue;
            }
            if let Some(distance) = hasher::similarity(&hashed[i].1, &hashed[j].1) {
                if distance <= threshold {
                    group.push(hashed[j].0.clone());
                    taken[j] = true;
                }
            }
        }

        if group.len() > 1 {
            groups.push(group);
        }
    }

    groups
}

/// Normalizes a filename stem for duplicate matching.
///
/// Lower-cases and repeatedly strips trailing produced-file suffixes,
/// `_backup`, copy markers (`_copy`, ` (1)`), and numeric `.N` tails, so
/// `Movie_reencoded (1)` and `movie.2` both collapse to `movie`.
pub fn normalize_stem(stem: &str) -> String {
    let mut name = stem.to_lowercase();

    loop {
        let before = name.len();

        for suffix in PRODUCED_SUFFIXES {
            if let Some(rest) = name.strip_suffix(suffix) {
                name = rest.to_string();
            }
        }
        if let Some(rest) = name.strip_suffix("_backup") {
            name = rest.to_string();
        }
        if let Some(rest) = name.strip_suffix("_copy") {
            name = rest.to_string();
        }

        // " (1)" style copy numbering.
        if name.ends_with(')') {
            if let Some(open) = name.rfind(" (") {
                let inner = &name[open + 2..name.len() - 1];
                if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                    name.truncate(open);
                }
            }
        }

        // ".2" style copy numbering.
        if let Some(dot) = name.rfind('.') {
            let tail = &name[dot + 1..];
            if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
                name.truncate(dot);
            }
        }

        name = name.trim_end().to_string();

        if name.len() == before {
            break;
        }
    }

    name
}

/// Finds duplicates by normalized filename.
///
/// Entries carry the probed duration (None when the file could not be
/// probed). With `check_duration` set, members whose duration is unknown or
/// differs from the group median by more than `tolerance_secs` are dropped.
/// Groups that fall below two members are discarded.
pub fn group_by_filename(
    entries: &[(PathBuf, Option<f64>)],
    check_duration: bool,
    tolerance_secs: f64,
) -> Vec<Vec<PathBuf>> {
    // BTreeMap keeps group order stable across runs.
    let mut by_name: BTreeMap<String, Vec<usize>> = BTreeMap::new();

    for (idx, (path, _)) in entries.iter().enumerate() {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        by_name.entry(normalize_stem(&stem)).or_default().push(idx);
    }

    let mut groups = Vec::new();

    for (_, indices) in by_name {
        if indices.len() < 2 {
            continue;
        }

        let mut members: Vec<(PathBuf, Option<f64>)> =
            indices.iter().map(|&i| entries[i].clone()).collect();

        if check_duration {
            let mut durations: Vec<f64> = members.iter().filter_map(|(_, d)| *d).collect();
            if durations.is_empty() {
                continue;
            }
            durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let median = durations[durations.len() / 2];

            members.retain(|(_, d)| match d {
                Some(d) => (d - median).abs() <= tolerance_secs,
                None => false,
            });
        }

        if members.len() > 1 {
            groups.push(members.into_iter().map(|(p, _)| p).collect());
        }
    }

    groups
}

/// True when the stem carries a produced-file suffix.
fn has_produced_suffix(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| PRODUCED_SUFFIXES.iter().any(|sfx| stem.ends_with(sfx)))
        .unwrap_or(false)
}

/// Quality score for ranking members of a duplicate group.
///
/// The produced-suffix bonus dominates deliberately: a file this tool just
/// made outranks any non-produced file. The remaining contributions order
/// files by preview support, container, codec modernity, resolution, and
/// efficiency-normalized bitrate.
pub fn rank_video_quality(path: &Path, info: &MediaInfo) -> i64 {
    let mut score = 0i64;

    if has_produced_suffix(path) {
        score += PRODUCED_SUFFIX_BONUS;
    }

    if policy::is_preview_compatible(info) {
        score += PREVIEW_COMPAT_BONUS;
    }

    score += match info.container.as_str() {
        "mp4" | "m4v" => 300,
        "mkv" | "matroska" | "webm" => 100,
        _ => 0,
    };

    score += policy::codec_modernity_score(&info.codec);
    score += (info.width as i64 * info.height as i64) / 1000;

    let normalized_bitrate = (info.bitrate as f64) * policy::codec_efficiency(&info.codec);
    score += (normalized_bitrate / 10_000.0) as i64;

    score
}

/// Resolves a raw path group into a [`DuplicateGroup`] with its keeper.
pub fn resolve_group(members: Vec<(PathBuf, MediaInfo)>) -> Option<DuplicateGroup> {
    if members.len() < 2 {
        return None;
    }
    let keeper = select_keeper(&members)?;
    Some(DuplicateGroup {
        members: members.into_iter().map(|(path, _)| path).collect(),
        keeper,
    })
}

/// Picks the keeper of a group: highest score, ties broken by larger file
/// size, then lexicographically smaller path.
pub fn select_keeper(members: &[(PathBuf, MediaInfo)]) -> Option<PathBuf> {
    members
        .iter()
        .max_by(|(path_a, info_a), (path_b, info_b)| {
            let score_a = rank_video_quality(path_a, info_a);
            let score_b = rank_video_quality(path_b, info_b);
            score_a
                .cmp(&score_b)
                .then(info_a.file_size.cmp(&info_b.file_size))
                // Reverse: the lexicographically smaller path wins.
                .then_with(|| path_b.cmp(path_a))
        })
        .map(|(path, _)| path.clone())
}

/// After non-keepers are removed, renames a suffixed keeper to the
/// un-suffixed name when that name is free. Never overwrites.
pub fn cleanup_keeper_name(keeper: &Path) -> io::Result<Option<PathBuf>> {
    let Some(stem) = keeper.file_stem().and_then(|s| s.to_str()) else {
        return Ok(None);
    };

    let Some(stripped) = PRODUCED_SUFFIXES
        .iter()
        .find_map(|sfx| stem.strip_suffix(sfx))
    else {
        return Ok(None);
    };

    let extension = keeper
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    let target = keeper.with_file_name(format!("{}.{}", stripped, extension));

    if target.exists() {
        return Ok(None);
    }

    std::fs::rename(keeper, &target)?;
    Ok(Some(target))
}
