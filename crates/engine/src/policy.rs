//! Quality policy: compliance classification, CRF selection, and the codec
//! data tables used by ranking.
//!
//! The CRF table maps source quality (bits per pixel per frame) to a CRF for
//! the target codec so re-encodes preserve visual quality instead of using a
//! one-size-fits-all constant.

use crate::probe::MediaInfo;
use serde::{Deserialize, Serialize};

/// Containers accepted without re-encoding.
pub const MODERN_CONTAINERS: &[&str] = &["mp4", "mkv", "matroska", "webm"];

/// Codecs accepted without re-encoding.
pub const ACCEPTABLE_CODECS: &[&str] = &["hevc", "h265", "av1", "vp9", "h264"];

/// The HEVC four-character tag preview systems accept.
pub const PREVIEW_HEVC_TAG: &str = "hvc1";

/// The HEVC tag that requires a remux to become preview-compatible.
pub const NON_PREVIEW_HEVC_TAG: &str = "hev1";

/// Re-encode target codec. VP9 is recognized as compliant but is not a
/// target, so it has no entry here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetCodec {
    H264,
    Hevc,
    Av1,
}

impl TargetCodec {
    /// Parse a user-facing codec name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "h264" => Some(Self::H264),
            "hevc" | "h265" => Some(Self::Hevc),
            "av1" => Some(Self::Av1),
            _ => None,
        }
    }

    /// The ffmpeg encoder binary name for this codec.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::Hevc => "libx265",
            Self::Av1 => "libaom-av1",
        }
    }

    /// The codec name ffprobe reports for outputs of this target.
    pub fn probe_name(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Av1 => "av1",
        }
    }
}

impl std::fmt::Display for TargetCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "h264"),
            Self::Hevc => write!(f, "hevc"),
            Self::Av1 => write!(f, "av1"),
        }
    }
}

/// What must happen to bring a file up to the modernization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceAction {
    /// Nothing to do.
    Compliant,
    /// Container or codec tag change suffices; pixel data is untouched.
    NeedsRemux {
        /// The HEVC tag must be rewritten to the preview variant.
        fix_tag: bool,
    },
    /// Pixel format or color depth forces a re-encode for preview support.
    NeedsFullFix,
    /// Codec or container is not in the modern set.
    NeedsReencode,
}

/// Classification result: the action plus the encode parameters to use when
/// re-encoding was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub action: ComplianceAction,
    /// Recommended CRF, present when the action involves a re-encode.
    pub crf: Option<u8>,
    pub target: TargetCodec,
}

impl ComplianceVerdict {
    pub fn is_compliant(&self) -> bool {
        self.action == ComplianceAction::Compliant
    }
}

/// Pixel formats a codec may carry and still render in preview tools.
fn acceptable_pix_fmts(codec: &str) -> &'static [&'static str] {
    match codec {
        "h264" | "avc1" => &["yuv420p"],
        _ => &["yuv420p", "yuv420p10le"],
    }
}

/// Classifies a file against the modernization policy.
///
/// Decision order: non-modern codec/container forces a full re-encode; an
/// unacceptable pixel format forces a preview-fix re-encode; a wrong
/// container or HEVC tag needs only a remux; everything else is compliant.
pub fn classify(
    info: &MediaInfo,
    target: TargetCodec,
    crf_override: Option<u8>,
) -> ComplianceVerdict {
    let codec = info.codec.to_lowercase();

    let codec_ok = ACCEPTABLE_CODECS.contains(&codec.as_str());
    let container_ok = MODERN_CONTAINERS.contains(&info.container.as_str());

    if !codec_ok || !container_ok {
        return ComplianceVerdict {
            action: ComplianceAction::NeedsReencode,
            crf: Some(crf_override.unwrap_or_else(|| select_crf(info, target))),
            target,
        };
    }

    let pix_ok = info.pix_fmt.is_empty() || acceptable_pix_fmts(&codec).contains(&info.pix_fmt.as_str());
    if !pix_ok {
        return ComplianceVerdict {
            action: ComplianceAction::NeedsFullFix,
            crf: Some(crf_override.unwrap_or_else(|| select_crf(info, target))),
            target,
        };
    }

    let is_hevc = codec == "hevc" || codec == "h265";
    let bad_tag = is_hevc && info.codec_tag.eq_ignore_ascii_case(NON_PREVIEW_HEVC_TAG);

    if info.container != "mp4" || bad_tag {
        return ComplianceVerdict {
            action: ComplianceAction::NeedsRemux { fix_tag: bad_tag },
            crf: None,
            target,
        };
    }

    ComplianceVerdict {
        action: ComplianceAction::Compliant,
        crf: None,
        target,
    }
}

/// True when common desktop preview tools will render the file directly:
/// mp4 container, h264 or preview-tagged hevc, acceptable pixel format.
pub fn is_preview_compatible(info: &MediaInfo) -> bool {
    if info.container != "mp4" && info.container != "m4v" {
        return false;
    }

    let codec = info.codec.to_lowercase();
    let codec_ok = match codec.as_str() {
        "h264" | "avc1" => true,
        "hevc" | "h265" | "hvc1" => {
            // An explicit hev1 tag breaks preview even inside mp4.
            !info.codec_tag.eq_ignore_ascii_case(NON_PREVIEW_HEVC_TAG)
        }
        _ => false,
    };

    codec_ok
        && (info.pix_fmt.is_empty() || acceptable_pix_fmts(&codec).contains(&info.pix_fmt.as_str()))
}

/// Selects a CRF for re-encoding based on source quality.
///
/// Quality indicator is bits per pixel per frame:
/// `bpp = bitrate / (width * height * fps)`. High bpp sources get a lower
/// CRF to preserve detail; low bpp sources tolerate a higher one. When the
/// container reports no bitrate it is estimated from file size and duration;
/// if bpp still cannot be computed, the lowest tier is used.
pub fn select_crf(info: &MediaInfo, target: TargetCodec) -> u8 {
    let bpp = bits_per_pixel(info);
    crf_for_bpp(bpp, target)
}

/// bpp for a probed file, None when it cannot be computed.
pub fn bits_per_pixel(info: &MediaInfo) -> Option<f64> {
    let pixels = (info.width as f64) * (info.height as f64);
    let duration = info.duration_or_zero();
    if pixels == 0.0 || duration <= 0.0 {
        return None;
    }

    let bitrate = if info.bitrate > 0 {
        info.bitrate as f64
    } else if info.file_size > 0 {
        (info.file_size as f64) * 8.0 / duration
    } else {
        return None;
    };

    let fps = if info.fps > 0.0 { info.fps } else { 30.0 };
    Some(bitrate / (pixels * fps))
}

/// The CRF table. `None` bpp selects the lowest tier.
pub fn crf_for_bpp(bpp: Option<f64>, target: TargetCodec) -> u8 {
    let tier = match bpp {
        Some(b) if b > 0.25 => 0,
        Some(b) if b > 0.15 => 1,
        Some(b) if b > 0.10 => 2,
        Some(b) if b > 0.07 => 3,
        Some(b) if b > 0.05 => 4,
        _ => 5,
    };

    match target {
        TargetCodec::Hevc => [18, 20, 22, 23, 25, 28][tier],
        TargetCodec::Av1 => [20, 24, 28, 30, 30, 32][tier],
        TargetCodec::H264 => [16, 18, 20, 21, 23, 26][tier],
    }
}

/// Compression efficiency multiplier relative to H.264, used to normalize
/// bitrates when ranking duplicate quality.
pub fn codec_efficiency(codec: &str) -> f64 {
    match codec.to_lowercase().as_str() {
        "av1" => 2.5,
        "hevc" | "h265" | "hvc1" | "vp9" => 2.0,
        "h264" | "avc1" => 1.0,
        "mpeg4" | "xvid" => 0.6,
        c if c.starts_with("wmv") => 0.5,
        "mpeg2" | "mpeg2video" => 0.4,
        _ => 0.5,
    }
}

/// Flat modernity score for a codec, used to rank duplicate quality.
pub fn codec_modernity_score(codec: &str) -> i64 {
    match codec.to_lowercase().as_str() {
        "av1" => 1000,
        "vp9" => 900,
        "hevc" | "h265" | "hvc1" => 800,
        "h264" | "avc1" => 400,
        "mpeg4" | "xvid" => 200,
        "mpeg2" | "mpeg2video" => 100,
        c if c.starts_with("wmv") => 50,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_info(
        codec: &str,
        tag: &str,
        pix_fmt: &str,
        container: &str,
        width: u32,
        height: u32,
        bitrate: u64,
        fps: f64,
        duration: f64,
    ) -> MediaInfo {
        MediaInfo {
            codec: codec.to_string(),
            codec_tag: tag.to_string(),
            pix_fmt: pix_fmt.to_string(),
            color_depth: if pix_fmt.contains("10") { 10 } else { 8 },
            container: container.to_string(),
            width,
            height,
            duration_secs: Some(duration),
            fps,
            bitrate,
            has_audio: true,
            file_size: 0,
        }
    }

    #[test]
    fn test_classify_old_codec_needs_reencode() {
        let info = make_info("mpeg4", "XVID", "yuv420p", "avi", 640, 480, 1_000_000, 30.0, 60.0);
        let verdict = classify(&info, TargetCodec::Hevc, None);

        assert_eq!(verdict.action, ComplianceAction::NeedsReencode);
        // bpp = 1_000_000 / (640*480*30) ~ 0.1085 -> 0.10..0.15 tier
        assert_eq!(verdict.crf, Some(22));
    }

    #[test]
    fn test_classify_modern_mp4_compliant() {
        let info = make_info(
            "hevc", "hvc1", "yuv420p10le", "mp4", 1920, 1080, 3_000_000, 30.0, 600.0,
        );
        let verdict = classify(&info, TargetCodec::Hevc, None);
        assert!(verdict.is_compliant());
        assert_eq!(verdict.crf, None);
    }

    #[test]
    fn test_classify_mkv_needs_remux() {
        let info = make_info(
            "hevc", "", "yuv420p10le", "matroska", 1920, 1080, 3_000_000, 30.0, 600.0,
        );
        let verdict = classify(&info, TargetCodec::Hevc, None);
        assert_eq!(verdict.action, ComplianceAction::NeedsRemux { fix_tag: false });
    }

    #[test]
    fn test_classify_hev1_tag_needs_tag_fix() {
        let info = make_info(
            "hevc", "hev1", "yuv420p10le", "mp4", 1920, 1080, 3_000_000, 30.0, 600.0,
        );
        let verdict = classify(&info, TargetCodec::Hevc, None);
        assert_eq!(verdict.action, ComplianceAction::NeedsRemux { fix_tag: true });
    }

    #[test]
    fn test_classify_bad_pix_fmt_needs_full_fix() {
        let info = make_info(
            "hevc", "hvc1", "yuv444p", "mp4", 1920, 1080, 3_000_000, 30.0, 600.0,
        );
        let verdict = classify(&info, TargetCodec::Hevc, None);
        assert_eq!(verdict.action, ComplianceAction::NeedsFullFix);
        assert!(verdict.crf.is_some());
    }

    #[test]
    fn test_classify_crf_override_wins() {
        let info = make_info("mpeg4", "", "yuv420p", "avi", 640, 480, 1_000_000, 30.0, 60.0);
        let verdict = classify(&info, TargetCodec::Hevc, Some(17));
        assert_eq!(verdict.crf, Some(17));
    }

    #[test]
    fn test_vp9_is_compliant_not_reencoded() {
        let info = make_info("vp9", "", "yuv420p", "webm", 1920, 1080, 2_000_000, 30.0, 600.0);
        let verdict = classify(&info, TargetCodec::Hevc, None);
        // webm container is modern and vp9 is acceptable; only the container
        // triggers a remux to mp4.
        assert_eq!(verdict.action, ComplianceAction::NeedsRemux { fix_tag: false });
    }

    #[test]
    fn test_crf_table_hevc_tiers() {
        assert_eq!(crf_for_bpp(Some(0.30), TargetCodec::Hevc), 18);
        assert_eq!(crf_for_bpp(Some(0.20), TargetCodec::Hevc), 20);
        assert_eq!(crf_for_bpp(Some(0.12), TargetCodec::Hevc), 22);
        assert_eq!(crf_for_bpp(Some(0.08), TargetCodec::Hevc), 23);
        assert_eq!(crf_for_bpp(Some(0.06), TargetCodec::Hevc), 25);
        assert_eq!(crf_for_bpp(Some(0.01), TargetCodec::Hevc), 28);
        assert_eq!(crf_for_bpp(None, TargetCodec::Hevc), 28);
    }

    #[test]
    fn test_crf_table_av1_tiers() {
        assert_eq!(crf_for_bpp(Some(0.30), TargetCodec::Av1), 20);
        assert_eq!(crf_for_bpp(Some(0.20), TargetCodec::Av1), 24);
        assert_eq!(crf_for_bpp(Some(0.12), TargetCodec::Av1), 28);
        assert_eq!(crf_for_bpp(Some(0.08), TargetCodec::Av1), 30);
        assert_eq!(crf_for_bpp(Some(0.06), TargetCodec::Av1), 30);
        assert_eq!(crf_for_bpp(None, TargetCodec::Av1), 32);
    }

    #[test]
    fn test_crf_table_h264_tiers() {
        assert_eq!(crf_for_bpp(Some(0.30), TargetCodec::H264), 16);
        assert_eq!(crf_for_bpp(Some(0.20), TargetCodec::H264), 18);
        assert_eq!(crf_for_bpp(Some(0.12), TargetCodec::H264), 20);
        assert_eq!(crf_for_bpp(Some(0.08), TargetCodec::H264), 21);
        assert_eq!(crf_for_bpp(Some(0.06), TargetCodec::H264), 23);
        assert_eq!(crf_for_bpp(None, TargetCodec::H264), 26);
    }

    #[test]
    fn test_bpp_missing_bitrate_estimated_from_size() {
        let mut info = make_info("mpeg4", "", "yuv420p", "avi", 640, 480, 0, 30.0, 60.0);
        info.file_size = 7_500_000; // 7.5 MB over 60s = 1 Mbps
        let bpp = bits_per_pixel(&info).unwrap();
        assert!((bpp - 0.1085).abs() < 0.001);
    }

    #[test]
    fn test_bpp_unknown_selects_lowest_tier() {
        let info = make_info("mpeg4", "", "yuv420p", "avi", 640, 480, 0, 30.0, 60.0);
        assert_eq!(bits_per_pixel(&info), None);
        assert_eq!(select_crf(&info, TargetCodec::Hevc), 28);
    }

    #[test]
    fn test_preview_compatibility() {
        let good_hevc = make_info(
            "hevc", "hvc1", "yuv420p10le", "mp4", 1920, 1080, 3_000_000, 30.0, 600.0,
        );
        assert!(is_preview_compatible(&good_hevc));

        let hev1 = make_info(
            "hevc", "hev1", "yuv420p10le", "mp4", 1920, 1080, 3_000_000, 30.0, 600.0,
        );
        assert!(!is_preview_compatible(&hev1));

        let h264 = make_info("h264", "avc1", "yuv420p", "mp4", 1920, 1080, 6_000_000, 30.0, 600.0);
        assert!(is_preview_compatible(&h264));

        let mkv = make_info(
            "hevc", "hvc1", "yuv420p", "matroska", 1920, 1080, 3_000_000, 30.0, 600.0,
        );
        assert!(!is_preview_compatible(&mkv));

        let old = make_info("mpeg4", "XVID", "yuv420p", "mp4", 640, 480, 1_000_000, 30.0, 60.0);
        assert!(!is_preview_compatible(&old));
    }

    #[test]
    fn test_codec_tables() {
        assert_eq!(TargetCodec::Hevc.encoder_name(), "libx265");
        assert_eq!(TargetCodec::H264.encoder_name(), "libx264");
        assert_eq!(TargetCodec::Av1.encoder_name(), "libaom-av1");

        assert!((codec_efficiency("av1") - 2.5).abs() < f64::EPSILON);
        assert!((codec_efficiency("hevc") - 2.0).abs() < f64::EPSILON);
        assert!((codec_efficiency("h264") - 1.0).abs() < f64::EPSILON);
        assert!((codec_efficiency("wmv3") - 0.5).abs() < f64::EPSILON);

        assert_eq!(codec_modernity_score("av1"), 1000);
        assert_eq!(codec_modernity_score("hvc1"), 800);
        assert_eq!(codec_modernity_score("avc1"), 400);
        assert_eq!(codec_modernity_score("mpeg2video"), 100);
    }

    #[test]
    fn test_target_codec_parse() {
        assert_eq!(TargetCodec::parse("HEVC"), Some(TargetCodec::Hevc));
        assert_eq!(TargetCodec::parse("h265"), Some(TargetCodec::Hevc));
        assert_eq!(TargetCodec::parse("h264"), Some(TargetCodec::H264));
        assert_eq!(TargetCodec::parse("av1"), Some(TargetCodec::Av1));
        assert_eq!(TargetCodec::parse("vp9"), None);
        assert_eq!(TargetCodec::parse("prores"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // For any finite (bitrate, width, height, fps) the table is a pure
        // function: same inputs, same CRF, and the CRF falls in the table's
        // range for the codec.
        #[test]
        fn prop_crf_deterministic_and_bounded(
            bitrate in 1u64..100_000_000,
            width in 16u32..8000,
            height in 16u32..5000,
            fps in 1.0f64..120.0,
            duration in 1.0f64..20_000.0,
        ) {
            let info = make_info("mpeg4", "", "yuv420p", "avi", width, height, bitrate, fps, duration);

            let first = select_crf(&info, TargetCodec::Hevc);
            let second = select_crf(&info, TargetCodec::Hevc);
            prop_assert_eq!(first, second);
            prop_assert!((18..=28).contains(&first));

            let h264 = select_crf(&info, TargetCodec::H264);
            prop_assert!((16..=26).contains(&h264));

            let av1 = select_crf(&info, TargetCodec::Av1);
            prop_assert!((20..=32).contains(&av1));
        }

        // Lower bpp never selects a lower (higher-quality) CRF.
        #[test]
        fn prop_crf_monotonic_in_bpp(a in 0.001f64..1.0, b in 0.001f64..1.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            for target in [TargetCodec::Hevc, TargetCodec::Av1, TargetCodec::H264] {
                prop_assert!(crf_for_bpp(Some(lo), target) >= crf_for_bpp(Some(hi), target));
            }
        }
    }
}
