//! Parsing of the encoder's stderr progress stream.
//!
//! ffmpeg reports progress as carriage-return-terminated lines of the form
//! `frame= 1234 fps= 45 q=28.0 size=  10240KiB time=00:01:23.45 ... speed=1.5x`.
//! The tokenizer is permissive: keys may be separated from values by spaces,
//! unknown tokens are ignored, and malformed values leave the field absent.

/// One parsed progress report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    /// Frames encoded so far.
    pub frame: Option<u64>,
    /// Current encoder throughput in frames per second.
    pub fps: Option<f64>,
    /// Position in the output timeline, seconds.
    pub seconds: Option<f64>,
    /// Encoding speed relative to realtime (1.0 = realtime).
    pub speed: Option<f64>,
    /// Percent complete against the source duration, 0-100.
    pub percent: Option<f64>,
    /// Estimated seconds remaining.
    pub eta_secs: Option<f64>,
}

/// Receiver for progress events during an encode.
///
/// Implementations must be callable from the thread driving the encoder
/// subprocess. The engine never prints progress itself.
pub trait ProgressSink: Send + Sync {
    fn update(&self, update: &ProgressUpdate);
}

/// Sink that drops all events.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn update(&self, _update: &ProgressUpdate) {}
}

/// Parses one stderr line into a progress update.
///
/// Returns `None` for lines that carry no progress tokens (encoder banners,
/// warnings, error text). When `total_duration` is known, percent and ETA
/// are derived from the parsed position and speed.
pub fn parse_progress_line(line: &str, total_duration: Option<f64>) -> Option<ProgressUpdate> {
    let mut update = ProgressUpdate::default();
    let mut saw_token = false;

    // Re-join "key= value" splits produced by ffmpeg's column alignment.
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        let (key, mut value) = match token.split_once('=') {
            Some((k, v)) => (k, v.to_string()),
            None => {
                i += 1;
                continue;
            }
        };

        if value.is_empty() && i + 1 < tokens.len() {
            value = tokens[i + 1].to_string();
            i += 1;
        }

        match key {
            "frame" => {
                if let Ok(frame) = value.parse::<u64>() {
                    update.frame = Some(frame);
                    saw_token = true;
                }
            }
            "fps" => {
                if let Ok(fps) = value.parse::<f64>() {
                    update.fps = Some(fps);
                    saw_token = true;
                }
            }
            "time" => {
                if let Some(secs) = parse_timestamp(&value) {
                    update.seconds = Some(secs);
                    saw_token = true;
                }
            }
            "speed" => {
                if let Ok(speed) = value.trim_end_matches('x').parse::<f64>() {
                    update.speed = Some(speed);
                    saw_token = true;
                }
            }
            _ => {}
        }

        i += 1;
    }

    if !saw_token {
        return None;
    }

    if let (Some(position), Some(total)) = (update.seconds, total_duration) {
        if total > 0.0 {
            update.percent = Some((position / total * 100.0).min(100.0));

            if let Some(speed) = update.speed {
                if speed > 0.0 {
                    let remaining = (total - position).max(0.0);
                    update.eta_secs = Some(remaining / speed);
                }
            }
        }
    }

    Some(update)
}

/// Parses an ffmpeg `HH:MM:SS.cs` timestamp into seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    // ffmpeg emits "N/A" before the first timestamped frame.
    if value.starts_with('N') || value.starts_with('-') {
        return None;
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours = parts[0].parse::<f64>().ok()?;
    let minutes = parts[1].parse::<f64>().ok()?;
    let seconds = parts[2].parse::<f64>().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_typical_line() {
        let line = "frame= 1234 fps= 45 q=28.0 size=   10240KiB time=00:01:23.45 bitrate=1010.3kbits/s speed=1.5x";
        let update = parse_progress_line(line, Some(600.0)).unwrap();

        assert_eq!(update.frame, Some(1234));
        assert_eq!(update.fps, Some(45.0));
        assert!((update.seconds.unwrap() - 83.45).abs() < 0.001);
        assert_eq!(update.speed, Some(1.5));
        assert!((update.percent.unwrap() - 13.908).abs() < 0.01);
        // ETA = (600 - 83.45) / 1.5
        assert!((update.eta_secs.unwrap() - 344.366).abs() < 0.01);
    }

    #[test]
    fn test_parse_compact_line() {
        let line = "frame=100 fps=30.5 time=00:00:10.00 speed=2x";
        let update = parse_progress_line(line, None).unwrap();

        assert_eq!(update.frame, Some(100));
        assert_eq!(update.fps, Some(30.5));
        assert_eq!(update.seconds, Some(10.0));
        assert_eq!(update.speed, Some(2.0));
        assert_eq!(update.percent, None);
        assert_eq!(update.eta_secs, None);
    }

    #[test]
    fn test_non_progress_lines_rejected() {
        assert_eq!(parse_progress_line("ffmpeg version 6.1 Copyright", Some(60.0)), None);
        assert_eq!(
            parse_progress_line("[libx265 @ 0x55] HEVC encoder version 3.5", Some(60.0)),
            None
        );
        assert_eq!(parse_progress_line("", Some(60.0)), None);
    }

    #[test]
    fn test_na_time_token_ignored() {
        let line = "frame=    0 fps=0.0 q=0.0 size=       0KiB time=N/A bitrate=N/A speed=N/A";
        let update = parse_progress_line(line, Some(60.0)).unwrap();
        assert_eq!(update.frame, Some(0));
        assert_eq!(update.seconds, None);
        assert_eq!(update.speed, None);
    }

    #[test]
    fn test_percent_clamped_to_100() {
        let line = "frame=1 time=00:02:00.00 speed=1.0x";
        let update = parse_progress_line(line, Some(60.0)).unwrap();
        assert_eq!(update.percent, Some(100.0));
        assert_eq!(update.eta_secs, Some(0.0));
    }

    #[test]
    fn test_zero_speed_gives_no_eta() {
        let line = "frame=1 time=00:00:10.00 speed=0.0x";
        let update = parse_progress_line(line, Some(60.0)).unwrap();
        assert!(update.percent.is_some());
        assert_eq!(update.eta_secs, None);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:00:00.00"), Some(0.0));
        assert!((parse_timestamp("01:02:03.50").unwrap() - 3723.5).abs() < 0.001);
        assert!((parse_timestamp("00:10:00.00").unwrap() - 600.0).abs() < 0.001);
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("-00:00:01.00"), None);
        assert_eq!(parse_timestamp("12:34"), None);
        assert_eq!(parse_timestamp("garbage"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // Round-trip: a synthesized progress line parses back to its fields.
        #[test]
        fn prop_synthesized_lines_parse(
            frame in 0u64..10_000_000,
            fps in 0.1f64..500.0,
            hours in 0u32..10,
            minutes in 0u32..60,
            secs in 0u32..60,
            speed_tenths in 1u64..100,
        ) {
            let speed = speed_tenths as f64 / 10.0;
            let line = format!(
                "frame={} fps={:.1} q=28.0 time={:02}:{:02}:{:02}.00 speed={:.1}x",
                frame, fps, hours, minutes, secs, speed
            );

            let update = parse_progress_line(&line, None).expect("should parse");
            prop_assert_eq!(update.frame, Some(frame));

            let expected_secs = (hours * 3600 + minutes * 60 + secs) as f64;
            prop_assert!((update.seconds.unwrap() - expected_secs).abs() < 0.001);
            prop_assert!((update.speed.unwrap() - speed).abs() < 0.051);
        }

        // Percent is always within [0, 100] when a duration is known.
        #[test]
        fn prop_percent_bounded(
            position_secs in 0u32..100_000,
            total in 1.0f64..100_000.0,
        ) {
            let line = format!(
                "frame=1 time={:02}:{:02}:{:02}.00 speed=1.0x",
                position_secs / 3600,
                (position_secs / 60) % 60,
                position_secs % 60
            );
            let update = parse_progress_line(&line, Some(total)).expect("should parse");
            let percent = update.percent.unwrap();
            prop_assert!((0.0..=100.0).contains(&percent));
        }
    }
}
