//! CLI entry point for VideoSentinel
//!
//! Parses command line arguments, wires the engine components together, and
//! renders progress. The engine itself never touches the terminal beyond
//! stderr warnings.

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use videosentinel_engine::batch::{BatchController, BatchOptions, FileOutcome};
use videosentinel_engine::policy::TargetCodec;
use videosentinel_engine::probe::{self, MediaInfo, ProbeCache};
use videosentinel_engine::progress::{ProgressSink, ProgressUpdate};
use videosentinel_engine::shutdown::ShutdownFlag;
use videosentinel_engine::{dupes, encoder, pipeline, policy, scan, Config};

/// VideoSentinel - manage and validate a video library
#[derive(Parser, Debug)]
#[command(name = "videosentinel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing video files to analyze
    directory: PathBuf,

    /// Recursively scan subdirectories
    #[arg(short, long)]
    recursive: bool,

    /// Check if videos meet modern encoding specifications
    #[arg(long)]
    check_specs: bool,

    /// Re-encode videos that don't meet specs
    #[arg(long)]
    re_encode: bool,

    /// Fix preview compatibility only (remux when possible)
    #[arg(long)]
    fix_preview: bool,

    /// Find duplicate videos by perceptual hashing
    #[arg(long)]
    find_duplicates: bool,

    /// Match duplicates by normalized filename instead of frame hashes
    #[arg(long)]
    by_name: bool,

    /// Delete non-keeper duplicates and rename the survivor
    #[arg(long)]
    delete_duplicates: bool,

    /// Delete sources and install outputs under the original name
    #[arg(long)]
    replace_original: bool,

    /// Tolerate decode errors in damaged sources
    #[arg(long)]
    recover: bool,

    /// Cap outputs at 1080p
    #[arg(long)]
    downscale: bool,

    /// Stage remote files through a local download/encode/upload pipeline
    #[arg(long)]
    queue_mode: bool,

    /// Target codec for re-encoding (h264, hevc, av1)
    #[arg(long)]
    target_codec: Option<String>,

    /// Manual CRF override (otherwise derived from source quality)
    #[arg(long)]
    crf: Option<u8>,

    /// Encoder preset
    #[arg(long)]
    preset: Option<String>,

    /// Process at most this many files
    #[arg(long)]
    max_files: Option<usize>,

    /// Only re-encode these extensions (comma-separated, e.g. "wmv,avi")
    #[arg(long)]
    file_types: Option<String>,

    /// Local staging directory for queue mode
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(long, default_value = "videosentinel.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if !args.directory.is_dir() {
        eprintln!("Error: '{}' is not a directory", args.directory.display());
        return ExitCode::FAILURE;
    }

    let mut config = if args.config.exists() {
        match Config::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    };

    // Command line flags override the config file.
    if let Some(codec) = &args.target_codec {
        config.encoding.target_codec = codec.to_lowercase();
    }
    if let Some(preset) = &args.preset {
        config.encoding.preset = preset.clone();
    }
    if args.crf.is_some() {
        config.encoding.crf = args.crf;
    }
    if args.downscale {
        config.encoding.downscale = true;
    }
    if args.recover {
        config.encoding.recover = true;
    }
    if args.temp_dir.is_some() {
        config.queue.temp_dir = args.temp_dir.clone();
    }
    if args.recursive {
        config.scan.recursive = true;
    }
    if let Some(types) = &args.file_types {
        config.scan.file_types = Some(
            types
                .split(',')
                .map(|t| t.trim().trim_start_matches('.').to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        );
    }

    let Some(target) = TargetCodec::parse(&config.encoding.target_codec) else {
        eprintln!("Error: unknown target codec '{}'", config.encoding.target_codec);
        return ExitCode::FAILURE;
    };

    if !encoder::check_ffmpeg_available() {
        eprintln!("Error: ffmpeg is not installed or not in PATH");
        return ExitCode::FAILURE;
    }

    // Cooperative shutdown: press 'q' + Enter to stop after the current file.
    let shutdown = ShutdownFlag::new();
    start_quit_listener(shutdown.clone());

    println!("Scanning {}...", args.directory.display());
    let files = scan::find_videos(&args.directory, config.scan.recursive);
    if files.is_empty() {
        println!("No video files found.");
        return ExitCode::SUCCESS;
    }
    println!("Found {} video files", files.len());

    // Default action when none was requested.
    let check_specs = args.check_specs || args.re_encode || args.fix_preview || args.queue_mode
        || !(args.find_duplicates || args.by_name);

    let mut status = ExitCode::SUCCESS;

    if check_specs {
        let outcome = if args.queue_mode {
            run_queue_mode(&args, &config, target, &files, &shutdown)
        } else {
            run_batch(&args, &config, target, &files, &shutdown)
        };
        if outcome.is_err() {
            status = ExitCode::FAILURE;
        }
    }

    if (args.find_duplicates || args.by_name) && !shutdown.is_stopped() {
        run_duplicates(&args, &config, &files);
    }

    if shutdown.is_stopped() {
        println!("Stopped by request; remaining files were left untouched.");
    }

    status
}

/// Background thread that flips the shutdown flag when 'q' is entered.
fn start_quit_listener(shutdown: ShutdownFlag) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().eq_ignore_ascii_case("q") {
                println!("Shutdown requested, finishing current file...");
                shutdown.request_stop();
                break;
            }
        }
    });
}

/// Progress sink rendering one indicatif bar per encode.
struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {wide_bar} {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }
}

impl ProgressSink for BarSink {
    fn update(&self, update: &ProgressUpdate) {
        if let Some(percent) = update.percent {
            self.bar.set_position(percent as u64);
        }

        let mut msg = String::new();
        if let Some(fps) = update.fps {
            msg.push_str(&format!("{:.0} fps ", fps));
        }
        if let Some(speed) = update.speed {
            msg.push_str(&format!("{:.1}x ", speed));
        }
        if let Some(eta) = update.eta_secs {
            msg.push_str(&format!("ETA {:.0}s", eta));
        }
        self.bar.set_message(msg);
    }
}

fn batch_options(args: &Args, config: &Config, target: TargetCodec) -> BatchOptions {
    BatchOptions {
        target,
        preset: config.encoding.preset.clone(),
        crf_override: config.encoding.crf,
        replace_original: args.replace_original,
        downscale: config.encoding.downscale,
        recover: config.encoding.recover,
        fix_preview_only: args.fix_preview,
        max_files: args.max_files,
        file_types: config.scan.file_types.clone(),
        output_dir: None,
    }
}

fn open_probe_cache(config: &Config) -> Option<ProbeCache> {
    let dir = config
        .queue
        .temp_dir
        .clone()
        .unwrap_or_else(pipeline::default_temp_dir)
        .join("probe_cache");

    match ProbeCache::open(dir) {
        Ok(cache) => Some(cache),
        Err(e) => {
            eprintln!("Warning: probe cache unavailable: {}", e);
            None
        }
    }
}

/// Check-specs / re-encode / fix-preview over local files.
fn run_batch(
    args: &Args,
    config: &Config,
    target: TargetCodec,
    files: &[PathBuf],
    shutdown: &ShutdownFlag,
) -> Result<(), ()> {
    let check_only = !args.re_encode && !args.fix_preview;

    let mut options = batch_options(args, config, target);
    if check_only {
        // Pure spec check: classify but process nothing.
        options.max_files = Some(0);
    }

    let controller = BatchController::new(options, shutdown.clone(), open_probe_cache(config));
    let sink = BarSink::new();
    let report = controller.run(files, &sink);
    sink.bar.finish_and_clear();

    if check_only {
        let non_compliant = report.unprocessed();
        for (path, outcome) in &report.results {
            match outcome {
                FileOutcome::Unprocessed => println!("  not compliant: {}", path.display()),
                FileOutcome::ProbeFailed(reason) => {
                    println!("  unreadable {}: {}", path.display(), reason)
                }
                FileOutcome::Compliant if args.verbose => {
                    println!("  ok {}", path.display())
                }
                _ => {}
            }
        }
        println!(
            "Summary: {} compliant, {} non-compliant (use --re-encode to fix)",
            report.compliant(),
            non_compliant
        );
        return Ok(());
    }

    for (path, outcome) in &report.results {
        match outcome {
            FileOutcome::Compliant => {
                if args.verbose {
                    println!("  ok {}", path.display());
                }
            }
            FileOutcome::Encoded { output, replaced } => {
                println!("  encoded {} -> {}{}", path.display(), output.display(), replace_note(*replaced));
            }
            FileOutcome::Remuxed { output, replaced } => {
                println!("  remuxed {} -> {}{}", path.display(), output.display(), replace_note(*replaced));
            }
            FileOutcome::ResumedExisting { output, replaced } => {
                println!("  resumed {} -> {}{}", path.display(), output.display(), replace_note(*replaced));
            }
            FileOutcome::AlreadyReplaced { output } => {
                println!("  already replaced: {}", output.display());
            }
            FileOutcome::ProbeFailed(reason) => {
                println!("  unreadable {}: {}", path.display(), reason);
            }
            FileOutcome::Failed(reason) => {
                println!("  FAILED {}: {}", path.display(), reason);
            }
            FileOutcome::FilteredOut | FileOutcome::Unprocessed => {}
        }
    }

    println!(
        "Summary: {} compliant, {} completed, {} failed, {} unprocessed",
        report.compliant(),
        report.completed(),
        report.failed(),
        report.unprocessed()
    );

    if report.failed() > 0 {
        Err(())
    } else {
        Ok(())
    }
}

fn replace_note(replaced: bool) -> &'static str {
    if replaced {
        " (original replaced)"
    } else {
        ""
    }
}

/// Queue mode: classify files, then pipeline the non-compliant ones through
/// local staging.
fn run_queue_mode(
    args: &Args,
    config: &Config,
    target: TargetCodec,
    files: &[PathBuf],
    shutdown: &ShutdownFlag,
) -> Result<(), ()> {
    let pipeline_config = pipeline::PipelineConfig {
        temp_dir: config
            .queue
            .temp_dir
            .clone()
            .unwrap_or_else(pipeline::default_temp_dir),
        buffer_size: config.queue.buffer_size,
        max_temp_bytes: (config.queue.max_temp_size_gb * (1u64 << 30) as f64) as u64,
        replace_original: args.replace_original,
    };

    let queue = match pipeline::NetworkPipeline::new(pipeline_config, shutdown.clone()) {
        Ok(queue) => queue,
        Err(e) => {
            eprintln!("Error: cannot create staging directory: {}", e);
            return Err(());
        }
    };

    match queue.resume() {
        Ok(true) => println!("Resumed queue state from a previous run"),
        Ok(false) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            return Err(());
        }
    }

    // Queue every non-compliant file; already-queued sources are skipped.
    let mut to_queue = Vec::new();
    for path in files {
        if shutdown.is_stopped() {
            break;
        }
        if !videosentinel_engine::batch::passes_type_filter(path, config.scan.file_types.as_deref())
        {
            continue;
        }
        let Ok(info) = probe::probe_file(path) else {
            eprintln!("Warning: cannot probe {}", path.display());
            continue;
        };
        if !info.is_probe_valid() {
            continue;
        }
        if !policy::classify(&info, target, config.encoding.crf).is_compliant() {
            to_queue.push(path.clone());
        }
        if let Some(max) = args.max_files {
            if to_queue.len() >= max {
                break;
            }
        }
    }
    queue.add_files(&to_queue);

    let progress = queue.progress();
    println!(
        "Queue: {} total ({} pending, {} failed from earlier runs)",
        progress.total, progress.pending, progress.failed
    );

    let sink = BarSink::new();
    let preset = config.encoding.preset.clone();
    let crf_override = config.encoding.crf;
    let downscale = config.encoding.downscale;
    let recover = config.encoding.recover;

    queue.run(|input, output| {
        let info = probe::probe_file(input).ok();
        let crf = crf_override.unwrap_or_else(|| {
            info.as_ref()
                .map(|i| policy::select_crf(i, target))
                .unwrap_or_else(|| policy::crf_for_bpp(None, target))
        });

        let request = encoder::EncodeRequest {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            target,
            crf,
            preset: preset.clone(),
            downscale,
            recover,
            source_info: info,
        };

        encoder::encode(&request, &sink).is_ok()
    });
    sink.bar.finish_and_clear();

    let progress = queue.progress();
    println!(
        "Queue finished: {} complete, {} failed, {} remaining",
        progress.complete,
        progress.failed,
        progress.total - progress.complete - progress.failed
    );

    if progress.failed > 0 {
        Err(())
    } else {
        Ok(())
    }
}

/// Duplicate detection, optionally deleting non-keepers.
fn run_duplicates(args: &Args, config: &Config, files: &[PathBuf]) {
    let groups = if args.by_name {
        let entries: Vec<(PathBuf, Option<f64>)> = files
            .iter()
            .map(|path| {
                let duration = probe::probe_file(path)
                    .ok()
                    .and_then(|info| info.duration_secs);
                (path.clone(), duration)
            })
            .collect();

        dupes::group_by_filename(&entries, true, config.duplicates.duration_tolerance_secs)
    } else {
        let scan = dupes::find_duplicates_perceptual(
            files,
            config.duplicates.samples,
            config.duplicates.hash_size,
            config.duplicates.threshold,
        );
        for (path, reason) in &scan.failed {
            eprintln!("Warning: could not hash {}: {}", path.display(), reason);
        }
        scan.groups
    };

    if groups.is_empty() {
        println!("No duplicate videos found.");
        return;
    }

    println!("Found {} duplicate groups:", groups.len());
    for (index, group) in groups.iter().enumerate() {
        println!("group {} ({} videos):", index, group.len());
        for path in group {
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            println!("  - {} ({:.2} MB)", path.display(), size as f64 / (1024.0 * 1024.0));
        }
    }

    if !args.delete_duplicates {
        return;
    }

    for group in &groups {
        let members: Vec<(PathBuf, MediaInfo)> = group
            .iter()
            .filter_map(|path| probe::probe_file(path).ok().map(|info| (path.clone(), info)))
            .collect();

        let Some(resolved) = dupes::resolve_group(members) else {
            continue;
        };

        for path in &resolved.members {
            if *path == resolved.keeper {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => println!("  deleted {}", path.display()),
                Err(e) => eprintln!("Warning: could not delete {}: {}", path.display(), e),
            }
        }

        let keeper = &resolved.keeper;
        match dupes::cleanup_keeper_name(keeper) {
            Ok(Some(renamed)) => println!("  kept {} (renamed to {})", keeper.display(), renamed.display()),
            Ok(None) => println!("  kept {}", keeper.display()),
            Err(e) => eprintln!("Warning: could not rename {}: {}", keeper.display(), e),
        }
    }
}
