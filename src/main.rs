use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use serde::Serialize;

use autoenc::chunk_size::{target_frame_count, BackendFamily, ChunkSizeConfig};
use autoenc::config::{AutoEncConfig, AutoEncMode, Timing};
use autoenc::encoding::{FfmpegChunkEncoder, OutputMode};
use autoenc::error::{envelope_for, find_pipeline_error, ErrorEnvelope, ErrorEnvelopeBody};
use autoenc::ffmpeg::{Ffmpeg, FfmpegMode};
use autoenc::ledger::FrameOrderLedger;
use autoenc::muxer::{list_chunk_files, FfmpegChunkMuxer};
use autoenc::orchestrator::{Orchestrator, PipelineControl, PipelineSettings, RunSummary};
use autoenc::producer::{ChildProducer, DirectoryProgress, FinishedProducer, PidProducer, Producer};

const USAGE_EXIT_CODE: u8 = 2;
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "autoenc", version)]
#[command(about = "Encode a frame sequence into video while it is still being produced")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the chunked encode pipeline against a frames directory.
    Run(RunArgs),
    /// Parse a frame order manifest and print the chunk plan.
    Check(CheckArgs),
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Self::Run(args) => args.json,
            Self::Check(args) => args.json,
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long = "frames-dir")]
    frames_dir: PathBuf,
    #[arg(long)]
    manifest: PathBuf,
    #[arg(short = 'o', long = "output")]
    output: PathBuf,
    #[arg(long = "chunks-dir")]
    chunks_dir: Option<PathBuf>,
    #[arg(long = "temp-dir")]
    temp_dir: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    backend: Option<String>,
    #[arg(long = "target-frames", conflicts_with = "input_frames")]
    target_frames: Option<usize>,
    #[arg(long = "input-frames", requires = "factor")]
    input_frames: Option<PathBuf>,
    #[arg(long)]
    factor: Option<f64>,
    #[arg(long, default_value_t = 30.0)]
    fps: f64,
    #[arg(long = "output-mode", value_enum)]
    output_mode: Option<OutputMode>,
    #[arg(long = "frames-ext", default_value = "png")]
    frames_ext: String,
    #[arg(long, value_enum, default_value_t = FfmpegMode::Auto)]
    ffmpeg: FfmpegMode,
    #[arg(long = "producer-pid", conflicts_with = "producer_cmd")]
    producer_pid: Option<u32>,
    #[arg(long = "pause-file")]
    pause_file: Option<PathBuf>,
    #[arg(long = "cancel-file")]
    cancel_file: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[arg(short = 'v', long)]
    verbose: bool,
    /// Producer command to spawn, given after `--`.
    #[arg(last = true)]
    producer_cmd: Vec<String>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    manifest: PathBuf,
    #[arg(long = "target-frames")]
    target_frames: Option<usize>,
    #[arg(long)]
    backend: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

#[derive(Debug, Serialize)]
struct CheckReport {
    ok: bool,
    manifest: PathBuf,
    entries: usize,
    distinct_files: usize,
    backend: BackendFamily,
    chunk_size: usize,
    safety_buffer_frames: usize,
    encode_trigger: usize,
    backpressure_threshold: usize,
    planned_chunks: usize,
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    ok: bool,
    #[serde(flatten)]
    summary: &'a RunSummary,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.command.json();
    let outcome = match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Check(args) => run_check(&args),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => report_failure(&error, json),
    }
}

fn report_failure(error: &anyhow::Error, json: bool) -> ExitCode {
    let usage = error.downcast_ref::<UsageError>().is_some();
    if json {
        let envelope = if usage {
            ErrorEnvelope {
                ok: false,
                error: ErrorEnvelopeBody {
                    code: "usage_error".to_owned(),
                    message: format!("{error:#}"),
                },
            }
        } else {
            envelope_for(error)
        };
        match serde_json::to_string_pretty(&envelope) {
            Ok(text) => println!("{text}"),
            Err(_) => eprintln!("error: {error:#}"),
        }
    } else {
        eprintln!("error: {error:#}");
    }

    if usage {
        return ExitCode::from(USAGE_EXIT_CODE);
    }
    let code = find_pipeline_error(error).map_or(1, |pipeline| pipeline.exit_code());
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn init_logging(debug: bool) {
    let default_level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .format_target(false)
        .init();
}

fn run_check(args: &CheckArgs) -> Result<()> {
    let config = AutoEncConfig::load_or_default(args.config.as_deref())?;
    let ledger = FrameOrderLedger::load(&args.manifest)?;
    let backend = BackendFamily::from_name(args.backend.as_deref().unwrap_or_default());
    let target = args.target_frames.unwrap_or(ledger.len());
    let sizes = ChunkSizeConfig::derive(target, backend, &config.chunk_safety_buffer);

    let report = CheckReport {
        ok: true,
        manifest: args.manifest.clone(),
        entries: ledger.len(),
        distinct_files: ledger.distinct_files(),
        backend,
        chunk_size: sizes.chunk_size,
        safety_buffer_frames: sizes.safety_buffer_frames,
        encode_trigger: sizes.encode_trigger(),
        backpressure_threshold: sizes.backpressure_threshold(),
        planned_chunks: ledger.len().div_ceil(sizes.chunk_size),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "OK: {} ({} entries, {} distinct files)",
        report.manifest.display(),
        report.entries,
        report.distinct_files
    );
    println!(
        "Chunk size: {} frames, safety buffer: {} frames ({:?})",
        report.chunk_size, report.safety_buffer_frames, report.backend
    );
    println!(
        "Encode trigger: {} pending frames, backpressure threshold: {}",
        report.encode_trigger, report.backpressure_threshold
    );
    println!("Planned chunks: {}", report.planned_chunks);
    Ok(())
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let config = AutoEncConfig::load_or_default(args.config.as_deref())?;
    if config.auto_enc_mode == AutoEncMode::Off {
        return Err(UsageError(
            "auto-encode is disabled (autoEncMode: 0); enable mode 1 or 2 to run the pipeline"
                .to_owned(),
        )
        .into());
    }
    init_logging(args.verbose || config.debug);
    info!(
        "[autoenc] autoenc {} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("AUTOENC_GIT_HASH").unwrap_or("unknown build")
    );

    let backend = BackendFamily::from_name(args.backend.as_deref().unwrap_or_default());
    let target = resolve_target_frames(&args)?;
    let sizes = ChunkSizeConfig::derive(target, backend, &config.chunk_safety_buffer);

    let chunks_dir = args
        .chunks_dir
        .clone()
        .unwrap_or_else(|| sibling_dir(&args.frames_dir, "chunks"));
    let temp_dir = args
        .temp_dir
        .clone()
        .unwrap_or_else(|| sibling_dir(&args.frames_dir, "autoenc-temp"));
    prepare_dirs(&chunks_dir, &temp_dir)?;

    let output_mode = args
        .output_mode
        .or_else(|| OutputMode::from_path(&args.output))
        .unwrap_or(OutputMode::Mp4);
    let ffmpeg = Ffmpeg::resolve(args.ffmpeg)?;
    let encoder = FfmpegChunkEncoder::new(ffmpeg.clone(), &args.frames_dir, &temp_dir, args.fps)?;
    let muxer = FfmpegChunkMuxer::new(ffmpeg);
    let producer = build_producer(&args)?;

    let settings = PipelineSettings {
        frames_dir: args.frames_dir.clone(),
        frames_ext: args.frames_ext.clone(),
        manifest_path: args.manifest.clone(),
        chunks_dir,
        temp_dir,
        output_path: args.output.clone(),
        output_mode,
        sizes,
        config,
        timing: Timing::default(),
    };

    let control = PipelineControl::new();
    let watcher = spawn_control_watcher(&control, args.pause_file.clone(), args.cancel_file.clone())?;

    let mut orchestrator = Orchestrator::new(settings, producer, Box::new(encoder), Arc::new(muxer));
    let outcome = orchestrator.run(&control);
    if let Some(watcher) = watcher {
        watcher.stop();
    }

    let summary = outcome.inspect_err(|error| {
        error!("[autoenc] stopped after {} chunks: {error:#}", orchestrator.chunks().len());
    })?;

    if args.json {
        let report = RunReport {
            ok: true,
            summary: &summary,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Wrote {} ({} chunks, {} frames, {:.1}s)",
            summary.output_path.display(),
            summary.chunks.len(),
            summary.encoded_frames,
            summary.elapsed_ms as f64 / 1000.0
        );
    }
    Ok(())
}

fn resolve_target_frames(args: &RunArgs) -> Result<usize> {
    if let Some(target) = args.target_frames {
        return Ok(target);
    }
    if let (Some(dir), Some(factor)) = (&args.input_frames, args.factor) {
        let input = count_files(dir)?;
        return Ok(target_frame_count(input, factor));
    }
    // Without a hint, size chunks from whatever the manifest already lists.
    match FrameOrderLedger::load(&args.manifest) {
        Ok(ledger) if !ledger.is_empty() => Ok(ledger.len()),
        _ => {
            warn!(
                "[autoenc] no frame count hint and manifest {} lists no frames yet; using the smallest chunk size. Pass --target-frames or --input-frames/--factor for large jobs.",
                args.manifest.display()
            );
            Ok(0)
        }
    }
}

fn count_files(dir: &Path) -> Result<usize> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read input frames dir {}", dir.display()))?;
    let mut count = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if entry.path().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

fn sibling_dir(frames_dir: &Path, name: &str) -> PathBuf {
    match frames_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

fn prepare_dirs(chunks_dir: &Path, temp_dir: &Path) -> Result<()> {
    fs::create_dir_all(chunks_dir)
        .with_context(|| format!("failed to create chunks dir {}", chunks_dir.display()))?;
    fs::create_dir_all(temp_dir)
        .with_context(|| format!("failed to create temp dir {}", temp_dir.display()))?;
    if !list_chunk_files(chunks_dir)?.is_empty() {
        bail!(
            "chunks dir {} already contains chunk files; remove them or pass another --chunks-dir",
            chunks_dir.display()
        );
    }
    Ok(())
}

fn build_producer(args: &RunArgs) -> Result<Box<dyn Producer>> {
    let progress = DirectoryProgress::new(&args.frames_dir, &args.frames_ext);
    if !args.producer_cmd.is_empty() {
        let child = ChildProducer::spawn(&args.producer_cmd, progress)?;
        info!("[autoenc] producer started with pid {}", child.pid());
        return Ok(Box::new(child));
    }
    if let Some(pid) = args.producer_pid {
        return Ok(Box::new(PidProducer::attach(pid, progress)?));
    }
    info!("[autoenc] no producer given; encoding the frames already on disk");
    Ok(Box::new(FinishedProducer))
}

struct ControlWatcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ControlWatcher {
    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

/// Mirrors the pause and cancel marker files onto `control`.
fn spawn_control_watcher(
    control: &PipelineControl,
    pause_file: Option<PathBuf>,
    cancel_file: Option<PathBuf>,
) -> Result<Option<ControlWatcher>> {
    if pause_file.is_none() && cancel_file.is_none() {
        return Ok(None);
    }
    let control = control.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name("autoenc-control".to_owned())
        .spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                if let Some(path) = &cancel_file {
                    if path.exists() && !control.is_canceled() {
                        info!("[autoenc] cancel file {} found", path.display());
                        control.cancel(format!("cancel file {} created", path.display()));
                    }
                }
                if let Some(path) = &pause_file {
                    let paused = path.exists();
                    if paused != control.is_paused() {
                        info!("[autoenc] {}", if paused { "paused" } else { "resumed" });
                        if paused {
                            control.pause();
                        } else {
                            control.resume();
                        }
                    }
                }
                thread::sleep(WATCH_INTERVAL);
            }
        })
        .context("failed to spawn control watcher thread")?;
    Ok(Some(ControlWatcher { stop, handle }))
}
