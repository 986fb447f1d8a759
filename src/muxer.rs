use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

use crate::ffmpeg::{concat_quote, Ffmpeg};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub temp_dir: PathBuf,
    pub chunks_dir: PathBuf,
    pub output_path: PathBuf,
    /// Best-effort partial merge while chunks are still being produced.
    pub backup: bool,
}

impl MergeRequest {
    pub fn as_backup(&self) -> Self {
        Self {
            backup: true,
            ..self.clone()
        }
    }
}

/// Concatenates the chunk files currently in `chunks_dir` into one video.
pub trait ChunkMuxer: Send + Sync {
    fn merge(&self, request: &MergeRequest) -> Result<()>;
}

pub struct FfmpegChunkMuxer {
    ffmpeg: Ffmpeg,
}

impl FfmpegChunkMuxer {
    pub fn new(ffmpeg: Ffmpeg) -> Self {
        Self { ffmpeg }
    }

    pub fn concat_args(list_path: &Path, output_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_owned(),
            "-loglevel".to_owned(),
            "error".to_owned(),
            "-y".to_owned(),
            "-f".to_owned(),
            "concat".to_owned(),
            "-safe".to_owned(),
            "0".to_owned(),
            "-i".to_owned(),
            list_path.to_string_lossy().into_owned(),
            "-c".to_owned(),
            "copy".to_owned(),
            "-fflags".to_owned(),
            "+genpts".to_owned(),
        ];
        args.extend(container_output_args(output_path));
        args.push(output_path.to_string_lossy().into_owned());
        args
    }
}

impl ChunkMuxer for FfmpegChunkMuxer {
    fn merge(&self, request: &MergeRequest) -> Result<()> {
        let chunks = list_chunk_files(&request.chunks_dir)?;
        if chunks.is_empty() {
            bail!("no chunk files found in {}", request.chunks_dir.display());
        }

        fs::create_dir_all(&request.temp_dir).with_context(|| {
            format!("failed to create temp dir {}", request.temp_dir.display())
        })?;
        let list_name = if request.backup {
            "chunks-backup.txt"
        } else {
            "chunks.txt"
        };
        let list_path = request.temp_dir.join(list_name);
        let list = chunks
            .iter()
            .map(|chunk| format!("file {}\n", concat_quote(&absolute(chunk))))
            .collect::<String>();
        fs::write(&list_path, list)
            .with_context(|| format!("failed to write chunk list {}", list_path.display()))?;

        if let Some(parent) = request.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create output dir {}", parent.display()))?;
        }

        if request.backup {
            let partial = partial_output_path(&request.output_path);
            let writing = sibling_with_suffix(&request.output_path, ".partial.tmp");
            self.ffmpeg
                .run(&Self::concat_args(&list_path, &writing), &request.temp_dir)?;
            fs::rename(&writing, &partial).with_context(|| {
                format!("failed to move backup merge into {}", partial.display())
            })?;
        } else {
            rename_existing(&request.output_path)?;
            self.ffmpeg.run(
                &Self::concat_args(&list_path, &request.output_path),
                &request.temp_dir,
            )?;
            let _ = fs::remove_file(partial_output_path(&request.output_path));
        }
        let _ = fs::remove_file(&list_path);
        Ok(())
    }
}

/// Chunk files in `chunks_dir`, ordered by their numeric index.
pub fn list_chunk_files(chunks_dir: &Path) -> Result<Vec<PathBuf>> {
    if !chunks_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(chunks_dir)
        .with_context(|| format!("failed to list chunks in {}", chunks_dir.display()))?;

    let mut chunks = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", chunks_dir.display()))?
            .path();
        let index = path
            .file_stem()
            .and_then(OsStr::to_str)
            .filter(|stem| !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|stem| stem.parse::<u64>().ok());
        if let Some(index) = index.filter(|_| path.is_file()) {
            chunks.push((index, path));
        }
    }
    chunks.sort();
    Ok(chunks.into_iter().map(|(_, path)| path).collect())
}

pub fn partial_output_path(output_path: &Path) -> PathBuf {
    sibling_with_suffix(output_path, ".partial")
}

// out.mp4 + ".partial" -> out.partial.mp4
fn sibling_with_suffix(output_path: &Path, suffix: &str) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = output_path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    output_path.with_file_name(format!("{stem}{suffix}{ext}"))
}

/// Moves an existing output aside to `<stem>.old<ext>`, numbering when taken.
fn rename_existing(output_path: &Path) -> Result<()> {
    if !output_path.exists() {
        return Ok(());
    }
    let mut target = sibling_with_suffix(output_path, ".old");
    let mut counter = 1;
    while target.exists() {
        target = sibling_with_suffix(output_path, &format!(".old{counter}"));
        counter += 1;
    }
    fs::rename(output_path, &target).with_context(|| {
        format!(
            "failed to move existing output {} to {}",
            output_path.display(),
            target.display()
        )
    })?;
    info!(
        "[autoenc] moved existing output to {}",
        target.display()
    );
    Ok(())
}

fn container_output_args(output_path: &Path) -> Vec<String> {
    let ext = output_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if matches!(ext.as_str(), "mov" | "mp4" | "m4v") {
        vec!["-movflags".to_owned(), "+faststart".to_owned()]
    } else {
        Vec::new()
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Runs backup merges on a background thread, at most one at a time. A
/// request made while a merge is in flight is skipped, not queued.
pub struct BackupMerger {
    muxer: Arc<dyn ChunkMuxer>,
    request: MergeRequest,
    in_flight: Option<JoinHandle<Result<()>>>,
    started: usize,
    skipped: usize,
}

impl BackupMerger {
    pub fn new(muxer: Arc<dyn ChunkMuxer>, request: MergeRequest) -> Self {
        Self {
            muxer,
            request: request.as_backup(),
            in_flight: None,
            started: 0,
            skipped: 0,
        }
    }

    pub fn started(&self) -> usize {
        self.started
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Returns whether a new merge was started.
    pub fn request(&mut self, after_chunk: usize) -> Result<bool> {
        if self.is_busy() {
            self.skipped += 1;
            info!(
                "[autoenc] backup merge still running; skipping backup after chunk #{after_chunk}"
            );
            return Ok(false);
        }
        self.reap();

        let muxer = Arc::clone(&self.muxer);
        let request = self.request.clone();
        let handle = thread::Builder::new()
            .name("autoenc-backup-merge".to_owned())
            .spawn(move || muxer.merge(&request))
            .context("failed to spawn backup merge thread")?;
        self.in_flight = Some(handle);
        self.started += 1;
        info!("[autoenc] started backup merge after chunk #{after_chunk}");
        Ok(true)
    }

    /// Blocks until the in-flight merge, if any, has finished.
    pub fn wait(&mut self) {
        self.reap();
    }

    fn reap(&mut self) {
        let Some(handle) = self.in_flight.take() else {
            return;
        };
        let outcome = handle
            .join()
            .unwrap_or_else(|_| Err(anyhow!("backup merge thread panicked")));
        if let Err(error) = outcome {
            warn!("[autoenc] backup merge failed: {error:#}");
        }
    }
}
