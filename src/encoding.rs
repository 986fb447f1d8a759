use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use crate::ffmpeg::{concat_quote, Ffmpeg};
use crate::ledger::FrameOrderLedger;
use crate::progress::ChunkRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl OutputMode {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => ".mp4",
            Self::Mkv => ".mkv",
            Self::Webm => ".webm",
            Self::Mov => ".mov",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "m4v" => Some(Self::Mp4),
            "mkv" => Some(Self::Mkv),
            "webm" => Some(Self::Webm),
            "mov" => Some(Self::Mov),
            _ => None,
        }
    }

    pub fn codec_args(self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Mp4 | Self::Mkv => &[
                "-c:v", "libx264", "-preset", "medium", "-crf", "18", "-pix_fmt", "yuv420p",
            ],
            Self::Webm => &[
                "-c:v",
                "libvpx-vp9",
                "-crf",
                "24",
                "-b:v",
                "0",
                "-pix_fmt",
                "yuv420p",
            ],
            Self::Mov => &[
                "-c:v",
                "prores_ks",
                "-profile:v",
                "2",
                "-pix_fmt",
                "yuv422p10le",
            ],
        };
        args.iter().map(|arg| (*arg).to_owned()).collect()
    }
}

/// One committed chunk: a sequential index, its ledger range and its file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub first: usize,
    pub last: usize,
    pub path: PathBuf,
}

impl Chunk {
    pub fn frame_count(&self) -> usize {
        self.last - self.first + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub index: usize,
    pub output_path: PathBuf,
    pub output_mode: OutputMode,
    pub start_line: usize,
    pub frame_count: usize,
}

impl ChunkRequest {
    pub fn new(index: usize, range: ChunkRange, chunks_dir: &Path, output_mode: OutputMode) -> Self {
        Self {
            index,
            output_path: chunk_output_path(chunks_dir, index, output_mode),
            output_mode,
            start_line: range.first,
            frame_count: range.len(),
        }
    }

    pub fn range(&self) -> ChunkRange {
        ChunkRange {
            first: self.start_line,
            last: self.start_line + self.frame_count - 1,
        }
    }
}

pub fn chunk_output_path(chunks_dir: &Path, index: usize, output_mode: OutputMode) -> PathBuf {
    chunks_dir.join(format!("{index:04}{}", output_mode.extension()))
}

/// Where a chunk is written before it is complete: `0007.mkv` -> `0007.tmp.mkv`.
/// The stem is not numeric, so merges never list it.
pub fn chunk_writing_path(output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = output_path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    output_path.with_file_name(format!("{stem}.tmp{ext}"))
}

/// Writes one chunk file covering `frame_count` ledger entries from
/// `start_line`. Any error is fatal to the pipeline.
pub trait ChunkEncoder {
    fn encode_chunk(&mut self, ledger: &FrameOrderLedger, request: &ChunkRequest) -> Result<()>;
}

pub struct FfmpegChunkEncoder {
    ffmpeg: Ffmpeg,
    frames_dir: PathBuf,
    temp_dir: PathBuf,
    fps: f64,
}

impl FfmpegChunkEncoder {
    pub fn new(ffmpeg: Ffmpeg, frames_dir: &Path, temp_dir: &Path, fps: f64) -> Result<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            bail!("output fps must be a positive number, got {fps}");
        }
        Ok(Self {
            ffmpeg,
            frames_dir: frames_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            fps,
        })
    }

    pub fn frame_list(&self, ledger: &FrameOrderLedger, request: &ChunkRequest) -> Result<String> {
        let frame_duration = 1.0 / self.fps;
        let mut list = String::new();
        for index in request.range().indices() {
            let filename = ledger
                .filename(index)
                .with_context(|| format!("ledger has no entry at line {index}"))?;
            let path = absolute(&self.frames_dir.join(filename));
            list.push_str(&format!("file {}\n", concat_quote(&path)));
            list.push_str(&format!("duration {frame_duration:.6}\n"));
        }
        Ok(list)
    }

    pub fn ffmpeg_args(
        &self,
        list_path: &Path,
        request: &ChunkRequest,
        writing_path: &Path,
    ) -> Vec<String> {
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
            "-an".to_owned(),
        ];
        args.extend(request.output_mode.codec_args());
        args.push("-r".to_owned());
        args.push(format_fps(self.fps));
        args.push(writing_path.to_string_lossy().into_owned());
        args
    }
}

impl ChunkEncoder for FfmpegChunkEncoder {
    fn encode_chunk(&mut self, ledger: &FrameOrderLedger, request: &ChunkRequest) -> Result<()> {
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create chunk dir {}", parent.display()))?;
        }
        fs::create_dir_all(&self.temp_dir)
            .with_context(|| format!("failed to create temp dir {}", self.temp_dir.display()))?;

        let list_path = self
            .temp_dir
            .join(format!("chunk-{:04}-frames.txt", request.index));
        fs::write(&list_path, self.frame_list(ledger, request)?)
            .with_context(|| format!("failed to write frame list {}", list_path.display()))?;

        let writing = chunk_writing_path(&request.output_path);
        let args = self.ffmpeg_args(&list_path, request, &writing);
        let outcome = self.ffmpeg.run(&args, &self.temp_dir);
        let _ = fs::remove_file(&list_path);
        if let Err(error) = outcome {
            let _ = fs::remove_file(&writing);
            return Err(error);
        }

        if !writing.is_file() {
            bail!(
                "ffmpeg reported success but chunk {} was not written",
                writing.display()
            );
        }
        fs::rename(&writing, &request.output_path).with_context(|| {
            format!(
                "failed to move chunk into {}",
                request.output_path.display()
            )
        })?;
        Ok(())
    }
}

fn format_fps(fps: f64) -> String {
    let text = format!("{fps:.3}");
    text.trim_end_matches('0').trim_end_matches('.').to_owned()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
