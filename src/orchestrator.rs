use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::Serialize;

use crate::backpressure::BackpressureController;
use crate::chunk_size::ChunkSizeConfig;
use crate::config::{AutoEncConfig, Timing};
use crate::encoding::{Chunk, ChunkEncoder, ChunkRequest, OutputMode};
use crate::error::PipelineError;
use crate::ledger::FrameOrderLedger;
use crate::muxer::{BackupMerger, ChunkMuxer, MergeRequest};
use crate::producer::{DirectoryProgress, Producer};
use crate::progress::{ChunkRange, ProducerSnapshot, ProgressTracker};
use crate::reclaim::FrameReclaimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Waiting,
    Running,
    Paused,
    Draining,
    Finalizing,
    Completed,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub frames_dir: PathBuf,
    pub frames_ext: String,
    pub manifest_path: PathBuf,
    pub chunks_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub output_path: PathBuf,
    pub output_mode: OutputMode,
    pub sizes: ChunkSizeConfig,
    pub config: AutoEncConfig,
    pub timing: Timing,
}

impl PipelineSettings {
    fn merge_request(&self) -> MergeRequest {
        MergeRequest {
            temp_dir: self.temp_dir.clone(),
            chunks_dir: self.chunks_dir.clone(),
            output_path: self.output_path.clone(),
            backup: false,
        }
    }
}

#[derive(Debug, Default)]
struct ControlFlags {
    paused: AtomicBool,
    canceled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Operator handle for a running pipeline. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct PipelineControl {
    inner: Arc<ControlFlags>,
}

impl PipelineControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// The first reason given wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = match self.inner.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub fn cancel_reason(&self) -> String {
        let guard = match self.inner.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().unwrap_or_else(|| "canceled".to_owned())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: PipelineState,
    pub states: Vec<PipelineState>,
    pub chunk_size: usize,
    pub safety_buffer_frames: usize,
    pub total_frames: usize,
    pub encoded_frames: usize,
    pub chunks: Vec<Chunk>,
    pub backup_merges_started: usize,
    pub backup_merges_skipped: usize,
    pub output_path: PathBuf,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub elapsed_ms: u128,
}

enum Tick {
    Continue,
    Retry,
    Done,
}

pub struct Orchestrator {
    settings: PipelineSettings,
    producer: Box<dyn Producer>,
    encoder: Box<dyn ChunkEncoder>,
    muxer: Arc<dyn ChunkMuxer>,
    tracker: ProgressTracker,
    backpressure: BackpressureController,
    ledger: Arc<FrameOrderLedger>,
    cursor: usize,
    chunks: Vec<Chunk>,
    states: Vec<PipelineState>,
    missing_after_exit: u32,
    reclaimer: Option<FrameReclaimer>,
    backup: Option<BackupMerger>,
    started_at: DateTime<Local>,
    started: Instant,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        producer: Box<dyn Producer>,
        encoder: Box<dyn ChunkEncoder>,
        muxer: Arc<dyn ChunkMuxer>,
    ) -> Self {
        let tracker = ProgressTracker::new(settings.frames_dir.clone());
        let backpressure = BackpressureController::new(
            settings.config.backpressure_enabled(),
            settings.sizes.backpressure_threshold(),
        );
        Self {
            settings,
            producer,
            encoder,
            muxer,
            tracker,
            backpressure,
            ledger: Arc::new(FrameOrderLedger::default()),
            cursor: 0,
            chunks: Vec::new(),
            states: Vec::new(),
            missing_after_exit: 0,
            reclaimer: None,
            backup: None,
            started_at: Local::now(),
            started: Instant::now(),
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn state(&self) -> Option<PipelineState> {
        self.states.last().copied()
    }

    pub fn summary(&self) -> RunSummary {
        let backup_started = self.backup.as_ref().map_or(0, BackupMerger::started);
        let backup_skipped = self.backup.as_ref().map_or(0, BackupMerger::skipped);
        RunSummary {
            state: self.state().unwrap_or(PipelineState::Waiting),
            states: self.states.clone(),
            chunk_size: self.settings.sizes.chunk_size,
            safety_buffer_frames: self.settings.sizes.safety_buffer_frames,
            total_frames: self.ledger.len(),
            encoded_frames: self.chunks.iter().map(Chunk::frame_count).sum(),
            chunks: self.chunks.clone(),
            backup_merges_started: backup_started,
            backup_merges_skipped: backup_skipped,
            output_path: self.settings.output_path.clone(),
            started_at: self.started_at,
            finished_at: Local::now(),
            elapsed_ms: self.started.elapsed().as_millis(),
        }
    }

    /// Drives the pipeline to completion. Cancellation surfaces as
    /// `PipelineError::Canceled`; pending frames are not flushed and
    /// background work is not awaited. A fatal encode failure also cancels
    /// the run, so it ends in `Canceled` too.
    pub fn run(&mut self, control: &PipelineControl) -> Result<RunSummary> {
        self.started_at = Local::now();
        self.started = Instant::now();

        let outcome = self.run_stages(control);
        if let Err(error) = self.backpressure.release(self.producer.as_mut()) {
            warn!("[autoenc] failed to resume producer: {error:#}");
        }
        match outcome {
            Ok(()) => Ok(self.summary()),
            Err(error) => {
                let canceled = matches!(
                    error.downcast_ref::<PipelineError>(),
                    Some(PipelineError::Canceled { .. })
                );
                if canceled || control.is_canceled() {
                    self.enter(PipelineState::Canceled);
                }
                Err(error)
            }
        }
    }

    fn run_stages(&mut self, control: &PipelineControl) -> Result<()> {
        self.wait_for_frames(control)?;
        self.load_ledger()?;
        self.prepare_background_work();

        info!(
            "[autoenc] starting - chunk size: {} frames - safety buffer: {} frames - {} ledger entries",
            self.settings.sizes.chunk_size,
            self.settings.sizes.safety_buffer_frames,
            self.ledger.len()
        );

        self.enter(PipelineState::Running);
        loop {
            self.check_canceled(control)?;
            if control.is_paused() {
                self.enter(PipelineState::Paused);
                self.sleep(self.settings.timing.paused_tick);
                continue;
            }

            match self.tick(control)? {
                Tick::Done => break,
                Tick::Retry => self.sleep(self.settings.timing.missing_frame_retry),
                Tick::Continue => self.sleep(self.settings.timing.tick),
            }
            self.check_canceled(control)?;
        }

        self.finalize(control)
    }

    fn wait_for_frames(&mut self, control: &PipelineControl) -> Result<()> {
        self.enter(PipelineState::Waiting);
        let frames = DirectoryProgress::new(&self.settings.frames_dir, &self.settings.frames_ext);
        loop {
            self.check_canceled(control)?;
            let manifest_ready = fs::metadata(&self.settings.manifest_path)
                .map(|meta| meta.len() > 0)
                .unwrap_or(false);
            let exited = self.producer.has_exited()?;
            if manifest_ready && (exited || frames.frame_count()? >= 2) {
                return Ok(());
            }
            if exited && !manifest_ready {
                // Nothing more will be written; let the loader report it.
                return Ok(());
            }
            self.sleep(self.settings.timing.waiting_poll);
        }
    }

    fn load_ledger(&mut self) -> Result<()> {
        let ledger = FrameOrderLedger::load(&self.settings.manifest_path)?;
        if ledger.is_empty() {
            bail!(
                "frame order manifest {} lists no frames",
                self.settings.manifest_path.display()
            );
        }
        self.ledger = Arc::new(ledger);
        self.cursor = 0;
        self.chunks.clear();
        self.missing_after_exit = 0;
        Ok(())
    }

    fn prepare_background_work(&mut self) {
        let config = &self.settings.config;
        self.reclaimer = config.reclaim_enabled().then(|| {
            FrameReclaimer::new(
                Arc::clone(&self.ledger),
                self.settings.frames_dir.clone(),
                config.reclaim_strategy,
            )
        });
        self.backup = config.backup_merge_enabled().then(|| {
            BackupMerger::new(Arc::clone(&self.muxer), self.settings.merge_request())
        });
    }

    fn tick(&mut self, control: &PipelineControl) -> Result<Tick> {
        let running = !self.producer.has_exited()?;
        if !running && self.cursor >= self.ledger.len() {
            return Ok(Tick::Done);
        }
        self.enter(if running {
            PipelineState::Running
        } else {
            PipelineState::Draining
        });

        let snapshot = ProducerSnapshot {
            running,
            last_frame: if running {
                self.producer.last_frame()?
            } else {
                None
            },
        };
        let window = self
            .tracker
            .pending_window(&self.ledger, self.cursor, snapshot);
        if self.settings.config.debug {
            debug!(
                "[autoenc] tick - producer running: {running} - last frame: {:?} - cursor: {} - pending: {} - ledger: {}",
                snapshot.last_frame,
                self.cursor,
                window.len(),
                self.ledger.len()
            );
        }

        if running {
            self.backpressure
                .update(window.len(), self.producer.as_mut())?;
        }

        let Some(range) = self
            .tracker
            .next_range(window, &self.settings.sizes, running)
        else {
            return Ok(Tick::Continue);
        };

        if !self.tracker.frame_exists(&self.ledger, range.last) {
            let path = self
                .tracker
                .frame_path(&self.ledger, range.last)
                .unwrap_or_default();
            if !running {
                self.missing_after_exit += 1;
                if self.missing_after_exit > self.settings.timing.missing_frame_retries_after_exit {
                    return Err(PipelineError::MissingFrameFile { path }.into());
                }
            }
            if self.settings.config.debug {
                debug!(
                    "[autoenc] last frame of chunk doesn't exist; skipping tick ({})",
                    path.display()
                );
            }
            return Ok(Tick::Retry);
        }
        self.missing_after_exit = 0;

        self.encode(range, running, control)?;
        Ok(Tick::Continue)
    }

    fn encode(&mut self, range: ChunkRange, running: bool, control: &PipelineControl) -> Result<()> {
        let index = self.chunks.len() + 1;
        let request = ChunkRequest::new(
            index,
            range,
            &self.settings.chunks_dir,
            self.settings.output_mode,
        );
        info!(
            "[autoenc] encoding chunk #{index} to '{}' using line {} ({}) through {} ({})",
            request.output_path.display(),
            range.first,
            self.ledger.filename(range.first).unwrap_or_default(),
            range.last,
            self.ledger.filename(range.last).unwrap_or_default()
        );

        if let Err(source) = self.encoder.encode_chunk(&self.ledger, &request) {
            control.cancel("auto-encode encountered an error");
            return Err(PipelineError::EncodeChunkFailure {
                chunk: index,
                source,
            }
            .into());
        }
        self.check_canceled(control)?;

        self.cursor = range.last + 1;
        self.chunks.push(Chunk {
            index,
            first: range.first,
            last: range.last,
            path: request.output_path,
        });
        info!("[autoenc] done encoding chunk #{index}");

        if running {
            if let Some(reclaimer) = &self.reclaimer {
                reclaimer.dispatch(range, self.settings.config.debug)?;
            }
            if let Some(backup) = self.backup.as_mut() {
                backup.request(index)?;
            }
        }
        Ok(())
    }

    fn finalize(&mut self, control: &PipelineControl) -> Result<()> {
        self.enter(PipelineState::Finalizing);
        if let Some(backup) = self.backup.as_mut() {
            backup.wait();
        }
        self.check_canceled(control)?;

        let request = self.settings.merge_request();
        info!(
            "[autoenc] merging {} chunks into {}",
            self.chunks.len(),
            request.output_path.display()
        );
        self.muxer
            .merge(&request)
            .map_err(|source| PipelineError::MergeFailure {
                output: request.output_path.clone(),
                source,
            })?;

        self.enter(PipelineState::Completed);
        Ok(())
    }

    fn check_canceled(&self, control: &PipelineControl) -> Result<()> {
        if control.is_canceled() {
            return Err(PipelineError::Canceled {
                reason: control.cancel_reason(),
            }
            .into());
        }
        Ok(())
    }

    fn enter(&mut self, state: PipelineState) {
        if self.states.last() == Some(&state) {
            return;
        }
        if self.settings.config.debug {
            debug!("[autoenc] state -> {state:?}");
        }
        self.states.push(state);
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineControl, PipelineState};

    #[test]
    fn control_keeps_first_cancel_reason() {
        let control = PipelineControl::new();
        let observer = control.clone();
        assert!(!observer.is_canceled());

        control.cancel("operator request");
        control.cancel("second reason");
        assert!(observer.is_canceled());
        assert_eq!(observer.cancel_reason(), "operator request");
    }

    #[test]
    fn pause_is_shared_between_clones() {
        let control = PipelineControl::new();
        let observer = control.clone();
        control.pause();
        assert!(observer.is_paused());
        observer.resume();
        assert!(!control.is_paused());
    }

    #[test]
    fn states_serialize_in_snake_case() {
        let json = serde_json::to_string(&[PipelineState::Draining, PipelineState::Completed])
            .expect("states should serialize");
        assert_eq!(json, r#"["draining","completed"]"#);
    }
}
