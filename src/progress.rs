use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::chunk_size::ChunkSizeConfig;
use crate::ledger::FrameOrderLedger;

/// What the producer collaborator reported at the top of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSnapshot {
    pub running: bool,
    pub last_frame: Option<u64>,
}

impl ProducerSnapshot {
    pub fn exited() -> Self {
        Self {
            running: false,
            last_frame: None,
        }
    }
}

/// Ledger positions `[start, end)` that are safe to consume this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWindow {
    pub start: usize,
    pub end: usize,
}

impl PendingWindow {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indices(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Closed ledger range `[first, last]` assigned to one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkRange {
    pub first: usize,
    pub last: usize,
}

impl ChunkRange {
    pub fn len(&self) -> usize {
        self.last - self.first + 1
    }

    pub fn indices(&self) -> Range<usize> {
        self.first..self.last + 1
    }
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    frames_dir: PathBuf,
}

impl ProgressTracker {
    pub fn new(frames_dir: impl Into<PathBuf>) -> Self {
        Self {
            frames_dir: frames_dir.into(),
        }
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    /// While the producer runs, the window stops before the first entry that
    /// names its most recent frame: that file may still be mid-write. Once it
    /// has exited every remaining entry is final.
    pub fn pending_window(
        &self,
        ledger: &FrameOrderLedger,
        cursor: usize,
        producer: ProducerSnapshot,
    ) -> PendingWindow {
        let start = cursor.min(ledger.len());
        if !producer.running {
            return PendingWindow {
                start,
                end: ledger.len(),
            };
        }

        let end = match producer.last_frame {
            None => start,
            Some(frame) => ledger
                .position_of_frame(start, frame)
                .unwrap_or(ledger.len()),
        };
        PendingWindow { start, end }
    }

    /// The range to encode this tick, if the window is ready for one. A
    /// running producer yields chunks only once `chunk_size +
    /// safety_buffer_frames` entries are pending; after exit any non-empty
    /// window is cut, so the last chunk may be undersized. Ranges never
    /// exceed `chunk_size`.
    pub fn next_range(
        &self,
        window: PendingWindow,
        sizes: &ChunkSizeConfig,
        producer_running: bool,
    ) -> Option<ChunkRange> {
        if window.is_empty() {
            return None;
        }
        if producer_running && window.len() < sizes.encode_trigger() {
            return None;
        }
        let count = sizes.chunk_size.max(1).min(window.len());
        Some(ChunkRange {
            first: window.start,
            last: window.start + count - 1,
        })
    }

    pub fn frame_path(&self, ledger: &FrameOrderLedger, index: usize) -> Option<PathBuf> {
        ledger
            .filename(index)
            .map(|filename| self.frames_dir.join(filename))
    }

    pub fn frame_exists(&self, ledger: &FrameOrderLedger, index: usize) -> bool {
        self.frame_path(ledger, index)
            .is_some_and(|path| path.is_file())
    }
}
