use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::config::ReclaimStrategy;
use crate::ledger::FrameOrderLedger;
use crate::progress::ChunkRange;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub reclaimed: usize,
    pub kept: usize,
    pub failed: usize,
}

/// Frees disk space held by frames that every later ledger entry has moved
/// past. Only ever given ranges strictly behind the encoding cursor.
#[derive(Debug, Clone)]
pub struct FrameReclaimer {
    ledger: Arc<FrameOrderLedger>,
    frames_dir: PathBuf,
    strategy: ReclaimStrategy,
}

impl FrameReclaimer {
    pub fn new(ledger: Arc<FrameOrderLedger>, frames_dir: PathBuf, strategy: ReclaimStrategy) -> Self {
        Self {
            ledger,
            frames_dir,
            strategy,
        }
    }

    /// Reclaims `range` on a detached thread.
    pub fn dispatch(&self, range: ChunkRange, verbose: bool) -> Result<()> {
        let reclaimer = self.clone();
        thread::Builder::new()
            .name("autoenc-reclaim".to_owned())
            .spawn(move || {
                let started = Instant::now();
                let stats = reclaimer.reclaim_range(range);
                if verbose {
                    debug!(
                        "[autoenc] reclaimed {} frames (kept {}, failed {}) for lines {}-{} in {:?}",
                        stats.reclaimed,
                        stats.kept,
                        stats.failed,
                        range.first,
                        range.last,
                        started.elapsed()
                    );
                }
            })
            .context("failed to spawn frame reclaim thread")?;
        Ok(())
    }

    pub fn reclaim_range(&self, range: ChunkRange) -> ReclaimStats {
        let mut stats = ReclaimStats::default();
        for index in range.indices() {
            if self.ledger.is_still_needed(index) {
                stats.kept += 1;
                continue;
            }
            let Some(filename) = self.ledger.filename(index) else {
                continue;
            };
            let path = self.frames_dir.join(filename);
            match self.reclaim_file(&path) {
                Ok(()) => stats.reclaimed += 1,
                Err(error) => {
                    stats.failed += 1;
                    warn!("[autoenc] failed to reclaim {}: {error:#}", path.display());
                }
            }
        }
        stats
    }

    fn reclaim_file(&self, path: &std::path::Path) -> Result<()> {
        match self.strategy {
            ReclaimStrategy::Delete => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
                Err(error) => Err(error).context("failed to delete frame"),
            },
            ReclaimStrategy::Blank => {
                if !path.exists() {
                    return Ok(());
                }
                OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .map(|_| ())
                    .context("failed to blank frame")
            }
        }
    }
}
