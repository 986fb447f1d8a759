use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::ledger::frame_number_of;

/// The external frame producer, as seen by the pipeline: liveness, progress,
/// and the suspend/resume hooks used for backpressure.
pub trait Producer {
    fn has_exited(&mut self) -> Result<bool>;
    /// Most recent frame number the producer has started writing.
    fn last_frame(&mut self) -> Result<Option<u64>>;
    fn suspend(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
}

/// Reads producer progress off the frames directory.
#[derive(Debug, Clone)]
pub struct DirectoryProgress {
    frames_dir: PathBuf,
    extension: String,
}

impl DirectoryProgress {
    pub fn new(frames_dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            frames_dir: frames_dir.into(),
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    fn frame_names(&self) -> Result<Vec<String>> {
        if !self.frames_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.frames_dir)
            .with_context(|| format!("failed to list frames in {}", self.frames_dir.display()))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read entry in {}", self.frames_dir.display())
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let matches_ext = Path::new(name)
                .extension()
                .and_then(OsStr::to_str)
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension));
            if !matches_ext {
                continue;
            }
            // The directory entry already carries its type; only symlinks
            // need a stat of their target.
            let file_type = entry.file_type().with_context(|| {
                format!("failed to read file type of {}", entry.path().display())
            })?;
            let is_file = file_type.is_file() || (file_type.is_symlink() && entry.path().is_file());
            if is_file {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    pub fn frame_count(&self) -> Result<usize> {
        Ok(self.frame_names()?.len())
    }

    pub fn highest_frame(&self) -> Result<Option<u64>> {
        Ok(self
            .frame_names()?
            .iter()
            .filter_map(|name| frame_number_of(name))
            .max())
    }
}

/// Producer spawned by this process from a command line.
#[derive(Debug)]
pub struct ChildProducer {
    child: Child,
    progress: DirectoryProgress,
    exited: bool,
}

impl ChildProducer {
    pub fn spawn(command: &[String], progress: DirectoryProgress) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("producer command is empty");
        };
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            // Stdout carries the --json report.
            .stdout(Stdio::from(std::io::stderr()))
            .spawn()
            .with_context(|| format!("failed to spawn producer '{}'", command.join(" ")))?;
        debug!("[autoenc] spawned producer pid {}", child.id());
        Ok(Self {
            child,
            progress,
            exited: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Producer for ChildProducer {
    fn has_exited(&mut self) -> Result<bool> {
        if self.exited {
            return Ok(true);
        }
        let status = self
            .child
            .try_wait()
            .context("failed to poll producer process")?;
        if let Some(status) = status {
            if !status.success() {
                warn!("[autoenc] producer exited with {status}");
            }
            self.exited = true;
        }
        Ok(self.exited)
    }

    fn last_frame(&mut self) -> Result<Option<u64>> {
        self.progress.highest_frame()
    }

    fn suspend(&mut self) -> Result<()> {
        signal_process(self.child.id(), Signal::Stop)
    }

    fn resume(&mut self) -> Result<()> {
        signal_process(self.child.id(), Signal::Continue)
    }
}

impl Drop for ChildProducer {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Producer started elsewhere, tracked by pid.
#[derive(Debug)]
pub struct PidProducer {
    pid: u32,
    progress: DirectoryProgress,
}

impl PidProducer {
    pub fn attach(pid: u32, progress: DirectoryProgress) -> Result<Self> {
        if !process_alive(pid)? {
            bail!("producer pid {pid} is not running");
        }
        Ok(Self { pid, progress })
    }
}

impl Producer for PidProducer {
    fn has_exited(&mut self) -> Result<bool> {
        Ok(!process_alive(self.pid)?)
    }

    fn last_frame(&mut self) -> Result<Option<u64>> {
        self.progress.highest_frame()
    }

    fn suspend(&mut self) -> Result<()> {
        signal_process(self.pid, Signal::Stop)
    }

    fn resume(&mut self) -> Result<()> {
        signal_process(self.pid, Signal::Continue)
    }
}

/// Stand-in for a producer that already finished: every frame on disk is final.
#[derive(Debug, Default, Clone, Copy)]
pub struct FinishedProducer;

impl Producer for FinishedProducer {
    fn has_exited(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn last_frame(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }

    fn suspend(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Stop,
    Continue,
}

#[cfg(unix)]
fn signal_process(pid: u32, signal: Signal) -> Result<()> {
    let raw_pid = libc::pid_t::try_from(pid).context("producer pid out of range")?;
    let raw_signal = match signal {
        Signal::Stop => libc::SIGSTOP,
        Signal::Continue => libc::SIGCONT,
    };
    let result = unsafe { libc::kill(raw_pid, raw_signal) };
    if result != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to send {signal:?} to producer pid {pid}"));
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_process(pid: u32, signal: Signal) -> Result<()> {
    bail!("cannot send {signal:?} to producer pid {pid}: suspend/resume needs a unix host")
}

#[cfg(unix)]
fn process_alive(pid: u32) -> Result<bool> {
    let raw_pid = libc::pid_t::try_from(pid).context("producer pid out of range")?;
    let result = unsafe { libc::kill(raw_pid, 0) };
    if result == 0 {
        return Ok(true);
    }
    let error = std::io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        // Exists but owned by someone else.
        Some(libc::EPERM) => Ok(true),
        _ => Err(error).with_context(|| format!("failed to probe producer pid {pid}")),
    }
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> Result<bool> {
    bail!("cannot probe producer pid {pid}: attaching by pid needs a unix host")
}

#[cfg(test)]
mod tests {
    use super::{DirectoryProgress, FinishedProducer, Producer};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn directory_progress_reports_highest_matching_frame() {
        let dir = tempdir().expect("tempdir should create");
        let progress = DirectoryProgress::new(dir.path(), ".png");
        assert_eq!(progress.highest_frame().expect("scan"), None);

        for name in ["00000001.png", "00000003.PNG", "00000009.jpg", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").expect("file should write");
        }
        fs::create_dir(dir.path().join("00000050.png")).expect("dir should create");

        assert_eq!(progress.frame_count().expect("count"), 2);
        assert_eq!(progress.highest_frame().expect("scan"), Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_frames_are_counted() {
        let dir = tempdir().expect("tempdir should create");
        let store = tempdir().expect("tempdir should create");
        fs::write(store.path().join("real.png"), b"x").expect("file should write");
        std::os::unix::fs::symlink(
            store.path().join("real.png"),
            dir.path().join("00000004.png"),
        )
        .expect("symlink should create");
        std::os::unix::fs::symlink(
            store.path().join("gone.png"),
            dir.path().join("00000005.png"),
        )
        .expect("dangling symlink should create");

        let progress = DirectoryProgress::new(dir.path(), "png");
        assert_eq!(progress.frame_count().expect("count"), 1);
        assert_eq!(progress.highest_frame().expect("scan"), Some(4));
    }

    #[test]
    fn missing_frames_dir_counts_as_empty() {
        let dir = tempdir().expect("tempdir should create");
        let progress = DirectoryProgress::new(dir.path().join("not-yet"), "png");
        assert_eq!(progress.frame_count().expect("count"), 0);
    }

    #[test]
    fn finished_producer_is_always_exited() {
        let mut producer = FinishedProducer;
        assert!(producer.has_exited().expect("liveness"));
        assert_eq!(producer.last_frame().expect("progress"), None);
        producer.suspend().expect("suspend is a no-op");
    }

    #[cfg(unix)]
    #[test]
    fn child_producer_exit_is_observed() {
        use super::ChildProducer;
        use std::thread;
        use std::time::Duration;

        let dir = tempdir().expect("tempdir should create");
        let command = vec!["sh".to_owned(), "-c".to_owned(), "exit 0".to_owned()];
        let mut producer = ChildProducer::spawn(&command, DirectoryProgress::new(dir.path(), "png"))
            .expect("producer should spawn");

        let mut exited = false;
        for _ in 0..200 {
            if producer.has_exited().expect("liveness") {
                exited = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(exited, "short-lived producer should be seen as exited");
    }

    #[cfg(unix)]
    #[test]
    fn child_producer_can_be_suspended_and_resumed() {
        use super::ChildProducer;

        let dir = tempdir().expect("tempdir should create");
        let command = vec!["sleep".to_owned(), "5".to_owned()];
        let mut producer = ChildProducer::spawn(&command, DirectoryProgress::new(dir.path(), "png"))
            .expect("producer should spawn");
        producer.suspend().expect("suspend");
        producer.resume().expect("resume");
        assert!(!producer.has_exited().expect("liveness"));
    }
}
