use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FfmpegMode {
    Auto,
    System,
    Sidecar,
}

/// A resolved ffmpeg executable.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    path: PathBuf,
    mode_label: &'static str,
}

impl Ffmpeg {
    pub fn resolve(mode: FfmpegMode) -> Result<Self> {
        match mode {
            FfmpegMode::Auto | FfmpegMode::System => Ok(Self {
                path: PathBuf::from("ffmpeg"),
                mode_label: "system",
            }),
            FfmpegMode::Sidecar => resolve_sidecar(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs ffmpeg to completion in `working_dir`. A non-zero exit is an
    /// error carrying the argument list and the tail of stderr.
    pub fn run(&self, args: &[String], working_dir: &Path) -> Result<()> {
        validate_paths(args)?;
        debug!("[autoenc] ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.path)
            .args(args.iter().map(String::as_str))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    anyhow!(
                        "ffmpeg executable not found (mode={}, resolved_path={}). Install ffmpeg (system mode) or use sidecar mode with `--features sidecar_ffmpeg`.",
                        self.mode_label,
                        self.path.display()
                    )
                } else {
                    anyhow!(
                        "failed to spawn ffmpeg process (mode={}, resolved_path={}, args='{}'): {error}",
                        self.mode_label,
                        self.path.display(),
                        args.join(" ")
                    )
                }
            })?;

        let mut stderr_pipe = child.stderr.take();
        let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
        let status = child.wait().context("failed waiting for ffmpeg process")?;
        if !status.success() {
            return Err(anyhow!(
                "ffmpeg failed with status {status} (mode={}, resolved_path={}, args='{}', stderr_tail='{}')",
                self.mode_label,
                self.path.display(),
                args.join(" "),
                stderr_tail
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
fn resolve_sidecar() -> Result<Ffmpeg> {
    let path = ffmpeg_sidecar::paths::ffmpeg_path();
    if !path.exists() {
        ffmpeg_sidecar::download::auto_download()
            .context("failed to auto-download ffmpeg sidecar binary")?;
    }
    Ok(Ffmpeg {
        path,
        mode_label: "sidecar",
    })
}

#[cfg(not(feature = "sidecar_ffmpeg"))]
fn resolve_sidecar() -> Result<Ffmpeg> {
    Err(anyhow!(
        "ffmpeg sidecar mode requested but autoenc was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
    ))
}

fn validate_paths(args: &[String]) -> Result<()> {
    for arg in args {
        if arg.len() > 4096 {
            bail!("ffmpeg argument is suspiciously long");
        }
        if arg.chars().any(|c| c.is_control()) {
            bail!("ffmpeg argument contains invalid control characters: {arg:?}");
        }
    }
    Ok(())
}

/// Quotes a path for an ffmpeg concat list (`file '...'`).
pub fn concat_quote(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(last_n_chars(&text, 500))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}
