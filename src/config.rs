use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AutoEncMode {
    Off,
    KeepFrames,
    DeleteFrames,
}

impl TryFrom<u8> for AutoEncMode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Off),
            1 => Ok(Self::KeepFrames),
            2 => Ok(Self::DeleteFrames),
            other => Err(format!(
                "autoEncMode must be 0 (off), 1 (keep frames) or 2 (delete frames), got {other}"
            )),
        }
    }
}

impl From<AutoEncMode> for u8 {
    fn from(mode: AutoEncMode) -> Self {
        match mode {
            AutoEncMode::Off => 0,
            AutoEncMode::KeepFrames => 1,
            AutoEncMode::DeleteFrames => 2,
        }
    }
}

/// How a reclaimed frame file gives its space back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimStrategy {
    #[default]
    Delete,
    /// Truncate to a zero-byte placeholder so file-count based progress
    /// counters keep working.
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SafetyBufferOverrides {
    #[serde(default = "default_ncnn_buffer")]
    pub ncnn: usize,
    #[serde(default = "default_cuda_buffer")]
    pub rife_cuda: usize,
    #[serde(default = "default_cuda_buffer")]
    pub flavr_cuda: usize,
}

impl Default for SafetyBufferOverrides {
    fn default() -> Self {
        Self {
            ncnn: default_ncnn_buffer(),
            rife_cuda: default_cuda_buffer(),
            flavr_cuda: default_cuda_buffer(),
        }
    }
}

fn default_ncnn_buffer() -> usize {
    150
}

fn default_cuda_buffer() -> usize {
    90
}

fn default_auto_enc_mode() -> AutoEncMode {
    AutoEncMode::KeepFrames
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AutoEncConfig {
    #[serde(default = "default_auto_enc_mode")]
    pub auto_enc_mode: AutoEncMode,
    #[serde(default)]
    pub always_wait_for_auto_enc: bool,
    #[serde(default)]
    pub auto_enc_backup_mode: u32,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub reclaim_strategy: ReclaimStrategy,
    #[serde(default)]
    pub chunk_safety_buffer: SafetyBufferOverrides,
}

impl Default for AutoEncConfig {
    fn default() -> Self {
        Self {
            auto_enc_mode: default_auto_enc_mode(),
            always_wait_for_auto_enc: false,
            auto_enc_backup_mode: 0,
            debug: false,
            reclaim_strategy: ReclaimStrategy::default(),
            chunk_safety_buffer: SafetyBufferOverrides::default(),
        }
    }
}

impl AutoEncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|error| {
            let location = error
                .location()
                .map(|location| format!("line {}, column {}", location.line(), location.column()))
                .unwrap_or_else(|| "unknown location".to_owned());
            anyhow!("failed to parse yaml at {}: {}", location, error)
        })
    }

    pub fn backpressure_enabled(&self) -> bool {
        self.always_wait_for_auto_enc
    }

    pub fn backup_merge_enabled(&self) -> bool {
        self.auto_enc_backup_mode > 0
    }

    pub fn reclaim_enabled(&self) -> bool {
        self.auto_enc_mode == AutoEncMode::DeleteFrames
    }
}

/// Polling cadence of the orchestrator loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub tick: Duration,
    pub paused_tick: Duration,
    pub missing_frame_retry: Duration,
    pub waiting_poll: Duration,
    pub missing_frame_retries_after_exit: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            paused_tick: Duration::from_millis(200),
            missing_frame_retry: Duration::from_millis(500),
            waiting_poll: Duration::from_millis(2000),
            missing_frame_retries_after_exit: 20,
        }
    }
}

impl Timing {
    pub fn immediate() -> Self {
        Self {
            tick: Duration::ZERO,
            paused_tick: Duration::from_millis(1),
            missing_frame_retry: Duration::ZERO,
            waiting_poll: Duration::from_millis(1),
            missing_frame_retries_after_exit: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AutoEncConfig, AutoEncMode, ReclaimStrategy};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AutoEncConfig::parse("").expect("empty config should parse");
        assert_eq!(config, AutoEncConfig::default());
        assert_eq!(config.auto_enc_mode, AutoEncMode::KeepFrames);
        assert!(!config.reclaim_enabled());
        assert!(!config.backpressure_enabled());
        assert!(!config.backup_merge_enabled());
        assert_eq!(config.chunk_safety_buffer.ncnn, 150);
        assert_eq!(config.chunk_safety_buffer.rife_cuda, 90);
    }

    #[test]
    fn parses_every_recognized_key() {
        let config = AutoEncConfig::parse(
            r#"
autoEncMode: 1
alwaysWaitForAutoEnc: true
autoEncBackupMode: 2
debug: true
reclaimStrategy: blank
chunkSafetyBuffer:
  ncnn: 200
  flavrCuda: 30
"#,
        )
        .expect("config should parse");

        assert_eq!(config.auto_enc_mode, AutoEncMode::KeepFrames);
        assert!(config.backpressure_enabled());
        assert!(config.backup_merge_enabled());
        assert!(config.debug);
        assert!(!config.reclaim_enabled());
        assert_eq!(config.reclaim_strategy, ReclaimStrategy::Blank);
        assert_eq!(config.chunk_safety_buffer.ncnn, 200);
        assert_eq!(config.chunk_safety_buffer.rife_cuda, 90);
        assert_eq!(config.chunk_safety_buffer.flavr_cuda, 30);
    }

    #[test]
    fn rejects_unknown_keys_and_modes() {
        let unknown = AutoEncConfig::parse("autoEncSpeed: 3\n").expect_err("unknown key");
        assert!(unknown.to_string().contains("line 1"));

        let bad_mode = AutoEncConfig::parse("autoEncMode: 7\n").expect_err("bad mode");
        assert!(format!("{bad_mode:#}").contains("autoEncMode"));
    }

    #[test]
    fn missing_config_path_is_an_error_but_none_is_default() {
        let dir = tempdir().expect("tempdir should create");
        let path = dir.path().join("autoenc.yaml");
        assert!(AutoEncConfig::load(&path).is_err());
        assert_eq!(
            AutoEncConfig::load_or_default(None).expect("default config"),
            AutoEncConfig::default()
        );

        fs::write(&path, "autoEncMode: 0\n").expect("config should write");
        let config = AutoEncConfig::load(&path).expect("config should load");
        assert_eq!(config.auto_enc_mode, AutoEncMode::Off);
    }
}
