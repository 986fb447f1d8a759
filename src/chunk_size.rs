use serde::Serialize;

use crate::config::SafetyBufferOverrides;

pub const DEFAULT_SAFETY_BUFFER_FRAMES: usize = 90;

/// Producer backend families with their own safety buffer override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFamily {
    Ncnn,
    RifeCuda,
    FlavrCuda,
    Other,
}

impl BackendFamily {
    pub fn from_name(name: &str) -> Self {
        let normalized = name.trim().to_ascii_lowercase().replace('_', "-");
        if normalized.contains("ncnn") {
            return Self::Ncnn;
        }
        match normalized.as_str() {
            "rife-cuda" => Self::RifeCuda,
            "flavr-cuda" => Self::FlavrCuda,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSizeConfig {
    pub chunk_size: usize,
    pub safety_buffer_frames: usize,
}

impl ChunkSizeConfig {
    pub fn derive(
        target_frame_count: usize,
        backend: BackendFamily,
        overrides: &SafetyBufferOverrides,
    ) -> Self {
        Self {
            chunk_size: compute_chunk_size(target_frame_count),
            safety_buffer_frames: safety_buffer_for(backend, overrides),
        }
    }

    /// Pending frames that must be waiting, with the producer still running,
    /// before a chunk is cut.
    pub fn encode_trigger(&self) -> usize {
        self.chunk_size + self.safety_buffer_frames
    }

    pub fn backpressure_threshold(&self) -> usize {
        let chunk_size = self.chunk_size as f64;
        (chunk_size + 0.5 * chunk_size + self.safety_buffer_frames as f64).round() as usize
    }
}

pub fn compute_chunk_size(target_frame_count: usize) -> usize {
    match target_frame_count {
        count if count > 100_000 => 4800,
        count if count > 50_000 => 2400,
        count if count > 20_000 => 1200,
        count if count > 5000 => 600,
        count if count > 1000 => 300,
        _ => 150,
    }
}

pub fn safety_buffer_for(backend: BackendFamily, overrides: &SafetyBufferOverrides) -> usize {
    match backend {
        BackendFamily::Ncnn => overrides.ncnn,
        BackendFamily::RifeCuda => overrides.rife_cuda,
        BackendFamily::FlavrCuda => overrides.flavr_cuda,
        BackendFamily::Other => DEFAULT_SAFETY_BUFFER_FRAMES,
    }
}

/// Target output frame count: input frames times the interpolation factor.
pub fn target_frame_count(input_frames: usize, interp_factor: f64) -> usize {
    (input_frames as f64 * interp_factor).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::{
        compute_chunk_size, safety_buffer_for, target_frame_count, BackendFamily,
        ChunkSizeConfig,
    };
    use crate::config::SafetyBufferOverrides;

    #[test]
    fn chunk_size_steps_at_each_boundary() {
        let cases = [
            (0, 150),
            (1000, 150),
            (1001, 300),
            (5000, 300),
            (5001, 600),
            (20_000, 600),
            (20_001, 1200),
            (50_000, 1200),
            (50_001, 2400),
            (100_000, 2400),
            (100_001, 4800),
            (10_000_000, 4800),
        ];
        for (target, expected) in cases {
            assert_eq!(
                compute_chunk_size(target),
                expected,
                "unexpected chunk size for {target} frames"
            );
        }
    }

    #[test]
    fn backend_names_map_to_families() {
        assert_eq!(BackendFamily::from_name("rife-ncnn-vulkan"), BackendFamily::Ncnn);
        assert_eq!(BackendFamily::from_name("IFRNet NCNN"), BackendFamily::Ncnn);
        assert_eq!(BackendFamily::from_name("rife_cuda"), BackendFamily::RifeCuda);
        assert_eq!(BackendFamily::from_name("FLAVR-CUDA"), BackendFamily::FlavrCuda);
        assert_eq!(BackendFamily::from_name("dain"), BackendFamily::Other);
    }

    #[test]
    fn safety_buffer_defaults_and_overrides() {
        let defaults = SafetyBufferOverrides::default();
        assert_eq!(safety_buffer_for(BackendFamily::Ncnn, &defaults), 150);
        assert_eq!(safety_buffer_for(BackendFamily::RifeCuda, &defaults), 90);
        assert_eq!(safety_buffer_for(BackendFamily::FlavrCuda, &defaults), 90);
        assert_eq!(safety_buffer_for(BackendFamily::Other, &defaults), 90);

        let custom = SafetyBufferOverrides {
            ncnn: 200,
            rife_cuda: 40,
            flavr_cuda: 60,
        };
        assert_eq!(safety_buffer_for(BackendFamily::Ncnn, &custom), 200);
        assert_eq!(safety_buffer_for(BackendFamily::RifeCuda, &custom), 40);
        assert_eq!(safety_buffer_for(BackendFamily::FlavrCuda, &custom), 60);
        assert_eq!(safety_buffer_for(BackendFamily::Other, &custom), 90);
    }

    #[test]
    fn thresholds_follow_chunk_and_buffer() {
        let sizes = ChunkSizeConfig {
            chunk_size: 150,
            safety_buffer_frames: 90,
        };
        assert_eq!(sizes.encode_trigger(), 240);
        assert_eq!(sizes.backpressure_threshold(), 315);

        let odd = ChunkSizeConfig {
            chunk_size: 5,
            safety_buffer_frames: 0,
        };
        assert_eq!(odd.backpressure_threshold(), 8);
    }

    #[test]
    fn target_frames_scale_with_factor() {
        assert_eq!(target_frame_count(500, 2.0), 1000);
        assert_eq!(target_frame_count(333, 1.5), 500);
        assert_eq!(
            ChunkSizeConfig::derive(
                target_frame_count(600, 2.0),
                BackendFamily::Other,
                &SafetyBufferOverrides::default()
            )
            .chunk_size,
            300
        );
    }
}
