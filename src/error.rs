use std::path::PathBuf;

use anyhow::Error;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to read frame order manifest {}", path.display())]
    ManifestUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("last frame of chunk was never written: {}", path.display())]
    MissingFrameFile { path: PathBuf },

    #[error("failed to encode chunk #{chunk}")]
    EncodeChunkFailure {
        chunk: usize,
        #[source]
        source: Error,
    },

    #[error("failed to merge chunks into {}", output.display())]
    MergeFailure {
        output: PathBuf,
        #[source]
        source: Error,
    },

    #[error("canceled: {reason}")]
    Canceled { reason: String },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ManifestUnreadable { .. } => "manifest_unreadable",
            Self::MissingFrameFile { .. } => "missing_frame_file",
            Self::EncodeChunkFailure { .. } => "encode_chunk_failure",
            Self::MergeFailure { .. } => "merge_failure",
            Self::Canceled { .. } => "canceled",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Canceled { .. } => 130,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub message: String,
}

/// Builds the `--json` failure envelope. Errors that did not originate in the
/// pipeline are reported under the generic `error` code.
pub fn envelope_for(error: &Error) -> ErrorEnvelope {
    let code = find_pipeline_error(error).map_or("error", PipelineError::code);
    ErrorEnvelope {
        ok: false,
        error: ErrorEnvelopeBody {
            code: code.to_owned(),
            message: format!("{error:#}"),
        },
    }
}

pub fn find_pipeline_error(error: &Error) -> Option<&PipelineError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}

#[cfg(test)]
mod tests {
    use super::{envelope_for, find_pipeline_error, PipelineError};
    use anyhow::{anyhow, Context};

    #[test]
    fn pipeline_error_is_found_through_context_layers() {
        let error = Err::<(), _>(PipelineError::Canceled {
            reason: "operator request".to_owned(),
        })
        .context("auto-encode stopped")
        .expect_err("should be an error");

        let found = find_pipeline_error(&error).expect("pipeline error should be in chain");
        assert_eq!(found.code(), "canceled");
        assert_eq!(found.exit_code(), 130);
    }

    #[test]
    fn envelope_falls_back_to_generic_code() {
        let envelope = envelope_for(&anyhow!("something else broke"));
        assert!(!envelope.ok);
        assert_eq!(envelope.error.code, "error");
        assert!(envelope.error.message.contains("something else broke"));
    }

    #[test]
    fn encode_failure_message_includes_cause() {
        let error = PipelineError::EncodeChunkFailure {
            chunk: 3,
            source: anyhow!("ffmpeg exited with status 1"),
        };
        assert_eq!(error.exit_code(), 1);
        assert_eq!(error.to_string(), "failed to encode chunk #3");

        let chained = format!("{:#}", anyhow::Error::from(error));
        assert_eq!(chained, "failed to encode chunk #3: ffmpeg exited with status 1");
    }

    #[test]
    fn envelope_reports_each_cause_once() {
        let error = crate::ledger::FrameOrderLedger::load(std::path::Path::new(
            "/nonexistent/frames.ini",
        ))
        .expect_err("missing manifest should fail");
        let envelope = envelope_for(&error.into());
        assert_eq!(envelope.error.code, "manifest_unreadable");
        assert!(envelope.error.message.starts_with(
            "failed to read frame order manifest /nonexistent/frames.ini: "
        ));
        assert_eq!(envelope.error.message.matches("os error").count(), 1);
    }
}
