use std::path::PathBuf;
use thiserror::Error;

/// Outcomes the pipeline branches on. Everything else travels as a plain
/// `anyhow::Error` and counts as a hard failure of the current keyword.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("all {keys} Gemini API key(s) have exhausted their quota")]
    QuotaExhausted { keys: usize },

    #[error("only {found} of {target} qualifying products found")]
    InsufficientProducts { found: usize, target: usize },

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("required file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("{program} timed out after {secs}s")]
    CommandTimeout { program: String, secs: u64 },

    #[error("{program} exited with {status}")]
    CommandFailed { program: String, status: String },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("CAPTCHA page served for {0}")]
    Captcha(String),
}

impl PipelineError {
    /// Errors that stop the whole run instead of just the current keyword.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::QuotaExhausted { .. } | PipelineError::UploadFailed(_)
        )
    }
}

/// Finds a `PipelineError` anywhere in the context chain.
pub fn pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
}

pub fn is_fatal(err: &anyhow::Error) -> bool {
    pipeline_error(err).is_some_and(PipelineError::is_fatal)
}

/// Result of one pipeline stage as seen by the orchestrator.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Success(T),
    InsufficientData { found: usize, target: usize },
    HardFailure(anyhow::Error),
}

impl<T> StageOutcome<T> {
    pub fn from_result(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => StageOutcome::Success(value),
            Err(err) => match pipeline_error(&err) {
                Some(PipelineError::InsufficientProducts { found, target }) => {
                    StageOutcome::InsufficientData {
                        found: *found,
                        target: *target,
                    }
                }
                _ => StageOutcome::HardFailure(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn insufficient_products_maps_to_insufficient_data() {
        let result: anyhow::Result<()> = Err(PipelineError::InsufficientProducts {
            found: 1,
            target: 3,
        })
        .context("scraping wireless mouse");

        match StageOutcome::from_result(result) {
            StageOutcome::InsufficientData { found, target } => {
                assert_eq!(found, 1);
                assert_eq!(target, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn fatal_errors_are_found_through_context() {
        let err = anyhow::Error::new(PipelineError::QuotaExhausted { keys: 2 })
            .context("generating narration");
        assert!(is_fatal(&err));

        let err = anyhow::anyhow!("ffmpeg exploded");
        assert!(!is_fatal(&err));
        assert!(matches!(
            StageOutcome::<()>::from_result(Err(err)),
            StageOutcome::HardFailure(_)
        ));
    }
}
