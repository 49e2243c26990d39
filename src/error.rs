use crate::stage::Stage;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failures the driver can observe. A remote job that fails after it was
/// accepted by the scheduler is not one of them: nothing reports back.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("stage {stage} exited with status {status}")]
    LocalStageFailure { stage: Stage, status: i32 },

    #[error("batch submission failed: {0}")]
    SubmissionFailure(String),

    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PipelineError::InvalidParameter(msg.into())
    }

    /// Process exit code for the CLI. A failed local stage hands its own
    /// status back verbatim.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::LocalStageFailure { status, .. } => *status,
            PipelineError::UnknownStage(_) | PipelineError::InvalidParameter(_) => 2,
            _ => 1,
        }
    }
}
