use crate::monitor::FailureReason;
use crate::stage::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// Error taxonomy for the staged lifecycle
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("Stage {stage} failed: {reason}")]
    DataProvision { stage: Stage, reason: String },

    #[error("Graph build failed: {0}")]
    BuildFailure(FailureReason),

    #[error("Server start attempt {attempt} failed: {reason}")]
    StartFailure { attempt: u32, reason: FailureReason },

    #[error("No {count} free ports between {start} and {end}")]
    PortExhaustion { start: u16, end: u16, count: usize },

    #[error("Stage record {}: {message}", path.display())]
    StageStore { path: PathBuf, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Routing engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("No managed process")]
    NoProcess,

    #[error("Interrupted by shutdown request")]
    Interrupted,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Check if the failed step may be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SupervisorError::StartFailure { .. } | SupervisorError::PortExhaustion { .. }
        )
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    pub(crate) fn stage_store(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        SupervisorError::StageStore {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
