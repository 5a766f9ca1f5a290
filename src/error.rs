//! # Poller Error Types
//!
//! One error enum for the whole poll cycle. The variants are grouped by how far a
//! failure is allowed to travel: a `WindowLock` error ends the cycle before anything
//! else runs, a `PipelineFatal` error rolls the window back, and the remaining
//! variants are logged where they happen while the cycle carries on.

use std::fmt;
use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;

/// Stage of the fetch/transform/publish pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Auth,
    CaseSource,
    Publish,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Auth => write!(f, "auth"),
            PipelineStage::CaseSource => write!(f, "case_source"),
            PipelineStage::Publish => write!(f, "publish"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PollerError {
    #[error("Run window lock error: {message}")]
    WindowLock { message: String },

    #[error("Session transport error: {session}: {message}")]
    SessionTransport { session: String, message: String },

    #[error("Message handling error: {message_id}: {message}")]
    MessageHandling { message_id: String, message: String },

    #[error("Case transform error: {case_id}: {message}")]
    CaseTransform { case_id: String, message: String },

    #[error("Pipeline failed at {stage}: {message}")]
    PipelineFatal {
        stage: PipelineStage,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Task rejected: {task_id}: {message}")]
    TaskRejected { task_id: String, message: String },
}

impl PollerError {
    pub fn window_lock(message: impl Into<String>) -> Self {
        Self::WindowLock {
            message: message.into(),
        }
    }

    pub fn session_transport(session: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::SessionTransport {
            session: session.to_string(),
            message: message.into(),
        }
    }

    pub fn message_handling(message_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MessageHandling {
            message_id: message_id.into(),
            message: message.into(),
        }
    }

    pub fn case_transform(case_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CaseTransform {
            case_id: case_id.into(),
            message: message.into(),
        }
    }

    pub fn pipeline(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self::PipelineFatal {
            stage,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn task_rejected(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskRejected {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// A backing service that could not be brought up at startup
    pub fn startup(operation: &str, err: impl fmt::Display) -> Self {
        Self::configuration(format!("{operation} failed: {err}"))
    }

    /// Attribute this error to a pipeline stage.
    ///
    /// Errors that already carry a stage keep it, so a failure raised deep inside a
    /// collaborator is not relabelled by the caller.
    pub fn in_stage(self, stage: PipelineStage) -> Self {
        match self {
            fatal @ PollerError::PipelineFatal { .. } => fatal,
            other => Self::pipeline(stage, other.to_string()),
        }
    }

    /// Whether this error must abort the cycle before any work is done
    pub fn is_window_lock(&self) -> bool {
        matches!(self, PollerError::WindowLock { .. })
    }

    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PollerError::PipelineFatal { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for PollerError {
    fn from(err: sqlx::Error) -> Self {
        // The run window row is the only state this crate persists through sqlx.
        Self::window_lock(err.to_string())
    }
}

impl From<ConfigurationError> for PollerError {
    fn from(err: ConfigurationError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<MessagingError> for PollerError {
    fn from(err: MessagingError) -> Self {
        Self::pipeline(PipelineStage::Publish, err.to_string())
    }
}

pub type PollerResult<T> = std::result::Result<T, PollerError>;
