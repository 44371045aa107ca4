use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::InterruptReason;

/// Broad class of an error, used to decide whether it can be retried,
/// caught by a flow, or must abort construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Detected while building a component. Never retried.
    Configuration,
    /// A value did not conform to a declared property. Recoverable inside agents.
    Validation,
    /// A tool, LLM call, or step failed at run time.
    Execution,
    /// A soft interrupt or cancellation stopped the run at a boundary.
    Interrupted,
}

/// One failed branch of a parallel region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFailure {
    pub branch: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Flow '{flow}': step '{step}' has no transition for branch '{branch}'")]
    MissingBranch {
        flow: String,
        step: String,
        branch: String,
    },

    #[error("Flow '{flow}': data edge {source_step}.{output} -> {destination_step}.{input} is not type compatible")]
    DataEdgeType {
        flow: String,
        source_step: String,
        output: String,
        destination_step: String,
        input: String,
    },

    #[error("Parallel region '{region}' contains suspending step '{step}'")]
    SuspendingInParallel { region: String, step: String },

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Validation errors
    #[error("Validation failed for '{name}': {message}")]
    Validation { name: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("Invalid conversation state: {0}")]
    Conversation(String),

    // Execution errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Step '{step}' is missing input '{input}'")]
    MissingInput { step: String, input: String },

    #[error("{kind}: {message}")]
    Raised { kind: String, message: String },

    #[error("Agent exceeded max iterations ({0})")]
    MaxIterationsExceeded(usize),

    #[error("Flow '{flow}' exceeded max transitions ({limit})")]
    MaxTransitionsExceeded { flow: String, limit: usize },

    #[error("Parallel step '{step}' failed in {} branch(es); completed: {completed:?}", failures.len())]
    ParallelBranches {
        step: String,
        failures: Vec<BranchFailure>,
        completed: Vec<String>,
    },

    #[error("Datastore error: {0}")]
    Datastore(String),

    // Interrupts
    #[error("Execution interrupted: {0}")]
    Interrupted(InterruptReason),

    #[error("Execution cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StepwiseError>;

impl StepwiseError {
    /// Shorthand for a validation error on a named value.
    pub fn validation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Raise a user-defined error category that flows can catch by name.
    pub fn raised(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raised {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::MissingBranch { .. }
            | Self::DataEdgeType { .. }
            | Self::SuspendingInParallel { .. }
            | Self::Deserialization(_) => ErrorCategory::Configuration,
            Self::Validation { .. }
            | Self::ToolNotFound(_)
            | Self::LlmParse(_)
            | Self::Conversation(_) => ErrorCategory::Validation,
            Self::Interrupted(_) | Self::Cancelled => ErrorCategory::Interrupted,
            _ => ErrorCategory::Execution,
        }
    }

    /// Stable name of the error kind. `CatchExceptionStep` routes on this.
    pub fn kind(&self) -> &str {
        match self {
            Self::Config(_) => "Config",
            Self::ConfigNotFound(_) => "ConfigNotFound",
            Self::MissingBranch { .. } => "MissingBranch",
            Self::DataEdgeType { .. } => "DataEdgeType",
            Self::SuspendingInParallel { .. } => "SuspendingInParallel",
            Self::Deserialization(_) => "Deserialization",
            Self::Validation { .. } => "Validation",
            Self::ToolNotFound(_) => "ToolNotFound",
            Self::LlmParse(_) => "LlmParse",
            Self::Conversation(_) => "Conversation",
            Self::LlmRequest(_) => "LlmRequest",
            Self::LlmStream(_) => "LlmStream",
            Self::ToolExecution { .. } => "ToolExecution",
            Self::ToolTimeout { .. } => "ToolTimeout",
            Self::StepFailed { .. } => "StepFailed",
            Self::MissingInput { .. } => "MissingInput",
            Self::Raised { kind, .. } => kind,
            Self::MaxIterationsExceeded(_) => "MaxIterationsExceeded",
            Self::MaxTransitionsExceeded { .. } => "MaxTransitionsExceeded",
            Self::ParallelBranches { .. } => "ParallelExecution",
            Self::Datastore(_) => "Datastore",
            Self::Interrupted(_) => "Interrupted",
            Self::Cancelled => "Cancelled",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
        }
    }

    /// Whether a flow-level catch or retry may intercept this error.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Execution | ErrorCategory::Validation
        )
    }

    /// Text safe to show to an end user. Never includes the error detail.
    pub fn user_message(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Validation => {
                "The request could not be processed because some input was invalid."
            }
            ErrorCategory::Interrupted => "The request was stopped before it could complete.",
            ErrorCategory::Configuration | ErrorCategory::Execution => {
                "Something went wrong while processing your request."
            }
        }
    }
}
