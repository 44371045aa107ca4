use serde::{Deserialize, Serialize};

use stepwise_core::types::DEFAULT_BRANCH;

/// `(source_step, branch) -> destination`. A `None` destination ends the
/// flow through its `next` exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlowEdge {
    pub source_step: String,
    #[serde(default = "default_branch")]
    pub source_branch: String,
    #[serde(default)]
    pub destination: Option<String>,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl ControlFlowEdge {
    pub fn new(source_step: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source_step: source_step.into(),
            source_branch: default_branch(),
            destination: Some(destination.into()),
        }
    }

    pub fn on_branch(
        source_step: impl Into<String>,
        branch: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            source_step: source_step.into(),
            source_branch: branch.into(),
            destination: Some(destination.into()),
        }
    }

    /// Edge that finishes the flow.
    pub fn to_end(source_step: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            source_step: source_step.into(),
            source_branch: branch.into(),
            destination: None,
        }
    }
}

/// One end of a data edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataEndpoint {
    Step { step: String, name: String },
    Variable { variable: String },
}

impl DataEndpoint {
    pub fn step(step: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            name: name.into(),
        }
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable {
            variable: name.into(),
        }
    }
}

impl std::fmt::Display for DataEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step { step, name } => write!(f, "{}.{}", step, name),
            Self::Variable { variable } => write!(f, "${}", variable),
        }
    }
}

/// Moves a value from a step output or variable into a step input or
/// variable. Variable-to-variable edges are not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFlowEdge {
    pub source: DataEndpoint,
    pub destination: DataEndpoint,
}

impl DataFlowEdge {
    pub fn new(source: DataEndpoint, destination: DataEndpoint) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// `source_step.output -> destination_step.input`
    pub fn between(
        source_step: impl Into<String>,
        output: impl Into<String>,
        destination_step: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self::new(
            DataEndpoint::step(source_step, output),
            DataEndpoint::step(destination_step, input),
        )
    }

    pub fn feeds(&self, step: &str, input: &str) -> bool {
        matches!(&self.destination, DataEndpoint::Step { step: s, name } if s == step && name == input)
    }
}
