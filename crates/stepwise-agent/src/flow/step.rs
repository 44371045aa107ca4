use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::types::{ValueMap, DEFAULT_BRANCH};

use crate::agent::AgentState;
use crate::calls::PendingCall;
use crate::component::Scope;
use crate::flow::FlowState;
use crate::status::ExecutionStatus;
use crate::variables::WriteOperation;

/// Everything a step sees for one invocation.
pub struct StepInvocation<'a> {
    pub flow: &'a str,
    pub name: &'a str,
    /// Resolved and coerced inputs.
    pub inputs: ValueMap,
    /// Per-invocation state, persisted across suspensions.
    pub state: &'a mut StepState,
    pub scope: Scope<'a>,
}

#[derive(Debug)]
pub enum StepOutcome {
    Complete { outputs: ValueMap, branch: String },
    Suspend(ExecutionStatus),
}

impl StepOutcome {
    pub fn next(outputs: ValueMap) -> Self {
        Self::Complete {
            outputs,
            branch: DEFAULT_BRANCH.to_string(),
        }
    }

    pub fn branch(outputs: ValueMap, branch: impl Into<String>) -> Self {
        Self::Complete {
            outputs,
            branch: branch.into(),
        }
    }
}

/// Continuation data of the step currently executing in a flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Idle,
    /// Waiting for a user message appended after `since`.
    AwaitingInput { since: usize },
    AwaitingTool { call: PendingCall },
    SubFlow { flow: Box<FlowState>, attempt: usize },
    Map {
        index: usize,
        outputs: BTreeMap<String, Vec<Value>>,
        current: Option<Box<FlowState>>,
    },
    Agent { agent: Box<AgentState> },
    /// Free-form state for user-defined steps.
    Custom { value: Value },
}

impl StepState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingInput { .. } => "awaiting_input",
            Self::AwaitingTool { .. } => "awaiting_tool",
            Self::SubFlow { .. } => "sub_flow",
            Self::Map { .. } => "map",
            Self::Agent { .. } => "agent",
            Self::Custom { .. } => "custom",
        }
    }

    /// Error for a step asked to resume from a state it never produces.
    pub fn unexpected(&self, step: &str) -> StepwiseError {
        StepwiseError::StepFailed {
            step: step.to_string(),
            message: format!("cannot resume from {} state", self.label()),
        }
    }
}

/// A node in a flow. Definitions are immutable; everything that changes
/// during a run lives in [`StepState`] and the conversation.
pub trait Step: Send + Sync + 'static {
    /// Serialized type tag.
    fn kind(&self) -> &'static str;

    fn inputs(&self) -> Vec<Property>;

    fn outputs(&self) -> Vec<Property>;

    fn branches(&self) -> Vec<String> {
        vec![DEFAULT_BRANCH.to_string()]
    }

    fn may_suspend(&self) -> bool {
        false
    }

    /// Variables this step writes, and how.
    fn variable_writes(&self) -> Vec<(String, WriteOperation)> {
        Vec::new()
    }

    /// Variables this step needs declared in the conversation.
    fn declared_variables(&self) -> Vec<Property> {
        Vec::new()
    }

    /// Terminal steps end the flow; their branch becomes the exit branch.
    fn is_terminal(&self) -> bool {
        false
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>>;

    fn to_config(&self) -> Value;
}
