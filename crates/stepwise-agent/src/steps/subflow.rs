use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::error::Result;
use stepwise_core::property::Property;

use crate::component::ConversationalComponent;
use crate::flow::{Flow, Step, StepInvocation, StepOutcome, StepState};
use crate::status::ExecutionStatus;
use crate::variables::WriteOperation;

/// Runs a nested flow in the same conversation. Each exit branch of the
/// nested flow is a branch of this step.
#[derive(Debug, Clone)]
pub struct FlowExecutionStep {
    flow: Flow,
}

impl FlowExecutionStep {
    pub fn new(flow: Flow) -> Self {
        Self { flow }
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }
}

impl Step for FlowExecutionStep {
    fn kind(&self) -> &'static str {
        "flow_execution"
    }

    fn inputs(&self) -> Vec<Property> {
        self.flow.inputs().to_vec()
    }

    fn outputs(&self) -> Vec<Property> {
        self.flow.outputs().to_vec()
    }

    fn branches(&self) -> Vec<String> {
        self.flow.exit_branches().to_vec()
    }

    fn may_suspend(&self) -> bool {
        self.flow.may_suspend()
    }

    fn variable_writes(&self) -> Vec<(String, WriteOperation)> {
        self.flow.variable_writes()
    }

    fn declared_variables(&self) -> Vec<Property> {
        self.flow.variables().to_vec()
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let StepInvocation {
                name,
                inputs,
                state,
                scope,
                ..
            } = call;
            if matches!(state, StepState::Idle) {
                *state = StepState::SubFlow {
                    flow: Box::new(self.flow.new_flow_state(inputs)?),
                    attempt: 0,
                };
            }
            let StepState::SubFlow { flow: nested, .. } = state else {
                return Err(state.unexpected(name));
            };

            match self.flow.run(nested, scope).await? {
                ExecutionStatus::Finished {
                    outputs,
                    exit_branch,
                } => Ok(StepOutcome::branch(outputs, exit_branch)),
                suspended => Ok(StepOutcome::Suspend(suspended)),
            }
        })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "flow_execution", "flow": self.flow.to_config() })
    }
}
