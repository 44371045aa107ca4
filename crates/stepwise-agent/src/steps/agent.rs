use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::error::Result;
use stepwise_core::property::Property;

use crate::agent::Agent;
use crate::component::ConversationalComponent;
use crate::flow::{Step, StepInvocation, StepOutcome, StepState};
use crate::status::ExecutionStatus;

/// Runs an agent on the flow's message thread. The step inputs feed the
/// agent's system prompt; its declared outputs become the step outputs.
#[derive(Debug, Clone)]
pub struct AgentExecutionStep {
    agent: Arc<Agent>,
}

impl AgentExecutionStep {
    pub fn new(agent: Agent) -> Self {
        Self::from_arc(Arc::new(agent))
    }

    pub fn from_arc(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }
}

impl Step for AgentExecutionStep {
    fn kind(&self) -> &'static str {
        "agent_execution"
    }

    fn inputs(&self) -> Vec<Property> {
        self.agent.input_descriptors()
    }

    fn outputs(&self) -> Vec<Property> {
        self.agent.output_descriptors()
    }

    fn may_suspend(&self) -> bool {
        self.agent.may_suspend()
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
                *state = StepState::Agent {
                    agent: Box::new(self.agent.new_agent_state(inputs)?),
                };
            }
            let StepState::Agent { agent } = state else {
                return Err(state.unexpected(name));
            };

            match self.agent.run(agent, scope).await? {
                ExecutionStatus::Finished { outputs, .. } => Ok(StepOutcome::next(outputs)),
                suspended => Ok(StepOutcome::Suspend(suspended)),
            }
        })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "agent_execution", "agent": self.agent.to_config() })
    }
}
