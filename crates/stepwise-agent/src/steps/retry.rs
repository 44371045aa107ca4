use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{info, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

use crate::component::ConversationalComponent;
use crate::flow::{Flow, Step, StepInvocation, StepOutcome, StepState};
use crate::status::ExecutionStatus;
use crate::variables::WriteOperation;

pub const SUCCESS_BRANCH: &str = "success";
pub const FAILURE_BRANCH: &str = "failure";

/// Re-runs a flow that raised a catchable error, or that finished through
/// the designated failure branch, up to `max_retries` more times.
#[derive(Debug, Clone)]
pub struct RetryStep {
    flow: Flow,
    max_retries: usize,
    failure_branch: Option<String>,
}

impl RetryStep {
    pub fn new(flow: Flow, max_retries: usize) -> Self {
        Self {
            flow,
            max_retries,
            failure_branch: None,
        }
    }

    /// Treat finishing through `branch` as a failed attempt.
    pub fn with_failure_branch(mut self, branch: impl Into<String>) -> Result<Self> {
        let branch = branch.into();
        if !self.flow.exit_branches().contains(&branch) {
            return Err(StepwiseError::Config(format!(
                "retry: flow '{}' never exits through '{}'",
                self.flow.name(),
                branch
            )));
        }
        self.failure_branch = Some(branch);
        Ok(self)
    }
}

impl Step for RetryStep {
    fn kind(&self) -> &'static str {
        "retry"
    }

    fn inputs(&self) -> Vec<Property> {
        self.flow.inputs().to_vec()
    }

    fn outputs(&self) -> Vec<Property> {
        self.flow
            .outputs()
            .iter()
            .map(|o| o.clone().optional())
            .collect()
    }

    fn branches(&self) -> Vec<String> {
        vec![SUCCESS_BRANCH.to_string(), FAILURE_BRANCH.to_string()]
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
                mut scope,
                ..
            } = call;
            if matches!(state, StepState::Idle) {
                *state = StepState::SubFlow {
                    flow: Box::new(self.flow.new_flow_state(inputs.clone())?),
                    attempt: 0,
                };
            }

            loop {
                let StepState::SubFlow {
                    flow: nested,
                    attempt,
                } = &mut *state
                else {
                    return Err(state.unexpected(name));
                };

                let failure = match self.flow.run(nested, scope.reborrow()).await {
                    Ok(ExecutionStatus::Finished {
                        outputs,
                        exit_branch,
                    }) => {
                        if self.failure_branch.as_ref() != Some(&exit_branch) {
                            if *attempt > 0 {
                                info!(step = name, attempts = *attempt + 1, "Succeeded after retrying");
                            }
                            return Ok(StepOutcome::branch(outputs, SUCCESS_BRANCH));
                        }
                        format!("finished through '{}'", exit_branch)
                    }
                    Ok(suspended) => return Ok(StepOutcome::Suspend(suspended)),
                    Err(e) if e.is_catchable() => e.to_string(),
                    Err(e) => return Err(e),
                };

                if *attempt >= self.max_retries {
                    warn!(step = name, attempts = *attempt + 1, error = %failure, "Giving up");
                    return Ok(StepOutcome::branch(ValueMap::new(), FAILURE_BRANCH));
                }
                *attempt += 1;
                warn!(step = name, attempt = *attempt, max_retries = self.max_retries, error = %failure, "Retrying");
                scope.ctx.check_interrupts()?;
                **nested = self.flow.new_flow_state(inputs.clone())?;
            }
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "step_type": "retry",
            "flow": self.flow.to_config(),
            "max_retries": self.max_retries,
            "failure_branch": self.failure_branch,
        })
    }
}
