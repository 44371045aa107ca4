use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

use crate::component::ConversationalComponent;
use crate::flow::{Flow, Step, StepInvocation, StepOutcome, StepState};
use crate::status::ExecutionStatus;
use crate::variables::WriteOperation;

pub const EXCEPTION_KIND: &str = "exception_kind";
pub const EXCEPTION_MESSAGE: &str = "exception_message";
pub const CAUGHT_EXCEPTION: &str = "caught_exception";

/// Runs a flow and turns selected error kinds into branches. A caught kind
/// routes to the branch of the same name; with a catch-all, any other
/// catchable error routes to `caught_exception`. Everything else propagates.
#[derive(Debug, Clone)]
pub struct CatchExceptionStep {
    flow: Flow,
    caught: Vec<String>,
    catch_all: bool,
}

impl CatchExceptionStep {
    pub fn new(flow: Flow) -> Self {
        Self {
            flow,
            caught: Vec::new(),
            catch_all: false,
        }
    }

    /// Route errors whose `kind()` is `kind` to a branch named `kind`.
    pub fn catch(mut self, kind: impl Into<String>) -> Result<Self> {
        let kind = kind.into();
        if self.flow.exit_branches().contains(&kind) || kind == CAUGHT_EXCEPTION {
            return Err(StepwiseError::Config(format!(
                "catch: '{}' clashes with an existing branch",
                kind
            )));
        }
        if !self.caught.contains(&kind) {
            self.caught.push(kind);
        }
        Ok(self)
    }

    pub fn catch_all(mut self) -> Self {
        self.catch_all = true;
        self
    }

    fn caught_branch(&self, error: &StepwiseError) -> Option<String> {
        if !error.is_catchable() {
            return None;
        }
        let kind = error.kind();
        if self.caught.iter().any(|k| k == kind) {
            Some(kind.to_string())
        } else if self.catch_all {
            Some(CAUGHT_EXCEPTION.to_string())
        } else {
            None
        }
    }
}

impl Step for CatchExceptionStep {
    fn kind(&self) -> &'static str {
        "catch_exception"
    }

    fn inputs(&self) -> Vec<Property> {
        self.flow.inputs().to_vec()
    }

    fn outputs(&self) -> Vec<Property> {
        let mut outputs = vec![
            Property::string(EXCEPTION_KIND).with_default(json!("")),
            Property::string(EXCEPTION_MESSAGE).with_default(json!("")),
        ];
        outputs.extend(self.flow.outputs().iter().map(|o| o.clone().optional()));
        outputs
    }

    fn branches(&self) -> Vec<String> {
        let mut branches = self.flow.exit_branches().to_vec();
        branches.extend(self.caught.iter().cloned());
        if self.catch_all {
            branches.push(CAUGHT_EXCEPTION.to_string());
        }
        branches
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

            match self.flow.run(nested, scope).await {
                Ok(ExecutionStatus::Finished {
                    outputs,
                    exit_branch,
                }) => Ok(StepOutcome::branch(outputs, exit_branch)),
                Ok(suspended) => Ok(StepOutcome::Suspend(suspended)),
                Err(e) => match self.caught_branch(&e) {
                    Some(branch) => {
                        info!(step = name, kind = e.kind(), branch = %branch, "Caught error");
                        let mut outputs = ValueMap::new();
                        outputs.insert(EXCEPTION_KIND.into(), Value::String(e.kind().to_string()));
                        outputs.insert(EXCEPTION_MESSAGE.into(), Value::String(e.to_string()));
                        Ok(StepOutcome::branch(outputs, branch))
                    }
                    None => Err(e),
                },
            }
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "step_type": "catch_exception",
            "flow": self.flow.to_config(),
            "caught": self.caught,
            "catch_all": self.catch_all,
        })
    }
}
