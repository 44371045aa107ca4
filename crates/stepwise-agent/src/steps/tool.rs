use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::message::ToolRequest;
use stepwise_core::property::Property;
use stepwise_core::traits::Tool;
use stepwise_core::types::ValueMap;
use stepwise_tools::execute_tool;

use crate::calls::{advance, Advance, PendingCall};
use crate::flow::{Step, StepInvocation, StepOutcome, StepState};
use crate::status::{Awaiting, ExecutionStatus};

pub const TOOL_OUTPUT: &str = "tool_output";

/// Calls one tool with the step inputs as arguments. Tool failures
/// propagate as execution errors.
#[derive(Clone)]
pub struct ToolExecutionStep {
    tool: Arc<dyn Tool>,
}

impl ToolExecutionStep {
    pub fn new(tool: impl Tool) -> Self {
        Self::from_arc(Arc::new(tool))
    }

    pub fn from_arc(tool: Arc<dyn Tool>) -> Self {
        Self { tool }
    }

    fn output(&self) -> Property {
        self.tool
            .output()
            .unwrap_or_else(|| Property::any(TOOL_OUTPUT))
    }

    fn complete(&self, value: Value) -> StepOutcome {
        let mut outputs = ValueMap::new();
        outputs.insert(self.output().name, value);
        StepOutcome::next(outputs)
    }
}

impl Step for ToolExecutionStep {
    fn kind(&self) -> &'static str {
        "tool_execution"
    }

    fn inputs(&self) -> Vec<Property> {
        self.tool.inputs()
    }

    fn outputs(&self) -> Vec<Property> {
        vec![self.output()]
    }

    fn may_suspend(&self) -> bool {
        self.tool.may_suspend()
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
            let tool = self.tool.as_ref();

            if matches!(state, StepState::Idle) {
                let request = ToolRequest::new(tool.name(), Value::Object(inputs));
                *state = StepState::AwaitingTool {
                    call: PendingCall::new(request),
                };
            }
            let StepState::AwaitingTool { call: pending } = state else {
                return Err(state.unexpected(name));
            };

            match advance(tool, pending, &mut scope).await? {
                Advance::Suspend(status) => Ok(StepOutcome::Suspend(status)),
                Advance::Client => Ok(StepOutcome::Suspend(ExecutionStatus::ToolRequest {
                    requests: vec![pending.request.clone()],
                    awaiting: Awaiting::Results,
                })),
                Advance::Ready => {
                    let ctx = pending.tool_context(tool, &scope);
                    let value = execute_tool(
                        tool,
                        &pending.request.id,
                        pending.request.args.clone(),
                        ctx,
                        Some(scope.ctx.events()),
                    )
                    .await?;
                    Ok(self.complete(value))
                }
                Advance::Done => match pending.result.take() {
                    Some(result) if result.is_error => Err(StepwiseError::ToolExecution {
                        tool: tool.name().to_string(),
                        message: result.content_text(),
                    }),
                    Some(result) => Ok(self.complete(result.content)),
                    None => Err(StepwiseError::StepFailed {
                        step: name.to_string(),
                        message: "tool call finished without a result".into(),
                    }),
                },
            }
        })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "tool_execution", "tool": self.tool.to_config() })
    }
}
