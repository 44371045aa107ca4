use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::traits::Tool;
use stepwise_core::types::{ToolContext, ToolOutput};

use crate::component::ConversationalComponent;
use crate::context::ExecutionContext;
use crate::flow::Flow;
use crate::status::ExecutionStatus;

/// A non-suspending flow exposed as a tool. Flow inputs are the tool
/// arguments; a single flow output is returned as is, several as an object.
#[derive(Clone)]
pub struct FlowTool {
    flow: Flow,
    description: String,
    ctx: ExecutionContext,
}

impl FlowTool {
    pub fn new(flow: Flow) -> Result<Self> {
        if let Some(step) = flow.suspending_step() {
            return Err(StepwiseError::Config(format!(
                "flow '{}' cannot be a tool: step '{}' may suspend",
                flow.name(),
                step
            )));
        }
        let description = flow.description().to_string();
        Ok(Self {
            flow,
            description,
            ctx: ExecutionContext::new(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Listeners, interrupts and limits for the nested runs. Every call
    /// gets its own clock and usage counter.
    pub fn with_context(mut self, ctx: ExecutionContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    async fn run(&self, args: Value, tool_ctx: &ToolContext) -> Result<Value> {
        let inputs = match args {
            Value::Object(map) => map,
            Value::Null => Default::default(),
            other => {
                return Err(StepwiseError::validation(
                    self.flow.name(),
                    format!("expected an object of arguments, got {}", other),
                ))
            }
        };
        let mut conversation = self.flow.start_conversation_with(inputs)?;
        let ctx = self.ctx.fresh_run();
        let status = self.flow.execute(&mut conversation, &ctx).await;
        let spent = ctx.usage();
        if spent.total() > 0 {
            tool_ctx.record_usage(spent);
        }
        let status = status?;
        let ExecutionStatus::Finished { mut outputs, .. } = status else {
            return Err(StepwiseError::ToolExecution {
                tool: self.flow.name().to_string(),
                message: format!("flow suspended with {}", status.tag()),
            });
        };
        debug!(tool = %self.flow.name(), outputs = outputs.len(), "Flow tool finished");

        let declared = self.flow.outputs();
        if declared.len() == 1 {
            return Ok(outputs.remove(&declared[0].name).unwrap_or(Value::Null));
        }
        Ok(Value::Object(outputs))
    }
}

impl std::fmt::Debug for FlowTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTool").field("flow", &self.flow.name()).finish()
    }
}

impl Tool for FlowTool {
    fn name(&self) -> &str {
        self.flow.name()
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn inputs(&self) -> Vec<Property> {
        self.flow.inputs().to_vec()
    }

    fn output(&self) -> Option<Property> {
        match self.flow.outputs() {
            [single] => Some(single.clone()),
            _ => None,
        }
    }

    fn execute(&self, args: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move { self.run(args, &ctx).await.map(ToolOutput::Value) })
    }

    fn to_config(&self) -> Value {
        json!({
            "tool_type": "flow",
            "name": self.flow.name(),
            "description": self.description,
            "flow": self.flow.to_config(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use stepwise_test_utils::ScriptedLlm;

    use crate::interrupt::{TimeoutInterrupt, TokenBudgetInterrupt};
    use crate::model::LlmHandle;
    use crate::steps::{InputMessageStep, PromptExecutionStep, TemplateRenderingStep};

    fn greeting_flow() -> Flow {
        Flow::builder("greet")
            .description("Greets someone")
            .step("render", TemplateRenderingStep::new("Hello, {{ name }}!"))
            .end("render")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_output_is_unwrapped() {
        let tool = FlowTool::new(greeting_flow()).unwrap();
        assert_eq!(tool.name(), "greet");
        assert_eq!(tool.description(), "Greets someone");

        let out = tool
            .run(json!({"name": "Ada"}), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!("Hello, Ada!"));
    }

    #[tokio::test]
    async fn test_timeout_counts_from_each_call() {
        let ctx = ExecutionContext::new().with_interrupt(TimeoutInterrupt::new(Duration::from_millis(200)));
        let tool = FlowTool::new(greeting_flow()).unwrap().with_context(ctx);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let out = tool
            .run(json!({"name": "Ada"}), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!("Hello, Ada!"));
    }

    #[tokio::test]
    async fn test_nested_usage_charged_to_caller() {
        let llm = Arc::new(ScriptedLlm::new().text("a haiku").with_usage(7, 3));
        let flow = Flow::builder("poet")
            .step(
                "write",
                PromptExecutionStep::new(LlmHandle::new("scripted", llm), "Write about {{ topic }}"),
            )
            .end("write")
            .build()
            .unwrap();
        let tool = FlowTool::new(flow).unwrap();

        let caller = ExecutionContext::new().with_interrupt(TokenBudgetInterrupt::new(10));
        let tool_ctx = ToolContext::new("c1").with_usage_sink(Arc::new(caller.clone()));
        let out = tool.run(json!({"topic": "rust"}), &tool_ctx).await.unwrap();

        assert_eq!(out, json!("a haiku"));
        assert_eq!(caller.usage().total(), 10);
        assert!(matches!(
            caller.check_interrupts(),
            Err(StepwiseError::Interrupted(_))
        ));
    }

    #[test]
    fn test_suspending_flow_rejected() {
        let flow = Flow::builder("ask")
            .step("ask", InputMessageStep::new())
            .end("ask")
            .build()
            .unwrap();
        assert!(matches!(FlowTool::new(flow), Err(StepwiseError::Config(_))));
    }
}
