//! LLM agents: a tool-calling loop over one message thread.

mod agent_loop;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use stepwise_core::config::AgentConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::{coerce_values, object_schema, Property};
use stepwise_core::traits::Tool;
use stepwise_core::types::{ToolDefinition, ValueMap};

use crate::calls::PendingCall;
use crate::component::{ConversationalComponent, Scope};
use crate::conversation::ComponentState;
use crate::model::LlmHandle;
use crate::status::ExecutionStatus;
use crate::steps::template_inputs;
use crate::transforms::MessageTransform;

pub(crate) use agent_loop::AgentStop;

/// Tool the LLM calls to hand back the declared outputs.
pub const SUBMIT_RESULT_TOOL: &str = "submit_result";

/// When an agent hands the turn back to its caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallerInputMode {
    /// Every plain message goes to the user.
    Always,
    /// Never yields; runs to a result or fails.
    Never,
    /// Yields plain messages unless they already carry the outputs.
    #[default]
    AsNeeded,
}

/// What a failing server tool does to the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorPolicy {
    #[default]
    Propagate,
    /// Hand the error text to the LLM as the tool result.
    ReportToLlm,
}

/// Persisted loop state of one agent on one thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub inputs: ValueMap,
    /// LLM calls since the caller last had the turn.
    #[serde(default)]
    pub iterations: usize,
    #[serde(default)]
    pub validation_failures: usize,
    /// Tool calls of the latest LLM turn, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PendingCall>,
    /// Outputs accepted from `submit_result`, returned once the batch is flushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<ValueMap>,
    /// Message count when the agent yielded to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_user: Option<usize>,
    #[serde(default)]
    pub finished: bool,
}

impl AgentState {
    pub fn new(inputs: ValueMap) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    /// Resolve a call the agent handed to its owner.
    pub(crate) fn complete_call(&mut self, result: stepwise_core::message::ToolResult) -> Result<()> {
        let call = self
            .pending
            .iter_mut()
            .find(|c| c.id() == result.request_id)
            .ok_or_else(|| {
                StepwiseError::Conversation(format!(
                    "no pending call with id '{}'",
                    result.request_id
                ))
            })?;
        call.finish(result);
        Ok(())
    }

    /// Drain the current batch in declared order. Calls without a result
    /// are reported as skipped.
    pub(crate) fn abandon_pending(&mut self) -> Vec<stepwise_core::message::ToolResult> {
        self.pending
            .drain(..)
            .map(|call| {
                let id = call.id().to_string();
                call.result
                    .unwrap_or_else(|| stepwise_core::message::ToolResult::skipped(id))
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct Agent {
    name: String,
    description: String,
    llm: LlmHandle,
    system_prompt: String,
    tools: Vec<Arc<dyn Tool>>,
    inputs: Vec<Property>,
    outputs: Vec<Property>,
    caller_input_mode: CallerInputMode,
    max_iterations: usize,
    max_validation_retries: usize,
    parallel_tool_calls: bool,
    max_tool_output_tokens: usize,
    tool_error_policy: ToolErrorPolicy,
    transforms: Vec<Arc<dyn MessageTransform>>,
}

impl Agent {
    pub fn builder(name: impl Into<String>, llm: LlmHandle) -> AgentBuilder {
        AgentBuilder::new(name, llm)
    }

    pub fn llm(&self) -> &LlmHandle {
        &self.llm
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn inputs(&self) -> &[Property] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Property] {
        &self.outputs
    }

    pub fn caller_input_mode(&self) -> CallerInputMode {
        self.caller_input_mode
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn new_agent_state(&self, inputs: ValueMap) -> Result<AgentState> {
        Ok(AgentState::new(coerce_values(&self.inputs, inputs, &self.name)?))
    }

    fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    fn submit_result_definition(&self) -> Option<ToolDefinition> {
        if self.outputs.is_empty() {
            return None;
        }
        Some(ToolDefinition {
            name: SUBMIT_RESULT_TOOL.to_string(),
            description: "Submit the final result of your task. Call this exactly once, \
                          when you have every value it asks for."
                .to_string(),
            input_schema: object_schema(&self.outputs),
        })
    }

    /// Run until the agent finishes or needs its caller.
    pub async fn run(&self, state: &mut AgentState, scope: Scope<'_>) -> Result<ExecutionStatus> {
        match self.run_loop(state, scope, &[]).await? {
            AgentStop::Status(status) => Ok(status),
            AgentStop::Delegate(request) => Err(StepwiseError::ToolNotFound(request.name)),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("llm", &self.llm)
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("outputs", &self.outputs)
            .field("caller_input_mode", &self.caller_input_mode)
            .finish()
    }
}

impl ConversationalComponent for Agent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &'static str {
        "agent"
    }

    fn input_descriptors(&self) -> Vec<Property> {
        self.inputs.clone()
    }

    fn output_descriptors(&self) -> Vec<Property> {
        self.outputs.clone()
    }

    fn may_suspend(&self) -> bool {
        self.caller_input_mode != CallerInputMode::Never || self.tools.iter().any(|t| t.may_suspend())
    }

    fn new_state(&self, inputs: ValueMap) -> Result<ComponentState> {
        Ok(ComponentState::Agent(self.new_agent_state(inputs)?))
    }

    fn resume<'a>(
        &'a self,
        state: &'a mut ComponentState,
        scope: Scope<'a>,
    ) -> BoxFuture<'a, Result<ExecutionStatus>> {
        Box::pin(async move {
            let ComponentState::Agent(agent) = state else {
                return Err(state.mismatch("agent"));
            };
            self.run(agent, scope).await
        })
    }

    fn to_config(&self) -> Value {
        let tools: Vec<Value> = self.tools.iter().map(|t| t.to_config()).collect();
        let transforms: Vec<Value> = self.transforms.iter().map(|t| t.to_config()).collect();
        json!({
            "component_type": "agent",
            "name": self.name,
            "description": self.description,
            "llm": self.llm.id,
            "system_prompt": self.system_prompt,
            "tools": tools,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "caller_input_mode": self.caller_input_mode,
            "max_iterations": self.max_iterations,
            "max_validation_retries": self.max_validation_retries,
            "parallel_tool_calls": self.parallel_tool_calls,
            "max_tool_output_tokens": self.max_tool_output_tokens,
            "tool_error_policy": self.tool_error_policy,
            "transforms": transforms,
        })
    }
}

pub struct AgentBuilder {
    agent: Agent,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>, llm: LlmHandle) -> Self {
        let defaults = AgentConfig::default();
        Self {
            agent: Agent {
                name: name.into(),
                description: String::new(),
                llm,
                system_prompt: String::new(),
                tools: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                caller_input_mode: CallerInputMode::default(),
                max_iterations: defaults.max_iterations,
                max_validation_retries: defaults.max_validation_retries,
                parallel_tool_calls: defaults.parallel_tool_calls,
                max_tool_output_tokens: defaults.max_tool_output_tokens,
                tool_error_policy: ToolErrorPolicy::default(),
                transforms: Vec::new(),
            },
        }
    }

    /// Limits taken from the `[agent]` config section.
    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.agent.max_iterations = config.max_iterations;
        self.agent.max_validation_retries = config.max_validation_retries;
        self.agent.parallel_tool_calls = config.parallel_tool_calls;
        self.agent.max_tool_output_tokens = config.max_tool_output_tokens;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.agent.description = description.into();
        self
    }

    /// System prompt template; its placeholders become agent inputs.
    pub fn system_prompt(mut self, template: impl Into<String>) -> Self {
        self.agent.system_prompt = template.into();
        self
    }

    pub fn tool(self, tool: impl Tool) -> Self {
        self.tool_arc(Arc::new(tool))
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.agent.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.agent.tools.extend(tools);
        self
    }

    pub fn input(mut self, property: Property) -> Self {
        self.agent.inputs.push(property);
        self
    }

    pub fn output(mut self, property: Property) -> Self {
        self.agent.outputs.push(property);
        self
    }

    pub fn outputs(mut self, outputs: Vec<Property>) -> Self {
        self.agent.outputs = outputs;
        self
    }

    pub fn caller_input_mode(mut self, mode: CallerInputMode) -> Self {
        self.agent.caller_input_mode = mode;
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.agent.max_iterations = max;
        self
    }

    pub fn max_validation_retries(mut self, max: usize) -> Self {
        self.agent.max_validation_retries = max;
        self
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.agent.parallel_tool_calls = enabled;
        self
    }

    pub fn max_tool_output_tokens(mut self, max: usize) -> Self {
        self.agent.max_tool_output_tokens = max;
        self
    }

    pub fn tool_error_policy(mut self, policy: ToolErrorPolicy) -> Self {
        self.agent.tool_error_policy = policy;
        self
    }

    pub fn transform(self, transform: impl MessageTransform) -> Self {
        self.transform_arc(Arc::new(transform))
    }

    pub fn transform_arc(mut self, transform: Arc<dyn MessageTransform>) -> Self {
        self.agent.transforms.push(transform);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let mut agent = self.agent;
        if agent.max_iterations == 0 {
            return Err(StepwiseError::Config(format!(
                "agent '{}': max_iterations must be at least 1",
                agent.name
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &agent.tools {
            if tool.name() == SUBMIT_RESULT_TOOL {
                return Err(StepwiseError::Config(format!(
                    "agent '{}': tool name '{}' is reserved",
                    agent.name, SUBMIT_RESULT_TOOL
                )));
            }
            if !seen.insert(tool.name().to_string()) {
                return Err(StepwiseError::Config(format!(
                    "agent '{}': duplicate tool '{}'",
                    agent.name,
                    tool.name()
                )));
            }
        }

        for placeholder in template_inputs(&agent.system_prompt) {
            if !agent.inputs.iter().any(|p| p.name == placeholder.name) {
                agent.inputs.push(placeholder);
            }
        }
        Ok(agent)
    }
}
