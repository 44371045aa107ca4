//! Rebuilds components from their `to_config()` trees. Executable parts
//! (tools, LLM clients, datastores) are looked up by name or id; step
//! types are loaded through one loader per `step_type` tag.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use stepwise_core::config::AppConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::message::MessageType;
use stepwise_core::property::Property;
use stepwise_core::traits::{Datastore, LlmClient, Tool};
use stepwise_tools::{ClientTool, RemoteTool, ToolRegistry};

use crate::agent::{Agent, CallerInputMode, ToolErrorPolicy};
use crate::component::ConversationalComponent;
use crate::flow::{ControlFlowEdge, DataFlowEdge, Flow, Step};
use crate::flow_tool::FlowTool;
use crate::model::LlmHandle;
use crate::multi::{HandoffMode, ManagerWorkers, Swarm};
use crate::steps::{
    AgentExecutionStep, BranchingStep, CatchExceptionStep, Choice, ChoiceSelectionStep, EndStep,
    FlowExecutionStep, InputMessageStep, MapStep, OutputMessageStep, ParallelFlowExecutionStep,
    PromptExecutionStep, RetryStep, TemplateRenderingStep, ToolExecutionStep,
    TransformMessagesStep, VariableReadStep, VariableWriteStep,
};
use crate::transforms::{
    ConversationSummarizationTransform, MessageSummarizationTransform, MessageTransform,
    TokenBudgetTransform,
};
use crate::variables::WriteOperation;

/// Builds a step from its config.
pub type StepLoader =
    Arc<dyn Fn(&Value, &ComponentRegistry) -> Result<Arc<dyn Step>> + Send + Sync>;

/// Everything needed to turn a config tree back into live components.
/// Built-in step types are registered by [`ComponentRegistry::new`];
/// user-defined steps add their own tag with [`with_step_loader`](Self::with_step_loader).
#[derive(Clone)]
pub struct ComponentRegistry {
    tools: ToolRegistry,
    llms: HashMap<String, LlmHandle>,
    datastores: HashMap<String, Arc<dyn Datastore>>,
    step_loaders: HashMap<String, StepLoader>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            tools: ToolRegistry::new(),
            llms: HashMap::new(),
            datastores: HashMap::new(),
            step_loaders: HashMap::new(),
        };
        registry.register_builtin_steps();
        registry
    }

    pub fn with_tool(mut self, tool: impl Tool) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register_arc(tool);
        self
    }

    pub fn with_llm(mut self, llm: LlmHandle) -> Self {
        self.llms.insert(llm.id.clone(), llm);
        self
    }

    /// Register `primary` under `id` with the retry and fallback setup
    /// from `config`.
    pub fn with_configured_llm(
        self,
        id: impl Into<String>,
        primary: Arc<dyn LlmClient>,
        fallbacks: Vec<Arc<dyn LlmClient>>,
        config: &AppConfig,
    ) -> Self {
        self.with_llm(LlmHandle::from_config(id, primary, fallbacks, config))
    }

    pub fn with_datastore(mut self, id: impl Into<String>, datastore: Arc<dyn Datastore>) -> Self {
        self.datastores.insert(id.into(), datastore);
        self
    }

    /// Register (or replace) the loader for a `step_type` tag.
    pub fn with_step_loader<F>(mut self, tag: impl Into<String>, loader: F) -> Self
    where
        F: Fn(&Value, &ComponentRegistry) -> Result<Arc<dyn Step>> + Send + Sync + 'static,
    {
        self.step_loaders.insert(tag.into(), Arc::new(loader));
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn llm(&self, id: &str) -> Result<LlmHandle> {
        self.llms
            .get(id)
            .cloned()
            .ok_or_else(|| StepwiseError::Deserialization(format!("unknown llm '{}'", id)))
    }

    pub fn datastore(&self, id: &str) -> Result<Arc<dyn Datastore>> {
        self.datastores
            .get(id)
            .cloned()
            .ok_or_else(|| StepwiseError::Deserialization(format!("unknown datastore '{}'", id)))
    }

    /// Any component, dispatched on `component_type`.
    pub fn load_component(&self, config: &Value) -> Result<Arc<dyn ConversationalComponent>> {
        let component_type: String = field(config, "component_type", "component")?;
        debug!(component_type = %component_type, "Loading component");
        let component: Arc<dyn ConversationalComponent> = match component_type.as_str() {
            "flow" => Arc::new(self.load_flow(config)?),
            "agent" => Arc::new(self.load_agent(config)?),
            "swarm" => Arc::new(self.load_swarm(config)?),
            "manager_workers" => Arc::new(self.load_manager_workers(config)?),
            other => {
                return Err(StepwiseError::Deserialization(format!(
                    "unknown component_type '{}'",
                    other
                )))
            }
        };
        Ok(component)
    }

    pub fn load_flow(&self, config: &Value) -> Result<Flow> {
        let name: String = field(config, "name", "flow")?;
        let owner = format!("flow '{}'", name);
        let mut builder = Flow::builder(&name)
            .description(opt_field::<String>(config, "description", &owner)?.unwrap_or_default());

        let steps: Vec<Value> = field(config, "steps", &owner)?;
        for entry in &steps {
            let step_name: String = field(entry, "name", &owner)?;
            let step = entry
                .get("step")
                .ok_or_else(|| missing(&owner, &format!("step '{}' config", step_name)))?;
            builder = builder.step_arc(step_name, self.load_step(step)?);
        }
        if let Some(begin) = opt_field::<String>(config, "begin", &owner)? {
            builder = builder.begin(begin);
        }
        for edge in opt_field::<Vec<ControlFlowEdge>>(config, "control_edges", &owner)?.unwrap_or_default() {
            builder = builder.edge(edge);
        }
        for edge in opt_field::<Vec<DataFlowEdge>>(config, "data_edges", &owner)?.unwrap_or_default() {
            builder = builder.data(edge);
        }
        for variable in opt_field::<Vec<Property>>(config, "variables", &owner)?.unwrap_or_default() {
            builder = builder.variable(variable);
        }
        if let Some(inputs) = opt_field::<Vec<Property>>(config, "inputs", &owner)? {
            builder = builder.inputs(inputs);
        }
        if let Some(outputs) = opt_field::<Vec<Property>>(config, "outputs", &owner)? {
            builder = builder.outputs(outputs);
        }
        builder.build()
    }

    pub fn load_step(&self, config: &Value) -> Result<Arc<dyn Step>> {
        let tag: String = field(config, "step_type", "step")?;
        let loader = self
            .step_loaders
            .get(&tag)
            .ok_or_else(|| StepwiseError::Deserialization(format!("unknown step_type '{}'", tag)))?;
        loader(config, self)
    }

    pub fn load_agent(&self, config: &Value) -> Result<Agent> {
        let name: String = field(config, "name", "agent")?;
        let owner = format!("agent '{}'", name);
        let llm_id: String = field(config, "llm", &owner)?;
        let mut builder = Agent::builder(&name, self.llm(&llm_id)?)
            .description(opt_field::<String>(config, "description", &owner)?.unwrap_or_default())
            .system_prompt(opt_field::<String>(config, "system_prompt", &owner)?.unwrap_or_default());

        for tool in opt_field::<Vec<Value>>(config, "tools", &owner)?.unwrap_or_default() {
            builder = builder.tool_arc(self.load_tool(&tool)?);
        }
        for input in opt_field::<Vec<Property>>(config, "inputs", &owner)?.unwrap_or_default() {
            builder = builder.input(input);
        }
        if let Some(outputs) = opt_field::<Vec<Property>>(config, "outputs", &owner)? {
            builder = builder.outputs(outputs);
        }
        if let Some(mode) = opt_field::<CallerInputMode>(config, "caller_input_mode", &owner)? {
            builder = builder.caller_input_mode(mode);
        }
        if let Some(max) = opt_field::<usize>(config, "max_iterations", &owner)? {
            builder = builder.max_iterations(max);
        }
        if let Some(max) = opt_field::<usize>(config, "max_validation_retries", &owner)? {
            builder = builder.max_validation_retries(max);
        }
        if let Some(enabled) = opt_field::<bool>(config, "parallel_tool_calls", &owner)? {
            builder = builder.parallel_tool_calls(enabled);
        }
        if let Some(max) = opt_field::<usize>(config, "max_tool_output_tokens", &owner)? {
            builder = builder.max_tool_output_tokens(max);
        }
        if let Some(policy) = opt_field::<ToolErrorPolicy>(config, "tool_error_policy", &owner)? {
            builder = builder.tool_error_policy(policy);
        }
        for transform in opt_field::<Vec<Value>>(config, "transforms", &owner)?.unwrap_or_default() {
            builder = builder.transform_arc(self.load_transform(&transform)?);
        }
        builder.build()
    }

    pub fn load_swarm(&self, config: &Value) -> Result<Swarm> {
        let name: String = field(config, "name", "swarm")?;
        let owner = format!("swarm '{}'", name);
        let mut builder = Swarm::builder(&name)
            .description(opt_field::<String>(config, "description", &owner)?.unwrap_or_default());
        let agents: Vec<Value> = field(config, "agents", &owner)?;
        for agent in &agents {
            builder = builder.agent(self.load_agent(agent)?);
        }
        for (caller, callee) in
            opt_field::<Vec<(String, String)>>(config, "relationships", &owner)?.unwrap_or_default()
        {
            builder = builder.relationship(caller, callee);
        }
        if let Some(mode) = opt_field::<HandoffMode>(config, "handoff", &owner)? {
            builder = builder.handoff(mode);
        }
        if let Some(first) = opt_field::<String>(config, "first", &owner)? {
            builder = builder.first(first);
        }
        builder.build()
    }

    pub fn load_manager_workers(&self, config: &Value) -> Result<ManagerWorkers> {
        let name: String = field(config, "name", "manager_workers")?;
        let owner = format!("manager-workers '{}'", name);
        let manager = config
            .get("manager")
            .ok_or_else(|| missing(&owner, "manager"))?;
        let workers = field::<Vec<Value>>(config, "workers", &owner)?
            .iter()
            .map(|w| self.load_component(w))
            .collect::<Result<Vec<_>>>()?;
        Ok(ManagerWorkers::new(name, self.load_agent(manager)?, workers)?
            .with_description(opt_field::<String>(config, "description", &owner)?.unwrap_or_default()))
    }

    /// A tool by `tool_type`. Server tools must be registered; client and
    /// remote tools are rebuilt from config unless a tool with that name is
    /// registered (e.g. a remote tool with an auth provider attached).
    pub fn load_tool(&self, config: &Value) -> Result<Arc<dyn Tool>> {
        let name: String = field(config, "name", "tool")?;
        let tool_type = opt_field::<String>(config, "tool_type", "tool")?
            .unwrap_or_else(|| "server".to_string());
        if tool_type != "flow" {
            if let Some(tool) = self.tools.get(&name) {
                return Ok(tool);
            }
        }
        match tool_type.as_str() {
            "server" => Err(StepwiseError::ToolNotFound(name)),
            "client" => Ok(Arc::new(ClientTool::from_config(config)?)),
            "remote" => Ok(Arc::new(RemoteTool::from_config(config)?)),
            "flow" => {
                let flow = config
                    .get("flow")
                    .ok_or_else(|| missing(&format!("tool '{}'", name), "flow"))?;
                let mut tool = FlowTool::new(self.load_flow(flow)?)?;
                if let Some(description) = opt_field::<String>(config, "description", "tool")? {
                    tool = tool.with_description(description);
                }
                Ok(Arc::new(tool))
            }
            other => Err(StepwiseError::Deserialization(format!(
                "tool '{}': unknown tool_type '{}'",
                name, other
            ))),
        }
    }

    pub fn load_transform(&self, config: &Value) -> Result<Arc<dyn MessageTransform>> {
        let tag: String = field(config, "transform_type", "transform")?;
        let owner = format!("transform '{}'", tag);
        let transform: Arc<dyn MessageTransform> = match tag.as_str() {
            "message_summarization" => {
                let llm = self.llm(&field::<String>(config, "llm", &owner)?)?;
                let mut transform =
                    MessageSummarizationTransform::new(llm, field(config, "max_message_tokens", &owner)?);
                if let Some(cache) = opt_field::<String>(config, "cache", &owner)? {
                    let datastore = self.datastore(&cache)?;
                    transform = transform.with_cache(cache, datastore);
                }
                Arc::new(transform)
            }
            "conversation_summarization" => {
                let llm = self.llm(&field::<String>(config, "llm", &owner)?)?;
                let mut transform =
                    ConversationSummarizationTransform::new(llm, field(config, "max_tokens", &owner)?);
                if let Some(keep) = opt_field::<usize>(config, "keep_recent", &owner)? {
                    transform = transform.keep_recent(keep);
                }
                Arc::new(transform)
            }
            "token_budget" => {
                let mut transform = TokenBudgetTransform::new(field(config, "max_tokens", &owner)?);
                if let Some(keep) = opt_field::<usize>(config, "keep_recent", &owner)? {
                    transform = transform.keep_recent(keep);
                }
                Arc::new(transform)
            }
            other => {
                return Err(StepwiseError::Deserialization(format!(
                    "unknown transform_type '{}'",
                    other
                )))
            }
        };
        Ok(transform)
    }

    fn register_builtin_steps(&mut self) {
        let loaders: Vec<(&str, StepLoader)> = vec![
            ("end", loader(|c, _| {
                let branch: String = field(c, "branch", "end step")?;
                Ok(Arc::new(EndStep::named(branch)) as Arc<dyn Step>)
            })),
            ("input_message", loader(|c, _| {
                let step = match opt_field::<String>(c, "message_template", "input_message step")? {
                    Some(template) => InputMessageStep::with_prompt(template),
                    None => InputMessageStep::new(),
                };
                Ok(Arc::new(step) as Arc<dyn Step>)
            })),
            ("output_message", loader(|c, _| {
                let owner = "output_message step";
                let mut step = OutputMessageStep::new(field::<String>(c, "template", owner)?);
                if let Some(message_type) = opt_field::<MessageType>(c, "message_type", owner)? {
                    step = step.with_message_type(message_type);
                }
                Ok(Arc::new(step) as Arc<dyn Step>)
            })),
            ("template_rendering", loader(|c, _| {
                let template: String = field(c, "template", "template_rendering step")?;
                Ok(Arc::new(TemplateRenderingStep::new(template)) as Arc<dyn Step>)
            })),
            ("tool_execution", loader(|c, r| {
                let tool = c.get("tool").ok_or_else(|| missing("tool_execution step", "tool"))?;
                Ok(Arc::new(ToolExecutionStep::from_arc(r.load_tool(tool)?)) as Arc<dyn Step>)
            })),
            ("prompt_execution", loader(|c, r| {
                let owner = "prompt_execution step";
                let llm = r.llm(&field::<String>(c, "llm", owner)?)?;
                let step = PromptExecutionStep::new(llm, field::<String>(c, "template", owner)?)
                    .with_outputs(opt_field(c, "outputs", owner)?.unwrap_or_default());
                Ok(Arc::new(step) as Arc<dyn Step>)
            })),
            ("branching", loader(|c, _| {
                let mapping: std::collections::BTreeMap<String, String> =
                    field(c, "mapping", "branching step")?;
                Ok(Arc::new(BranchingStep::new(mapping)) as Arc<dyn Step>)
            })),
            ("choice_selection", loader(|c, r| {
                let owner = "choice_selection step";
                let llm = r.llm(&field::<String>(c, "llm", owner)?)?;
                let mut step = ChoiceSelectionStep::new(llm, field::<Vec<Choice>>(c, "choices", owner)?)?;
                if let Some(template) = opt_field::<String>(c, "template", owner)? {
                    step = step.with_template(template);
                }
                Ok(Arc::new(step) as Arc<dyn Step>)
            })),
            ("variable_read", loader(|c, _| {
                let variable: Property = field(c, "variable", "variable_read step")?;
                Ok(Arc::new(VariableReadStep::new(variable)) as Arc<dyn Step>)
            })),
            ("variable_write", loader(|c, _| {
                let owner = "variable_write step";
                let variable: Property = field(c, "variable", owner)?;
                let operation = opt_field::<WriteOperation>(c, "operation", owner)?
                    .unwrap_or(WriteOperation::Overwrite);
                Ok(Arc::new(VariableWriteStep::new(variable, operation)?) as Arc<dyn Step>)
            })),
            ("flow_execution", loader(|c, r| {
                let flow = r.load_flow(sub_flow(c, "flow_execution step")?)?;
                Ok(Arc::new(FlowExecutionStep::new(flow)) as Arc<dyn Step>)
            })),
            ("map", loader(|c, r| {
                let owner = "map step";
                let flow = r.load_flow(sub_flow(c, owner)?)?;
                let item_input: String = field(c, "item_input", owner)?;
                let step = if opt_field::<bool>(c, "parallel", owner)?.unwrap_or(false) {
                    MapStep::parallel(flow, item_input)?
                } else {
                    MapStep::new(flow, item_input)?
                };
                Ok(Arc::new(step) as Arc<dyn Step>)
            })),
            ("parallel_flow_execution", loader(|c, r| {
                let flows = field::<Vec<Value>>(c, "flows", "parallel_flow_execution step")?
                    .iter()
                    .map(|f| r.load_flow(f))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arc::new(ParallelFlowExecutionStep::new(flows)?) as Arc<dyn Step>)
            })),
            ("retry", loader(|c, r| {
                let owner = "retry step";
                let flow = r.load_flow(sub_flow(c, owner)?)?;
                let mut step = RetryStep::new(flow, field(c, "max_retries", owner)?);
                if let Some(branch) = opt_field::<String>(c, "failure_branch", owner)? {
                    step = step.with_failure_branch(branch)?;
                }
                Ok(Arc::new(step) as Arc<dyn Step>)
            })),
            ("catch_exception", loader(|c, r| {
                let owner = "catch_exception step";
                let mut step = CatchExceptionStep::new(r.load_flow(sub_flow(c, owner)?)?);
                for kind in opt_field::<Vec<String>>(c, "caught", owner)?.unwrap_or_default() {
                    step = step.catch(kind)?;
                }
                if opt_field::<bool>(c, "catch_all", owner)?.unwrap_or(false) {
                    step = step.catch_all();
                }
                Ok(Arc::new(step) as Arc<dyn Step>)
            })),
            ("agent_execution", loader(|c, r| {
                let agent = c.get("agent").ok_or_else(|| missing("agent_execution step", "agent"))?;
                Ok(Arc::new(AgentExecutionStep::new(r.load_agent(agent)?)) as Arc<dyn Step>)
            })),
            ("transform_messages", loader(|c, r| {
                let transform = c
                    .get("transform")
                    .ok_or_else(|| missing("transform_messages step", "transform"))?;
                Ok(Arc::new(TransformMessagesStep::from_arc(r.load_transform(transform)?)) as Arc<dyn Step>)
            })),
        ];
        for (tag, loader) in loaders {
            self.step_loaders.insert(tag.to_string(), loader);
        }
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut steps: Vec<&str> = self.step_loaders.keys().map(String::as_str).collect();
        steps.sort_unstable();
        f.debug_struct("ComponentRegistry")
            .field("tools", &self.tools.list())
            .field("llms", &self.llms.keys().collect::<Vec<_>>())
            .field("datastores", &self.datastores.keys().collect::<Vec<_>>())
            .field("steps", &steps)
            .finish()
    }
}

fn loader<F>(f: F) -> StepLoader
where
    F: Fn(&Value, &ComponentRegistry) -> Result<Arc<dyn Step>> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn missing(owner: &str, key: &str) -> StepwiseError {
    StepwiseError::Deserialization(format!("{}: missing '{}'", owner, key))
}

fn field<T: DeserializeOwned>(config: &Value, key: &str, owner: &str) -> Result<T> {
    opt_field(config, key, owner)?.ok_or_else(|| missing(owner, key))
}

/// `None` when the key is absent or null.
fn opt_field<T: DeserializeOwned>(config: &Value, key: &str, owner: &str) -> Result<Option<T>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| StepwiseError::Deserialization(format!("{}: '{}': {}", owner, key, e))),
    }
}

fn sub_flow<'a>(config: &'a Value, owner: &str) -> Result<&'a Value> {
    config.get("flow").ok_or_else(|| missing(owner, "flow"))
}
