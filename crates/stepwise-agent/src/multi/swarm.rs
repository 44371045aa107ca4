use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::ExecutionEvent;
use stepwise_core::message::{Message, ToolRequest, ToolResult};
use stepwise_core::property::{object_schema, Property};
use stepwise_core::types::{ToolDefinition, ValueMap};

use super::{answer, Thread};
use crate::agent::{Agent, AgentState, AgentStop};
use crate::component::{ConversationalComponent, Scope};
use crate::conversation::ComponentState;
use crate::status::ExecutionStatus;

pub const SEND_MESSAGE_TOOL: &str = "send_message";
pub const HANDOFF_TOOL: &str = "handoff_conversation";

/// Whether agents may hand the human-facing conversation to a callee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandoffMode {
    /// Only `send_message`.
    Never,
    /// Both tools; hand off when the callee can finish the request alone.
    #[default]
    Optional,
    /// Only `handoff_conversation`.
    Always,
}

impl HandoffMode {
    fn allows_send(self) -> bool {
        self != HandoffMode::Always
    }

    fn allows_handoff(self) -> bool {
        self != HandoffMode::Never
    }
}

/// One blocking `send_message` exchange in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub caller: String,
    pub callee: String,
    pub request_id: String,
}

impl Frame {
    fn thread_key(&self) -> String {
        thread_key(&self.caller, &self.callee)
    }
}

fn thread_key(caller: &str, callee: &str) -> String {
    format!("{}->{}", caller, callee)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmState {
    /// The agent currently talking to the human.
    pub active: String,
    /// Main-thread state of every agent that has been active.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<Frame>,
    /// Private threads keyed `caller->callee`.
    #[serde(default)]
    pub threads: BTreeMap<String, Thread<AgentState>>,
}

impl SwarmState {
    /// State of the agent that made the call in `frame`, once `frame` is popped.
    fn caller_state(&mut self, frame: &Frame) -> Result<&mut AgentState> {
        let state = match self.stack.last() {
            None => self.agents.get_mut(&frame.caller),
            Some(parent) => {
                let key = parent.thread_key();
                self.threads.get_mut(&key).map(|t| &mut t.state)
            }
        };
        state.ok_or_else(|| StepwiseError::Conversation(format!("no state for '{}'", frame.caller)))
    }
}

/// Agents connected by caller -> callee relationships. Any agent may
/// message its callees and wait for the answer; the agent facing the human
/// may also hand the whole conversation to a callee, depending on the mode.
#[derive(Clone)]
pub struct Swarm {
    name: String,
    description: String,
    first: String,
    agents: Vec<Arc<Agent>>,
    relationships: Vec<(String, String)>,
    handoff: HandoffMode,
}

impl Swarm {
    pub fn builder(name: impl Into<String>) -> SwarmBuilder {
        SwarmBuilder::new(name)
    }

    pub fn handoff_mode(&self) -> HandoffMode {
        self.handoff
    }

    pub fn relationships(&self) -> &[(String, String)] {
        &self.relationships
    }

    fn agent(&self, name: &str) -> Result<&Arc<Agent>> {
        self.agents
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| StepwiseError::Conversation(format!("unknown swarm agent '{}'", name)))
    }

    fn first_agent(&self) -> Result<&Arc<Agent>> {
        self.agent(&self.first)
    }

    fn callees(&self, caller: &str) -> Vec<&str> {
        self.relationships
            .iter()
            .filter(|(from, _)| from == caller)
            .map(|(_, to)| to.as_str())
            .collect()
    }

    /// Tools offered to `agent`. Only the human-facing agent gets handoff.
    fn virtual_tools(&self, agent: &str, human_facing: bool) -> Vec<ToolDefinition> {
        let callees = self.callees(agent);
        if callees.is_empty() {
            return Vec::new();
        }
        let recipient = Property::string("recipient")
            .with_description(format!("One of: {}", callees.join(", ")));
        let mut tools = Vec::new();
        if self.handoff.allows_send() {
            tools.push(ToolDefinition {
                name: SEND_MESSAGE_TOOL.to_string(),
                description: "Send a message to another agent and wait for its answer.".to_string(),
                input_schema: object_schema(&[recipient.clone(), Property::string("message")]),
            });
        }
        if human_facing && self.handoff.allows_handoff() {
            tools.push(ToolDefinition {
                name: HANDOFF_TOOL.to_string(),
                description: "Transfer the conversation with the user to another agent, \
                              when it can complete the request on its own."
                    .to_string(),
                input_schema: object_schema(&[
                    recipient,
                    Property::string("message").with_default(json!("")),
                ]),
            });
        }
        tools
    }

    /// Act on a swarm tool call made by `caller`.
    fn dispatch(
        &self,
        state: &mut SwarmState,
        caller: &str,
        request: ToolRequest,
        scope: &mut Scope<'_>,
    ) -> Result<()> {
        let recipient = request
            .args
            .get("recipient")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = request
            .args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reject = |state: &mut SwarmState, text: String| -> Result<()> {
            let caller_state = match state.stack.last() {
                Some(frame) => {
                    let key = frame.thread_key();
                    state.threads.get_mut(&key).map(|t| &mut t.state)
                }
                None => state.agents.get_mut(caller),
            };
            caller_state
                .ok_or_else(|| StepwiseError::Conversation(format!("no state for '{}'", caller)))?
                .complete_call(ToolResult::error(&request.id, text))
        };

        if !self.callees(caller).contains(&recipient.as_str()) {
            return reject(state, format!("{} cannot contact '{}'", caller, recipient));
        }

        if request.name == HANDOFF_TOOL {
            self.handoff(state, caller, &recipient, &request.id, &message, scope)
        } else {
            if message.is_empty() {
                return reject(state, "message must not be empty".to_string());
            }
            let callee = self.agent(&recipient)?;
            let frame = Frame {
                caller: caller.to_string(),
                callee: recipient.clone(),
                request_id: request.id.clone(),
            };
            let thread = match state.threads.entry(frame.thread_key()) {
                std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(Thread::new(callee.new_agent_state(ValueMap::new())?))
                }
            };
            scope
                .with_messages(&mut thread.messages)
                .append(Message::user(message).with_sender(caller))?;
            info!(swarm = %self.name, from = caller, to = %recipient, "Sending message");
            scope.ctx.publish(ExecutionEvent::Delegated {
                from: caller.to_string(),
                to: recipient,
            });
            state.stack.push(frame);
            Ok(())
        }
    }

    fn handoff(
        &self,
        state: &mut SwarmState,
        caller: &str,
        recipient: &str,
        request_id: &str,
        message: &str,
        scope: &mut Scope<'_>,
    ) -> Result<()> {
        let callee = self.agent(recipient)?;
        let caller_state = state
            .agents
            .get_mut(caller)
            .ok_or_else(|| StepwiseError::Conversation(format!("no state for '{}'", caller)))?;
        caller_state.complete_call(ToolResult::success(
            request_id,
            Value::String(format!("conversation handed to {}", recipient)),
        ))?;
        for result in caller_state.abandon_pending() {
            scope.append(Message::tool_result(result))?;
        }

        let mut note = format!("[{} handed the conversation to {}]", caller, recipient);
        if !message.is_empty() {
            note.push(' ');
            note.push_str(message);
        }
        scope.append(Message::system(note))?;

        if !state.agents.contains_key(recipient) {
            state
                .agents
                .insert(recipient.to_string(), callee.new_agent_state(ValueMap::new())?);
        }
        info!(swarm = %self.name, from = caller, to = recipient, "Handing off conversation");
        scope.ctx.publish(ExecutionEvent::Handoff {
            from: caller.to_string(),
            to: recipient.to_string(),
        });
        state.active = recipient.to_string();
        Ok(())
    }

    async fn run(&self, state: &mut SwarmState, mut scope: Scope<'_>) -> Result<ExecutionStatus> {
        loop {
            if let Some(frame) = state.stack.last().cloned() {
                let callee = self.agent(&frame.callee)?;
                let tools = self.virtual_tools(&frame.callee, false);
                let thread = state.threads.get_mut(&frame.thread_key()).ok_or_else(|| {
                    StepwiseError::Conversation(format!("no thread '{}'", frame.thread_key()))
                })?;
                let stop = callee
                    .run_loop(&mut thread.state, scope.with_messages(&mut thread.messages), &tools)
                    .await?;
                let status = match stop {
                    AgentStop::Delegate(request) => {
                        self.dispatch(state, &frame.callee, request, &mut scope)?;
                        continue;
                    }
                    AgentStop::Status(status) => status,
                };
                let Some(reply) = answer(&status, &thread.messages) else {
                    debug!(agent = %frame.callee, status = status.tag(), "Callee suspended");
                    return Ok(status);
                };
                state.stack.pop();
                state
                    .caller_state(&frame)?
                    .complete_call(ToolResult::success(&frame.request_id, Value::String(reply)))?;
                continue;
            }

            let active = state.active.clone();
            let agent = self.agent(&active)?;
            if !state.agents.contains_key(&active) {
                state.agents.insert(active.clone(), agent.new_agent_state(ValueMap::new())?);
            }
            let tools = self.virtual_tools(&active, true);
            let agent_state = state
                .agents
                .get_mut(&active)
                .ok_or_else(|| StepwiseError::Conversation(format!("no state for '{}'", active)))?;
            match agent.run_loop(agent_state, scope.reborrow(), &tools).await? {
                AgentStop::Status(status) => return Ok(status),
                AgentStop::Delegate(request) => self.dispatch(state, &active, request, &mut scope)?,
            }
        }
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("name", &self.name)
            .field("first", &self.first)
            .field("agents", &self.agents.iter().map(|a| a.name()).collect::<Vec<_>>())
            .field("relationships", &self.relationships)
            .field("handoff", &self.handoff)
            .finish()
    }
}

impl ConversationalComponent for Swarm {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &'static str {
        "swarm"
    }

    fn input_descriptors(&self) -> Vec<Property> {
        self.first_agent()
            .map(|a| a.input_descriptors())
            .unwrap_or_default()
    }

    fn output_descriptors(&self) -> Vec<Property> {
        self.first_agent()
            .map(|a| a.output_descriptors())
            .unwrap_or_default()
    }

    fn may_suspend(&self) -> bool {
        self.agents.iter().any(|a| a.may_suspend())
    }

    fn new_state(&self, inputs: ValueMap) -> Result<ComponentState> {
        let first = self.first_agent()?;
        let mut agents = BTreeMap::new();
        agents.insert(self.first.clone(), first.new_agent_state(inputs)?);
        Ok(ComponentState::Swarm(SwarmState {
            active: self.first.clone(),
            agents,
            stack: Vec::new(),
            threads: BTreeMap::new(),
        }))
    }

    fn resume<'a>(
        &'a self,
        state: &'a mut ComponentState,
        scope: Scope<'a>,
    ) -> BoxFuture<'a, Result<ExecutionStatus>> {
        Box::pin(async move {
            let ComponentState::Swarm(swarm) = state else {
                return Err(state.mismatch("swarm"));
            };
            self.run(swarm, scope).await
        })
    }

    fn to_config(&self) -> Value {
        let agents: Vec<Value> = self.agents.iter().map(|a| a.to_config()).collect();
        json!({
            "component_type": "swarm",
            "name": self.name,
            "description": self.description,
            "first": self.first,
            "agents": agents,
            "relationships": self.relationships,
            "handoff": self.handoff,
        })
    }
}

pub struct SwarmBuilder {
    name: String,
    description: String,
    first: Option<String>,
    agents: Vec<Arc<Agent>>,
    relationships: Vec<(String, String)>,
    handoff: HandoffMode,
}

impl SwarmBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            first: None,
            agents: Vec::new(),
            relationships: Vec::new(),
            handoff: HandoffMode::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn agent(self, agent: Agent) -> Self {
        self.agent_arc(Arc::new(agent))
    }

    pub fn agent_arc(mut self, agent: Arc<Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// `caller` may contact `callee`.
    pub fn relationship(mut self, caller: impl Into<String>, callee: impl Into<String>) -> Self {
        self.relationships.push((caller.into(), callee.into()));
        self
    }

    pub fn handoff(mut self, mode: HandoffMode) -> Self {
        self.handoff = mode;
        self
    }

    /// The agent facing the human at the start. Defaults to the first agent.
    pub fn first(mut self, name: impl Into<String>) -> Self {
        self.first = Some(name.into());
        self
    }

    pub fn build(self) -> Result<Swarm> {
        let config_err = |message: String| StepwiseError::Config(format!("swarm '{}': {}", self.name, message));
        let Some(default_first) = self.agents.first().map(|a| a.name().to_string()) else {
            return Err(config_err("no agents".into()));
        };

        let mut names = std::collections::HashSet::new();
        for agent in &self.agents {
            if !names.insert(agent.name().to_string()) {
                return Err(config_err(format!("duplicate agent '{}'", agent.name())));
            }
            if let Some(tool) = agent
                .tools()
                .iter()
                .find(|t| t.name() == SEND_MESSAGE_TOOL || t.name() == HANDOFF_TOOL)
            {
                return Err(config_err(format!(
                    "agent '{}' declares reserved tool '{}'",
                    agent.name(),
                    tool.name()
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for (caller, callee) in &self.relationships {
            for end in [caller, callee] {
                if !names.contains(end) {
                    return Err(config_err(format!("relationship names unknown agent '{}'", end)));
                }
            }
            if caller == callee {
                return Err(config_err(format!("'{}' cannot be its own callee", caller)));
            }
            if !seen.insert((caller.clone(), callee.clone())) {
                return Err(config_err(format!("duplicate relationship {} -> {}", caller, callee)));
            }
        }

        let first = self.first.clone().unwrap_or(default_first);
        if !names.contains(&first) {
            return Err(config_err(format!("unknown first agent '{}'", first)));
        }

        Ok(Swarm {
            name: self.name,
            description: self.description,
            first,
            agents: self.agents,
            relationships: self.relationships,
            handoff: self.handoff,
        })
    }
}
