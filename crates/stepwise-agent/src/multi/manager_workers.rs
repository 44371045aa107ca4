use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::ExecutionEvent;
use stepwise_core::message::{Message, ToolResult};
use stepwise_core::property::{object_schema, Property};
use stepwise_core::types::{ToolDefinition, ValueMap};

use super::{answer, Thread};
use crate::agent::{Agent, AgentState, AgentStop};
use crate::component::{ConversationalComponent, Scope};
use crate::conversation::ComponentState;
use crate::status::ExecutionStatus;

const DELEGATE_PREFIX: &str = "delegate_to_";

/// A delegation in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDelegation {
    pub worker: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerWorkersState {
    pub manager: AgentState,
    #[serde(default)]
    pub workers: BTreeMap<String, Thread<ComponentState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveDelegation>,
}

/// A manager agent that talks to the human and hands tasks to workers
/// through one `delegate_to_<worker>` tool per worker. Workers only ever
/// see the task on their own thread and answer the manager.
#[derive(Clone)]
pub struct ManagerWorkers {
    name: String,
    description: String,
    manager: Arc<Agent>,
    workers: Vec<Arc<dyn ConversationalComponent>>,
}

impl ManagerWorkers {
    pub fn new(
        name: impl Into<String>,
        manager: Agent,
        workers: Vec<Arc<dyn ConversationalComponent>>,
    ) -> Result<Self> {
        let name = name.into();
        if workers.is_empty() {
            return Err(StepwiseError::Config(format!("manager-workers '{}' has no workers", name)));
        }
        let mut seen = std::collections::HashSet::new();
        for worker in &workers {
            if worker.name() == manager.name() || !seen.insert(worker.name().to_string()) {
                return Err(StepwiseError::Config(format!(
                    "manager-workers '{}': duplicate participant '{}'",
                    name,
                    worker.name()
                )));
            }
            let tool = format!("{}{}", DELEGATE_PREFIX, worker.name());
            if manager.tools().iter().any(|t| t.name() == tool) {
                return Err(StepwiseError::Config(format!(
                    "manager '{}' already has a tool named '{}'",
                    manager.name(),
                    tool
                )));
            }
        }
        Ok(Self {
            name,
            description: String::new(),
            manager: Arc::new(manager),
            workers,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn manager(&self) -> &Agent {
        &self.manager
    }

    pub fn workers(&self) -> &[Arc<dyn ConversationalComponent>] {
        &self.workers
    }

    fn worker(&self, name: &str) -> Option<&Arc<dyn ConversationalComponent>> {
        self.workers.iter().find(|w| w.name() == name)
    }

    fn delegate_tools(&self) -> Vec<ToolDefinition> {
        self.workers
            .iter()
            .map(|w| ToolDefinition {
                name: format!("{}{}", DELEGATE_PREFIX, w.name()),
                description: format!("Delegate a task to {}. {}", w.name(), w.description()),
                input_schema: object_schema(&[Property::string("task")
                    .with_description("Everything the worker needs to know to do the task")]),
            })
            .collect()
    }

    /// Start a delegation, or resolve the call with an error when it is malformed.
    fn delegate(
        &self,
        state: &mut ManagerWorkersState,
        request: stepwise_core::message::ToolRequest,
        scope: &mut Scope<'_>,
    ) -> Result<()> {
        let worker_name = request
            .name
            .strip_prefix(DELEGATE_PREFIX)
            .unwrap_or_default()
            .to_string();
        let task = request.args.get("task").and_then(Value::as_str).unwrap_or_default();
        let Some(worker) = self.worker(&worker_name) else {
            return state.manager.complete_call(ToolResult::error(
                &request.id,
                format!("unknown worker '{}'", worker_name),
            ));
        };
        if task.is_empty() {
            return state
                .manager
                .complete_call(ToolResult::error(&request.id, "task must not be empty"));
        }

        let thread = match state.workers.entry(worker_name.clone()) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(Thread::new(worker.new_state(ValueMap::new())?))
            }
        };
        scope
            .with_messages(&mut thread.messages)
            .append(Message::user(task).with_sender(self.manager.name()))?;

        info!(manager = %self.manager.name(), worker = %worker_name, "Delegating task");
        scope.ctx.publish(ExecutionEvent::Delegated {
            from: self.manager.name().to_string(),
            to: worker_name.clone(),
        });
        state.active = Some(ActiveDelegation {
            worker: worker_name,
            request_id: request.id,
        });
        Ok(())
    }

    async fn run(&self, state: &mut ManagerWorkersState, mut scope: Scope<'_>) -> Result<ExecutionStatus> {
        let delegate_tools = self.delegate_tools();
        loop {
            if let Some(active) = state.active.clone() {
                let worker = self.worker(&active.worker).ok_or_else(|| {
                    StepwiseError::Conversation(format!("unknown worker '{}'", active.worker))
                })?;
                let thread = state.workers.get_mut(&active.worker).ok_or_else(|| {
                    StepwiseError::Conversation(format!("no thread for worker '{}'", active.worker))
                })?;
                let status = worker
                    .resume(&mut thread.state, scope.with_messages(&mut thread.messages))
                    .await?;
                let Some(result) = answer(&status, &thread.messages) else {
                    debug!(worker = %active.worker, status = status.tag(), "Worker suspended");
                    return Ok(status);
                };
                debug!(worker = %active.worker, "Worker answered");
                state
                    .manager
                    .complete_call(ToolResult::success(&active.request_id, Value::String(result)))?;
                state.active = None;
            }

            match self
                .manager
                .run_loop(&mut state.manager, scope.reborrow(), &delegate_tools)
                .await?
            {
                AgentStop::Status(status) => return Ok(status),
                AgentStop::Delegate(request) => {
                    if let Err(e) = self.delegate(state, request, &mut scope) {
                        warn!(manager = %self.manager.name(), error = %e, "Delegation failed");
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ManagerWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerWorkers")
            .field("name", &self.name)
            .field("manager", &self.manager.name())
            .field("workers", &self.workers.iter().map(|w| w.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ConversationalComponent for ManagerWorkers {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &'static str {
        "manager_workers"
    }

    fn input_descriptors(&self) -> Vec<Property> {
        self.manager.input_descriptors()
    }

    fn output_descriptors(&self) -> Vec<Property> {
        self.manager.output_descriptors()
    }

    fn may_suspend(&self) -> bool {
        self.manager.may_suspend() || self.workers.iter().any(|w| w.may_suspend())
    }

    fn new_state(&self, inputs: ValueMap) -> Result<ComponentState> {
        Ok(ComponentState::ManagerWorkers(ManagerWorkersState {
            manager: self.manager.new_agent_state(inputs)?,
            workers: BTreeMap::new(),
            active: None,
        }))
    }

    fn resume<'a>(
        &'a self,
        state: &'a mut ComponentState,
        scope: Scope<'a>,
    ) -> BoxFuture<'a, Result<ExecutionStatus>> {
        Box::pin(async move {
            let ComponentState::ManagerWorkers(group) = state else {
                return Err(state.mismatch("manager_workers"));
            };
            self.run(group, scope).await
        })
    }

    fn to_config(&self) -> Value {
        let workers: Vec<Value> = self.workers.iter().map(|w| w.to_config()).collect();
        json!({
            "component_type": "manager_workers",
            "name": self.name,
            "description": self.description,
            "manager": self.manager.to_config(),
            "workers": workers,
        })
    }
}
