//! Flows: directed graphs of steps joined by control-flow and data-flow edges.

pub mod builder;
pub mod edges;
pub mod step;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::ExecutionEvent;
use stepwise_core::property::{coerce_values, Property};
use stepwise_core::types::{ValueMap, DEFAULT_BRANCH};

use crate::component::{ConversationalComponent, Scope};
use crate::conversation::ComponentState;
use crate::status::ExecutionStatus;
use crate::variables::WriteOperation;

pub use builder::FlowBuilder;
pub use edges::{ControlFlowEdge, DataEndpoint, DataFlowEdge};
pub use step::{Step, StepInvocation, StepOutcome, StepState};

/// Continuation point of a running flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    /// `None` once the flow has exited.
    pub current_step: Option<String>,
    /// Flow inputs plus every step output, by name.
    #[serde(default)]
    pub io: ValueMap,
    #[serde(default)]
    pub step_outputs: BTreeMap<String, ValueMap>,
    #[serde(default)]
    pub step_state: StepState,
    #[serde(default)]
    pub transitions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_branch: Option<String>,
}

impl FlowState {
    pub fn new(begin: impl Into<String>, io: ValueMap) -> Self {
        Self {
            current_step: Some(begin.into()),
            io,
            step_outputs: BTreeMap::new(),
            step_state: StepState::Idle,
            transitions: 0,
            exit_branch: None,
        }
    }
}

/// An immutable, validated flow definition. Build one with [`Flow::builder`].
#[derive(Clone)]
pub struct Flow {
    name: String,
    description: String,
    begin: String,
    steps: Vec<(String, Arc<dyn Step>)>,
    index: HashMap<String, usize>,
    control_edges: Vec<ControlFlowEdge>,
    data_edges: Vec<DataFlowEdge>,
    variables: Vec<Property>,
    inputs: Vec<Property>,
    outputs: Vec<Property>,
    exit_branches: Vec<String>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("begin", &self.begin)
            .field("steps", &self.steps.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>())
            .field("exit_branches", &self.exit_branches)
            .finish()
    }
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    pub fn begin(&self) -> &str {
        &self.begin
    }

    pub fn steps(&self) -> impl Iterator<Item = (&str, &Arc<dyn Step>)> {
        self.steps.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn step(&self, name: &str) -> Result<&Arc<dyn Step>> {
        self.index
            .get(name)
            .map(|&i| &self.steps[i].1)
            .ok_or_else(|| StepwiseError::StepFailed {
                step: name.to_string(),
                message: format!("no such step in flow '{}'", self.name),
            })
    }

    pub fn control_edges(&self) -> &[ControlFlowEdge] {
        &self.control_edges
    }

    pub fn data_edges(&self) -> &[DataFlowEdge] {
        &self.data_edges
    }

    pub fn variables(&self) -> &[Property] {
        &self.variables
    }

    pub fn inputs(&self) -> &[Property] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Property] {
        &self.outputs
    }

    /// Branch names the flow can finish through.
    pub fn exit_branches(&self) -> &[String] {
        &self.exit_branches
    }

    /// First step that can suspend.
    pub fn suspending_step(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|(_, s)| s.may_suspend())
            .map(|(n, _)| n.as_str())
    }

    /// Every variable write the flow can perform, including data edges
    /// into variables.
    pub fn variable_writes(&self) -> Vec<(String, WriteOperation)> {
        let mut writes: Vec<(String, WriteOperation)> = self
            .steps
            .iter()
            .flat_map(|(_, s)| s.variable_writes())
            .collect();
        for edge in &self.data_edges {
            if let DataEndpoint::Variable { variable } = &edge.destination {
                writes.push((variable.clone(), WriteOperation::Overwrite));
            }
        }
        writes
    }

    /// Validate flow inputs and produce a fresh state.
    pub fn new_flow_state(&self, inputs: ValueMap) -> Result<FlowState> {
        let io = coerce_values(&self.inputs, inputs, &self.name)?;
        Ok(FlowState::new(self.begin.clone(), io))
    }

    /// Execute from `state` until a suspension or the end of the flow.
    pub fn run<'a>(
        &'a self,
        state: &'a mut FlowState,
        mut scope: Scope<'a>,
    ) -> BoxFuture<'a, Result<ExecutionStatus>> {
        Box::pin(async move {
            scope.variables.ensure(&self.variables)?;

            while let Some(step_name) = state.current_step.clone() {
                scope.ctx.check_interrupts()?;
                let step = self.step(&step_name)?;

                if matches!(state.step_state, StepState::Idle) {
                    state.transitions += 1;
                    let limit = scope.ctx.limits().max_transitions;
                    if state.transitions > limit {
                        return Err(StepwiseError::MaxTransitionsExceeded {
                            flow: self.name.clone(),
                            limit,
                        });
                    }
                    debug!(flow = %self.name, step = %step_name, kind = step.kind(), "Starting step");
                    scope.ctx.publish(ExecutionEvent::StepStarted {
                        flow: self.name.clone(),
                        step: step_name.clone(),
                    });
                }

                let inputs = self.resolve_inputs(&step_name, step.as_ref(), state, &scope)?;
                let outcome = step
                    .invoke(StepInvocation {
                        flow: &self.name,
                        name: &step_name,
                        inputs,
                        state: &mut state.step_state,
                        scope: scope.reborrow(),
                    })
                    .await
                    .inspect_err(|e| {
                        warn!(flow = %self.name, step = %step_name, kind = e.kind(), error = %e, "Step failed");
                    })?;

                let (outputs, branch) = match outcome {
                    StepOutcome::Suspend(status) => {
                        debug!(flow = %self.name, step = %step_name, status = status.tag(), "Step suspended");
                        return Ok(status);
                    }
                    StepOutcome::Complete { outputs, branch } => (outputs, branch),
                };

                state.step_state = StepState::Idle;
                let outputs = coerce_values(&step.outputs(), outputs, &step_name)?;
                self.store_outputs(&step_name, outputs, state, &mut scope)?;
                scope.ctx.publish(ExecutionEvent::StepCompleted {
                    flow: self.name.clone(),
                    step: step_name.clone(),
                    branch: branch.clone(),
                });

                if step.is_terminal() {
                    state.current_step = None;
                    state.exit_branch = Some(branch);
                    continue;
                }

                let edge = self
                    .control_edges
                    .iter()
                    .find(|e| e.source_step == step_name && e.source_branch == branch)
                    .ok_or_else(|| StepwiseError::StepFailed {
                        step: step_name.clone(),
                        message: format!("returned undeclared branch '{}'", branch),
                    })?;
                match &edge.destination {
                    Some(next) => state.current_step = Some(next.clone()),
                    None => {
                        state.current_step = None;
                        state.exit_branch = Some(DEFAULT_BRANCH.to_string());
                    }
                }
            }

            Ok(self.finish(state))
        })
    }

    /// Inputs come from a data edge when one targets them, else from the
    /// flow's shared namespace by name, else from the declared default.
    fn resolve_inputs(
        &self,
        step_name: &str,
        step: &dyn Step,
        state: &FlowState,
        scope: &Scope<'_>,
    ) -> Result<ValueMap> {
        let declared = step.inputs();
        let mut inputs = ValueMap::new();
        for input in &declared {
            let mut edges = self
                .data_edges
                .iter()
                .filter(|e| e.feeds(step_name, &input.name))
                .peekable();
            let value = if edges.peek().is_some() {
                edges.find_map(|e| match &e.source {
                    DataEndpoint::Step { step, name } => {
                        state.step_outputs.get(step).and_then(|o| o.get(name)).cloned()
                    }
                    DataEndpoint::Variable { variable } => scope
                        .variables
                        .read(variable)
                        .ok()
                        .filter(|v| !v.is_null()),
                })
            } else {
                state.io.get(&input.name).cloned()
            };

            match value {
                Some(v) => {
                    inputs.insert(input.name.clone(), v);
                }
                None if input.is_required() => {
                    return Err(StepwiseError::MissingInput {
                        step: step_name.to_string(),
                        input: input.name.clone(),
                    })
                }
                None => {}
            }
        }
        coerce_values(&declared, inputs, step_name)
    }

    fn store_outputs(
        &self,
        step_name: &str,
        outputs: ValueMap,
        state: &mut FlowState,
        scope: &mut Scope<'_>,
    ) -> Result<()> {
        for edge in &self.data_edges {
            if let (DataEndpoint::Step { step, name }, DataEndpoint::Variable { variable }) =
                (&edge.source, &edge.destination)
            {
                if step == step_name {
                    if let Some(value) = outputs.get(name) {
                        scope
                            .variables
                            .write(variable, WriteOperation::Overwrite, value.clone())?;
                    }
                }
            }
        }
        for (k, v) in &outputs {
            state.io.insert(k.clone(), v.clone());
        }
        state.step_outputs.insert(step_name.to_string(), outputs);
        Ok(())
    }

    fn finish(&self, state: &FlowState) -> ExecutionStatus {
        let outputs = self
            .outputs
            .iter()
            .filter_map(|o| state.io.get(&o.name).map(|v| (o.name.clone(), v.clone())))
            .collect();
        ExecutionStatus::Finished {
            outputs,
            exit_branch: state
                .exit_branch
                .clone()
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        }
    }
}

impl ConversationalComponent for Flow {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &'static str {
        "flow"
    }

    fn input_descriptors(&self) -> Vec<Property> {
        self.inputs.clone()
    }

    fn output_descriptors(&self) -> Vec<Property> {
        self.outputs.clone()
    }

    fn may_suspend(&self) -> bool {
        self.suspending_step().is_some()
    }

    fn new_state(&self, inputs: ValueMap) -> Result<ComponentState> {
        Ok(ComponentState::Flow(self.new_flow_state(inputs)?))
    }

    fn resume<'a>(
        &'a self,
        state: &'a mut ComponentState,
        scope: Scope<'a>,
    ) -> BoxFuture<'a, Result<ExecutionStatus>> {
        match state {
            ComponentState::Flow(flow_state) => self.run(flow_state, scope),
            other => {
                let err = other.mismatch("flow");
                Box::pin(async move { Err(err) })
            }
        }
    }

    fn to_config(&self) -> Value {
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|(name, step)| json!({ "name": name, "step": step.to_config() }))
            .collect();
        json!({
            "component_type": "flow",
            "name": self.name,
            "description": self.description,
            "begin": self.begin,
            "steps": steps,
            "control_edges": self.control_edges,
            "data_edges": self.data_edges,
            "variables": self.variables,
            "inputs": self.inputs,
            "outputs": self.outputs,
        })
    }
}
