//! Parallel regions. Every branch runs on its own copy of the conversation
//! (messages, journaling variables, empty inbox). Branch results are merged
//! back in branch order once all of them have finished; a failure in any
//! branch merges nothing.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use stepwise_core::error::{BranchFailure, Result, StepwiseError};
use stepwise_core::message::MessageList;
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

use crate::component::{ConversationalComponent, Scope};
use crate::context::ExecutionContext;
use crate::conversation::Inbox;
use crate::flow::{Flow, Step, StepInvocation, StepOutcome};
use crate::status::ExecutionStatus;
use crate::variables::{VariableStore, WriteOperation};

/// A branch's private copy of the conversation.
pub(crate) struct Isolated {
    messages: MessageList,
    variables: VariableStore,
    inbox: Inbox,
    base_len: usize,
}

impl Isolated {
    pub(crate) fn fork(scope: &Scope<'_>) -> Self {
        Self {
            messages: scope.messages.clone(),
            variables: scope.variables.fork(),
            inbox: Inbox::default(),
            base_len: scope.messages.len(),
        }
    }

    /// Replay this branch's messages and variable writes onto `scope`.
    pub(crate) fn merge_into(mut self, scope: &mut Scope<'_>) -> Result<()> {
        for message in self.messages.since(self.base_len) {
            scope.append(message.clone())?;
        }
        scope.variables.replay(self.variables.take_journal())
    }
}

/// Run `flow` to completion on an isolated copy of the conversation.
pub(crate) async fn run_isolated(
    flow: &Flow,
    inputs: ValueMap,
    ctx: &ExecutionContext,
    conversation_id: &str,
    mut isolated: Isolated,
) -> (Result<ValueMap>, Isolated) {
    let result = run_to_completion(flow, inputs, ctx, conversation_id, &mut isolated).await;
    (result, isolated)
}

async fn run_to_completion(
    flow: &Flow,
    inputs: ValueMap,
    ctx: &ExecutionContext,
    conversation_id: &str,
    isolated: &mut Isolated,
) -> Result<ValueMap> {
    let mut state = flow.new_flow_state(inputs)?;
    let scope = Scope {
        ctx,
        conversation_id,
        messages: &mut isolated.messages,
        variables: &mut isolated.variables,
        inbox: &mut isolated.inbox,
    };
    match flow.run(&mut state, scope).await? {
        ExecutionStatus::Finished { outputs, .. } => Ok(outputs),
        suspended => Err(StepwiseError::StepFailed {
            step: flow.name().to_string(),
            message: format!("suspended with {} inside a parallel region", suspended.tag()),
        }),
    }
}

/// Merge branch results in order, or report every failed branch.
pub(crate) fn merge_branches(
    step: &str,
    labels: &[String],
    results: Vec<(Result<ValueMap>, Isolated)>,
    scope: &mut Scope<'_>,
) -> Result<Vec<ValueMap>> {
    let mut failures = Vec::new();
    let mut completed = Vec::new();
    for (label, (result, _)) in labels.iter().zip(&results) {
        match result {
            Ok(_) => completed.push(label.clone()),
            Err(e) => failures.push(BranchFailure {
                branch: label.clone(),
                kind: e.kind().to_string(),
                message: e.to_string(),
            }),
        }
    }
    if !failures.is_empty() {
        warn!(step, failed = failures.len(), completed = completed.len(), "Parallel branches failed");
        return Err(StepwiseError::ParallelBranches {
            step: step.to_string(),
            failures,
            completed,
        });
    }

    let mut outputs = Vec::with_capacity(results.len());
    for (result, isolated) in results {
        isolated.merge_into(scope)?;
        outputs.push(result?);
    }
    Ok(outputs)
}

/// A parallel region may not contain anything that suspends.
pub(crate) fn check_non_suspending(region: &str, flow: &Flow) -> Result<()> {
    match flow.suspending_step() {
        Some(step) => Err(StepwiseError::SuspendingInParallel {
            region: region.to_string(),
            step: format!("{}.{}", flow.name(), step),
        }),
        None => Ok(()),
    }
}

/// Runs several named flows concurrently and merges their outputs into
/// one namespace.
#[derive(Debug, Clone)]
pub struct ParallelFlowExecutionStep {
    flows: Vec<Flow>,
}

impl ParallelFlowExecutionStep {
    pub fn new(flows: Vec<Flow>) -> Result<Self> {
        if flows.is_empty() {
            return Err(StepwiseError::Config("parallel step needs at least one flow".into()));
        }
        let region = flows
            .iter()
            .map(|f| f.name())
            .collect::<Vec<_>>()
            .join(", ");

        let mut output_owner: BTreeMap<String, &str> = BTreeMap::new();
        let mut writes: BTreeMap<String, (&str, WriteOperation)> = BTreeMap::new();
        for flow in &flows {
            check_non_suspending(&region, flow)?;
            for output in flow.outputs() {
                if let Some(other) = output_owner.insert(output.name.clone(), flow.name()) {
                    return Err(StepwiseError::Config(format!(
                        "output '{}' produced by both '{}' and '{}'",
                        output.name,
                        other,
                        flow.name()
                    )));
                }
            }
            for (variable, op) in flow.variable_writes() {
                if let Some((other, other_op)) = writes.get(&variable) {
                    let overwrite = op == WriteOperation::Overwrite || *other_op == WriteOperation::Overwrite;
                    if overwrite && *other != flow.name() {
                        return Err(StepwiseError::Config(format!(
                            "variable '{}' overwritten concurrently by '{}' and '{}'",
                            variable,
                            other,
                            flow.name()
                        )));
                    }
                }
                writes.insert(variable, (flow.name(), op));
            }
        }
        Ok(Self { flows })
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }
}

impl Step for ParallelFlowExecutionStep {
    fn kind(&self) -> &'static str {
        "parallel_flow_execution"
    }

    fn inputs(&self) -> Vec<Property> {
        let mut inputs: Vec<Property> = Vec::new();
        for input in self.flows.iter().flat_map(|f| f.inputs()) {
            if !inputs.iter().any(|p| p.name == input.name) {
                inputs.push(input.clone());
            }
        }
        inputs
    }

    fn outputs(&self) -> Vec<Property> {
        self.flows
            .iter()
            .flat_map(|f| f.outputs().iter().cloned())
            .collect()
    }

    fn variable_writes(&self) -> Vec<(String, WriteOperation)> {
        self.flows.iter().flat_map(|f| f.variable_writes()).collect()
    }

    fn declared_variables(&self) -> Vec<Property> {
        self.flows.iter().flat_map(|f| f.variables().to_vec()).collect()
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let StepInvocation {
                name,
                inputs,
                mut scope,
                ..
            } = call;
            let ctx = scope.ctx;
            let conversation_id = scope.conversation_id;
            let width = ctx.limits().max_parallel.max(1);
            debug!(step = name, flows = self.flows.len(), width, "Running flows in parallel");

            let forks: Vec<(ValueMap, Isolated)> = self
                .flows
                .iter()
                .map(|flow| {
                    let own: ValueMap = flow
                        .inputs()
                        .iter()
                        .filter_map(|p| inputs.get(&p.name).map(|v| (p.name.clone(), v.clone())))
                        .collect();
                    (own, Isolated::fork(&scope))
                })
                .collect();

            let runs: Vec<_> = forks
                .into_iter()
                .enumerate()
                .map(|(i, (own, isolated))| {
                    run_isolated(&self.flows[i], own, ctx, conversation_id, isolated)
                })
                .collect();
            let results: Vec<(Result<ValueMap>, Isolated)> =
                stream::iter(runs).buffered(width).collect().await;

            let labels: Vec<String> = self.flows.iter().map(|f| f.name().to_string()).collect();
            let merged = merge_branches(name, &labels, results, &mut scope)?;
            let outputs = merged.into_iter().flatten().collect();
            Ok(StepOutcome::next(outputs))
        })
    }

    fn to_config(&self) -> Value {
        let flows: Vec<Value> = self.flows.iter().map(|f| f.to_config()).collect();
        json!({ "step_type": "parallel_flow_execution", "flows": flows })
    }
}
