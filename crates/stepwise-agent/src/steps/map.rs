use std::collections::BTreeMap;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

use super::parallel::{check_non_suspending, merge_branches, run_isolated, Isolated};
use crate::component::ConversationalComponent;
use crate::flow::{Flow, FlowState, Step, StepInvocation, StepOutcome, StepState};
use crate::status::ExecutionStatus;
use crate::variables::WriteOperation;

pub const ITERATED_INPUT: &str = "iterated_input";

/// Applies a flow to every item of `iterated_input`. Each flow output
/// becomes a list aligned with the input items; an output an iteration did
/// not produce is `null` at that index.
#[derive(Debug, Clone)]
pub struct MapStep {
    flow: Flow,
    item_input: String,
    parallel: bool,
}

impl MapStep {
    /// Sequential map; the flow may suspend.
    pub fn new(flow: Flow, item_input: impl Into<String>) -> Result<Self> {
        let item_input = item_input.into();
        if !flow.inputs().iter().any(|p| p.name == item_input) {
            return Err(StepwiseError::Config(format!(
                "map: flow '{}' has no input '{}'",
                flow.name(),
                item_input
            )));
        }
        Ok(Self {
            flow,
            item_input,
            parallel: false,
        })
    }

    /// Concurrent map. The flow must never suspend and must not overwrite
    /// variables, since every iteration would race on them.
    pub fn parallel(flow: Flow, item_input: impl Into<String>) -> Result<Self> {
        let mut step = Self::new(flow, item_input)?;
        check_non_suspending(&format!("map over '{}'", step.flow.name()), &step.flow)?;
        if let Some((variable, _)) = step
            .flow
            .variable_writes()
            .into_iter()
            .find(|(_, op)| *op == WriteOperation::Overwrite)
        {
            return Err(StepwiseError::Config(format!(
                "parallel map over '{}' overwrites variable '{}'",
                step.flow.name(),
                variable
            )));
        }
        step.parallel = true;
        Ok(step)
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn item_descriptor(&self) -> Property {
        self.flow
            .inputs()
            .iter()
            .find(|p| p.name == self.item_input)
            .cloned()
            .unwrap_or_else(|| Property::any("item"))
    }

    fn shared_inputs(&self, inputs: &ValueMap) -> ValueMap {
        inputs
            .iter()
            .filter(|(k, _)| k.as_str() != ITERATED_INPUT)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn iteration_inputs(&self, shared: &ValueMap, item: Value) -> ValueMap {
        let mut io = shared.clone();
        io.insert(self.item_input.clone(), item);
        io
    }

    fn collect(&self, columns: &mut BTreeMap<String, Vec<Value>>, outputs: &ValueMap) {
        for output in self.flow.outputs() {
            columns
                .entry(output.name.clone())
                .or_default()
                .push(outputs.get(&output.name).cloned().unwrap_or(Value::Null));
        }
    }

    async fn run_parallel(
        &self,
        name: &str,
        items: Vec<Value>,
        shared: ValueMap,
        mut scope: crate::component::Scope<'_>,
    ) -> Result<StepOutcome> {
        let ctx = scope.ctx;
        let conversation_id = scope.conversation_id;
        let width = ctx.limits().max_parallel.max(1);
        debug!(step = name, items = items.len(), width, "Mapping in parallel");

        let forks: Vec<(ValueMap, Isolated)> = items
            .into_iter()
            .map(|item| (self.iteration_inputs(&shared, item), Isolated::fork(&scope)))
            .collect();
        let labels: Vec<String> = (0..forks.len()).map(|i| i.to_string()).collect();
        let results = stream::iter(forks)
            .map(|(io, isolated)| run_isolated(&self.flow, io, ctx, conversation_id, isolated))
            .buffered(width)
            .collect::<Vec<_>>()
            .await;

        let mut columns = BTreeMap::new();
        for outputs in merge_branches(name, &labels, results, &mut scope)? {
            self.collect(&mut columns, &outputs);
        }
        Ok(StepOutcome::next(self.finish(columns)))
    }

    fn finish(&self, mut columns: BTreeMap<String, Vec<Value>>) -> ValueMap {
        self.flow
            .outputs()
            .iter()
            .map(|o| {
                let column = columns.remove(&o.name).unwrap_or_default();
                (o.name.clone(), Value::Array(column))
            })
            .collect()
    }
}

impl Step for MapStep {
    fn kind(&self) -> &'static str {
        "map"
    }

    fn inputs(&self) -> Vec<Property> {
        let item = self.item_descriptor().renamed("item");
        let mut inputs = vec![Property::list(ITERATED_INPUT, item)];
        inputs.extend(
            self.flow
                .inputs()
                .iter()
                .filter(|p| p.name != self.item_input)
                .cloned(),
        );
        inputs
    }

    fn outputs(&self) -> Vec<Property> {
        self.flow
            .outputs()
            .iter()
            .map(|o| {
                let item = if o.required {
                    o.renamed("item")
                } else {
                    let mut item = o.renamed("item");
                    item.required = true;
                    Property::union("item", vec![item, Property::null("null")])
                };
                Property::list(o.name.clone(), item)
            })
            .collect()
    }

    fn may_suspend(&self) -> bool {
        !self.parallel && self.flow.may_suspend()
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
            let items = match inputs.get(ITERATED_INPUT) {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            let shared = self.shared_inputs(&inputs);

            if self.parallel {
                return self.run_parallel(name, items, shared, scope).await;
            }

            if matches!(state, StepState::Idle) {
                *state = StepState::Map {
                    index: 0,
                    outputs: BTreeMap::new(),
                    current: None,
                };
            }
            let StepState::Map {
                index,
                outputs: columns,
                current,
            } = state
            else {
                return Err(state.unexpected(name));
            };

            while let Some(item) = items.get(*index) {
                scope.ctx.check_interrupts()?;
                let mut nested: Box<FlowState> = match current.take() {
                    Some(nested) => nested,
                    None => Box::new(
                        self.flow
                            .new_flow_state(self.iteration_inputs(&shared, item.clone()))?,
                    ),
                };
                let status = self.flow.run(&mut nested, scope.reborrow()).await;
                match status {
                    Ok(ExecutionStatus::Finished { outputs, .. }) => {
                        self.collect(columns, &outputs);
                        *index += 1;
                    }
                    Ok(suspended) => {
                        *current = Some(nested);
                        return Ok(StepOutcome::Suspend(suspended));
                    }
                    Err(e) => {
                        *current = Some(nested);
                        return Err(e);
                    }
                }
            }

            Ok(StepOutcome::next(self.finish(std::mem::take(columns))))
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "step_type": "map",
            "flow": self.flow.to_config(),
            "item_input": self.item_input,
            "parallel": self.parallel,
        })
    }
}
