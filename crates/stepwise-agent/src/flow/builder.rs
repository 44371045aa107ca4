use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::types::DEFAULT_BRANCH;

use super::edges::{ControlFlowEdge, DataEndpoint, DataFlowEdge};
use super::step::Step;
use super::Flow;

/// Assembles a [`Flow`] and checks it on [`build`](FlowBuilder::build):
/// every branch of every non-terminal step has exactly one transition,
/// data edges connect type-compatible endpoints, and variables are declared.
pub struct FlowBuilder {
    name: String,
    description: String,
    begin: Option<String>,
    steps: Vec<(String, Arc<dyn Step>)>,
    control_edges: Vec<ControlFlowEdge>,
    data_edges: Vec<DataFlowEdge>,
    variables: Vec<Property>,
    inputs: Option<Vec<Property>>,
    outputs: Option<Vec<Property>>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            begin: None,
            steps: Vec::new(),
            control_edges: Vec::new(),
            data_edges: Vec::new(),
            variables: Vec::new(),
            inputs: None,
            outputs: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(self, name: impl Into<String>, step: impl Step) -> Self {
        self.step_arc(name, Arc::new(step))
    }

    pub fn step_arc(mut self, name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.steps.push((name.into(), step));
        self
    }

    /// Defaults to the first step added.
    pub fn begin(mut self, name: impl Into<String>) -> Self {
        self.begin = Some(name.into());
        self
    }

    pub fn edge(mut self, edge: ControlFlowEdge) -> Self {
        self.control_edges.push(edge);
        self
    }

    /// `from --next--> to`
    pub fn transition(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge(ControlFlowEdge::new(from, to))
    }

    pub fn branch(
        self,
        from: impl Into<String>,
        branch: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.edge(ControlFlowEdge::on_branch(from, branch, to))
    }

    /// `from --next--> end of flow`
    pub fn end(self, from: impl Into<String>) -> Self {
        self.edge(ControlFlowEdge::to_end(from, DEFAULT_BRANCH))
    }

    pub fn end_branch(self, from: impl Into<String>, branch: impl Into<String>) -> Self {
        self.edge(ControlFlowEdge::to_end(from, branch))
    }

    /// Chain steps on their `next` branch; the last one ends the flow.
    pub fn sequence(mut self, names: &[&str]) -> Self {
        for pair in names.windows(2) {
            self = self.transition(pair[0], pair[1]);
        }
        if let Some(last) = names.last() {
            self = self.end(*last);
        }
        self
    }

    pub fn data(mut self, edge: DataFlowEdge) -> Self {
        self.data_edges.push(edge);
        self
    }

    pub fn connect(
        self,
        source_step: impl Into<String>,
        output: impl Into<String>,
        destination_step: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        self.data(DataFlowEdge::between(source_step, output, destination_step, input))
    }

    pub fn variable(mut self, variable: Property) -> Self {
        self.variables.push(variable);
        self
    }

    /// `$variable -> step.input`
    pub fn read_variable(
        self,
        variable: impl Into<String>,
        step: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        self.data(DataFlowEdge::new(
            DataEndpoint::variable(variable),
            DataEndpoint::step(step, input),
        ))
    }

    /// `step.output -> $variable`, overwriting.
    pub fn write_variable(
        self,
        step: impl Into<String>,
        output: impl Into<String>,
        variable: impl Into<String>,
    ) -> Self {
        self.data(DataFlowEdge::new(
            DataEndpoint::step(step, output),
            DataEndpoint::variable(variable),
        ))
    }

    /// Override the inferred flow inputs.
    pub fn inputs(mut self, inputs: Vec<Property>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Override the inferred flow outputs.
    pub fn outputs(mut self, outputs: Vec<Property>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn build(self) -> Result<Flow> {
        let name = self.name;
        let config_err = |msg: String| StepwiseError::Config(format!("flow '{}': {}", name, msg));

        if self.steps.is_empty() {
            return Err(config_err("has no steps".into()));
        }
        let mut index = HashMap::new();
        for (i, (step_name, _)) in self.steps.iter().enumerate() {
            if index.insert(step_name.clone(), i).is_some() {
                return Err(config_err(format!("duplicate step '{}'", step_name)));
            }
        }
        let step = |n: &str| index.get(n).map(|&i| &self.steps[i].1);

        let begin = self.begin.unwrap_or_else(|| self.steps[0].0.clone());
        if step(&begin).is_none() {
            return Err(config_err(format!("begin step '{}' does not exist", begin)));
        }

        // Control flow
        let mut seen = BTreeSet::new();
        for edge in &self.control_edges {
            let source = step(&edge.source_step).ok_or_else(|| {
                config_err(format!("transition from unknown step '{}'", edge.source_step))
            })?;
            if source.is_terminal() {
                return Err(config_err(format!(
                    "terminal step '{}' cannot have transitions",
                    edge.source_step
                )));
            }
            if !source.branches().contains(&edge.source_branch) {
                return Err(config_err(format!(
                    "step '{}' has no branch '{}'",
                    edge.source_step, edge.source_branch
                )));
            }
            if let Some(dest) = &edge.destination {
                if step(dest).is_none() {
                    return Err(config_err(format!("transition to unknown step '{}'", dest)));
                }
            }
            if !seen.insert((edge.source_step.as_str(), edge.source_branch.as_str())) {
                return Err(config_err(format!(
                    "more than one transition for '{}' on branch '{}'",
                    edge.source_step, edge.source_branch
                )));
            }
        }
        for (step_name, s) in &self.steps {
            if s.is_terminal() {
                continue;
            }
            for branch in s.branches() {
                if !seen.contains(&(step_name.as_str(), branch.as_str())) {
                    return Err(StepwiseError::MissingBranch {
                        flow: name.clone(),
                        step: step_name.clone(),
                        branch,
                    });
                }
            }
        }

        // Variables
        let mut variables: Vec<Property> = Vec::new();
        let declared = self
            .variables
            .iter()
            .cloned()
            .chain(self.steps.iter().flat_map(|(_, s)| s.declared_variables()));
        for variable in declared {
            match variables.iter().find(|v| v.name == variable.name) {
                Some(existing) if existing.kind != variable.kind => {
                    return Err(config_err(format!(
                        "variable '{}' declared as both {} and {}",
                        variable.name,
                        existing.type_name(),
                        variable.type_name()
                    )))
                }
                Some(_) => {}
                None => variables.push(variable),
            }
        }
        let variable = |n: &str| variables.iter().find(|v| v.name == n);
        for (step_name, s) in &self.steps {
            for (var, op) in s.variable_writes() {
                let declared = variable(&var).ok_or_else(|| {
                    config_err(format!("step '{}' writes undeclared variable '{}'", step_name, var))
                })?;
                op.check(declared)?;
            }
        }

        // Data flow
        for edge in &self.data_edges {
            let source = match &edge.source {
                DataEndpoint::Step { step: s, name: output } => {
                    let src = step(s)
                        .ok_or_else(|| config_err(format!("data edge from unknown step '{}'", s)))?;
                    src.outputs()
                        .into_iter()
                        .find(|p| &p.name == output)
                        .ok_or_else(|| {
                            config_err(format!("step '{}' has no output '{}'", s, output))
                        })?
                }
                DataEndpoint::Variable { variable: v } => variable(v)
                    .cloned()
                    .ok_or_else(|| config_err(format!("undeclared variable '{}'", v)))?,
            };
            let destination = match &edge.destination {
                DataEndpoint::Step { step: s, name: input } => {
                    let dst = step(s)
                        .ok_or_else(|| config_err(format!("data edge to unknown step '{}'", s)))?;
                    dst.inputs()
                        .into_iter()
                        .find(|p| &p.name == input)
                        .ok_or_else(|| config_err(format!("step '{}' has no input '{}'", s, input)))?
                }
                DataEndpoint::Variable { variable: v } => {
                    if matches!(edge.source, DataEndpoint::Variable { .. }) {
                        return Err(config_err(format!(
                            "variable-to-variable edge {} -> {}",
                            edge.source, edge.destination
                        )));
                    }
                    variable(v)
                        .cloned()
                        .ok_or_else(|| config_err(format!("undeclared variable '{}'", v)))?
                }
            };
            if !source.is_compatible_with(&destination) {
                let (source_step, output) = endpoint_parts(&edge.source);
                let (destination_step, input) = endpoint_parts(&edge.destination);
                return Err(StepwiseError::DataEdgeType {
                    flow: name.clone(),
                    source_step,
                    output,
                    destination_step,
                    input,
                });
            }
        }

        // Exits
        let mut exit_branches: Vec<String> = Vec::new();
        let mut add_exit = |b: String| {
            if !exit_branches.contains(&b) {
                exit_branches.push(b);
            }
        };
        if self.control_edges.iter().any(|e| e.destination.is_none()) {
            add_exit(DEFAULT_BRANCH.to_string());
        }
        for (_, s) in &self.steps {
            if s.is_terminal() {
                s.branches().into_iter().for_each(&mut add_exit);
            }
        }
        if exit_branches.is_empty() {
            return Err(config_err("has no way to finish".into()));
        }

        let inputs = match self.inputs {
            Some(inputs) => inputs,
            None => infer_inputs(&self.steps, &self.data_edges),
        };
        let outputs = match self.outputs {
            Some(outputs) => outputs,
            None => infer_outputs(&self.steps),
        };

        Ok(Flow {
            name,
            description: self.description,
            begin,
            steps: self.steps,
            index,
            control_edges: self.control_edges,
            data_edges: self.data_edges,
            variables,
            inputs,
            outputs,
            exit_branches,
        })
    }
}

fn endpoint_parts(endpoint: &DataEndpoint) -> (String, String) {
    match endpoint {
        DataEndpoint::Step { step, name } => (step.clone(), name.clone()),
        DataEndpoint::Variable { variable } => ("$".to_string(), variable.clone()),
    }
}

/// Step inputs that no data edge and no step output provides.
fn infer_inputs(steps: &[(String, Arc<dyn Step>)], data_edges: &[DataFlowEdge]) -> Vec<Property> {
    let produced: BTreeSet<String> = steps
        .iter()
        .flat_map(|(_, s)| s.outputs())
        .map(|p| p.name)
        .collect();
    let mut inputs: Vec<Property> = Vec::new();
    for (step_name, s) in steps {
        for input in s.inputs() {
            let wired = data_edges.iter().any(|e| e.feeds(step_name, &input.name));
            if wired || produced.contains(&input.name) {
                continue;
            }
            if !inputs.iter().any(|p| p.name == input.name) {
                inputs.push(input);
            }
        }
    }
    inputs
}

/// Union of step outputs. Any of them may be missing depending on the
/// path taken, so all are optional.
fn infer_outputs(steps: &[(String, Arc<dyn Step>)]) -> Vec<Property> {
    let mut outputs: Vec<Property> = Vec::new();
    for (_, s) in steps {
        for output in s.outputs() {
            if !outputs.iter().any(|p| p.name == output.name) {
                outputs.push(output.optional());
            }
        }
    }
    outputs
}
