use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::message::Message;
use stepwise_core::property::Property;
use stepwise_core::types::{Prompt, ValueMap};

use super::template_inputs;
use crate::flow::{Step, StepInvocation, StepOutcome};
use crate::model::LlmHandle;

/// Fallback branch of branching and choice steps.
pub const DEFAULT_CHOICE: &str = "default";
pub const NEXT_STEP_NAME: &str = "next_step_name";
pub const SELECTED_CHOICE: &str = "selected_choice";

/// Routes on `next_step_name` through a fixed mapping; unmapped values take
/// the `default` branch.
#[derive(Debug, Clone)]
pub struct BranchingStep {
    mapping: BTreeMap<String, String>,
}

impl BranchingStep {
    pub fn new<K, V>(mapping: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            mapping: mapping
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Step for BranchingStep {
    fn kind(&self) -> &'static str {
        "branching"
    }

    fn inputs(&self) -> Vec<Property> {
        vec![Property::string(NEXT_STEP_NAME)]
    }

    fn outputs(&self) -> Vec<Property> {
        Vec::new()
    }

    fn branches(&self) -> Vec<String> {
        let mut branches: Vec<String> = Vec::new();
        for branch in self.mapping.values() {
            if !branches.contains(branch) {
                branches.push(branch.clone());
            }
        }
        if !branches.iter().any(|b| b == DEFAULT_CHOICE) {
            branches.push(DEFAULT_CHOICE.to_string());
        }
        branches
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let key = call
                .inputs
                .get(NEXT_STEP_NAME)
                .and_then(Value::as_str)
                .unwrap_or_default();
            let branch = match self.mapping.get(key) {
                Some(branch) => branch.clone(),
                None => {
                    debug!(step = call.name, value = key, "No mapping, taking default branch");
                    DEFAULT_CHOICE.to_string()
                }
            };
            Ok(StepOutcome::branch(ValueMap::new(), branch))
        })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "branching", "mapping": self.mapping })
    }
}

/// A branch the LLM may pick, with the description it is shown.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Choice {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Lets an LLM pick the next branch from named, described choices.
#[derive(Debug, Clone)]
pub struct ChoiceSelectionStep {
    llm: LlmHandle,
    choices: Vec<Choice>,
    template: String,
}

impl ChoiceSelectionStep {
    pub fn new(llm: LlmHandle, choices: Vec<Choice>) -> Result<Self> {
        if choices.is_empty() {
            return Err(StepwiseError::Config("choice selection needs at least one choice".into()));
        }
        if choices.iter().any(|c| c.name == DEFAULT_CHOICE) {
            return Err(StepwiseError::Config(format!(
                "'{}' is reserved for the fallback branch",
                DEFAULT_CHOICE
            )));
        }
        Ok(Self {
            llm,
            choices,
            template: "{{ input }}".to_string(),
        })
    }

    /// Prompt template describing the situation; its placeholders become inputs.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    fn instructions(&self) -> String {
        let mut text = String::from(
            "Pick the most appropriate next step for the request below. \
             Answer with the step name only.\n\nSteps:\n",
        );
        for choice in &self.choices {
            text.push_str(&format!("- {}: {}\n", choice.name, choice.description));
        }
        text
    }

    /// Exact name first, then a name mentioned in the reply.
    fn pick(&self, answer: &str) -> Option<&Choice> {
        let answer = answer.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.');
        self.choices
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(answer))
            .or_else(|| {
                let lower = answer.to_lowercase();
                self.choices
                    .iter()
                    .find(|c| lower.contains(&c.name.to_lowercase()))
            })
    }
}

impl Step for ChoiceSelectionStep {
    fn kind(&self) -> &'static str {
        "choice_selection"
    }

    fn inputs(&self) -> Vec<Property> {
        template_inputs(&self.template)
    }

    fn outputs(&self) -> Vec<Property> {
        vec![Property::string(SELECTED_CHOICE)]
    }

    fn branches(&self) -> Vec<String> {
        self.choices
            .iter()
            .map(|c| c.name.clone())
            .chain(std::iter::once(DEFAULT_CHOICE.to_string()))
            .collect()
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let ctx = call.scope.ctx;
            let request = ctx.render(&self.template, &call.inputs)?;
            let prompt = Prompt::new(vec![Message::user(request)]).with_system(self.instructions());
            let generation = self.llm.generate(prompt, call.name, ctx).await?;

            let selected = match self.pick(&generation.text) {
                Some(choice) => choice.name.clone(),
                None => {
                    warn!(step = call.name, answer = %generation.text, "LLM picked no known choice");
                    DEFAULT_CHOICE.to_string()
                }
            };
            let mut outputs = ValueMap::new();
            outputs.insert(SELECTED_CHOICE.into(), Value::String(selected.clone()));
            Ok(StepOutcome::branch(outputs, selected))
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "step_type": "choice_selection",
            "llm": self.llm.id,
            "choices": self.choices,
            "template": self.template,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepwise_test_utils::ScriptedLlm;

    fn step() -> ChoiceSelectionStep {
        let llm = LlmHandle::new("scripted", Arc::new(ScriptedLlm::new()));
        ChoiceSelectionStep::new(
            llm,
            vec![
                Choice {
                    name: "billing".into(),
                    description: "Payment questions".into(),
                },
                Choice {
                    name: "support".into(),
                    description: "Technical problems".into(),
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_branching_branches_include_default() {
        let step = BranchingStep::new([("ok", "success"), ("err", "failure")]);
        assert_eq!(step.branches(), vec!["failure", "success", "default"]);
    }

    #[test]
    fn test_pick_matches_exact_then_mentioned() {
        let step = step();
        assert_eq!(step.pick(" Billing. ").map(|c| c.name.as_str()), Some("billing"));
        assert_eq!(
            step.pick("I would go with support here").map(|c| c.name.as_str()),
            Some("support")
        );
        assert!(step.pick("no idea").is_none());
    }

    #[test]
    fn test_default_name_reserved() {
        let llm = LlmHandle::new("scripted", Arc::new(ScriptedLlm::new()));
        let err = ChoiceSelectionStep::new(
            llm,
            vec![Choice {
                name: "default".into(),
                description: String::new(),
            }],
        );
        assert!(err.is_err());
    }
}
