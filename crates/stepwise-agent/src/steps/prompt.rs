use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::error::Result;
use stepwise_core::message::Message;
use stepwise_core::property::{object_schema, Property};
use stepwise_core::types::{Prompt, ValueMap};
use stepwise_llm::parse_structured;

use super::template_inputs;
use crate::flow::{Step, StepInvocation, StepOutcome};
use crate::model::LlmHandle;

pub const PROMPT_OUTPUT: &str = "output";

/// Single LLM call on a rendered prompt. With declared outputs the reply
/// is parsed as structured output; otherwise the text lands in `output`.
/// The conversation's messages are neither read nor written.
#[derive(Debug, Clone)]
pub struct PromptExecutionStep {
    llm: LlmHandle,
    template: String,
    outputs: Vec<Property>,
}

impl PromptExecutionStep {
    pub fn new(llm: LlmHandle, template: impl Into<String>) -> Self {
        Self {
            llm,
            template: template.into(),
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<Property>) -> Self {
        self.outputs = outputs;
        self
    }
}

impl Step for PromptExecutionStep {
    fn kind(&self) -> &'static str {
        "prompt_execution"
    }

    fn inputs(&self) -> Vec<Property> {
        template_inputs(&self.template)
    }

    fn outputs(&self) -> Vec<Property> {
        if self.outputs.is_empty() {
            vec![Property::string(PROMPT_OUTPUT)]
        } else {
            self.outputs.clone()
        }
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let ctx = call.scope.ctx;
            let text = ctx.render(&self.template, &call.inputs)?;
            let mut prompt = Prompt::new(vec![Message::user(text)]);
            if !self.outputs.is_empty() {
                prompt = prompt.with_output_schema(object_schema(&self.outputs));
            }

            let generation = self.llm.generate(prompt, call.name, ctx).await?;
            let outputs = if self.outputs.is_empty() {
                let mut outputs = ValueMap::new();
                outputs.insert(PROMPT_OUTPUT.into(), Value::String(generation.text));
                outputs
            } else {
                parse_structured(&generation.text, &self.outputs)?
            };
            Ok(StepOutcome::next(outputs))
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "step_type": "prompt_execution",
            "llm": self.llm.id,
            "template": self.template,
            "outputs": self.outputs,
        })
    }
}
