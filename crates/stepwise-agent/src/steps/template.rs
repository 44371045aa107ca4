use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::error::Result;
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

use super::template_inputs;
use crate::flow::{Step, StepInvocation, StepOutcome};

pub const TEMPLATE_OUTPUT: &str = "output";

/// Renders a template from its inputs into the `output` string.
#[derive(Debug, Clone)]
pub struct TemplateRenderingStep {
    template: String,
}

impl TemplateRenderingStep {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl Step for TemplateRenderingStep {
    fn kind(&self) -> &'static str {
        "template_rendering"
    }

    fn inputs(&self) -> Vec<Property> {
        template_inputs(&self.template)
    }

    fn outputs(&self) -> Vec<Property> {
        vec![Property::string(TEMPLATE_OUTPUT)]
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let text = call.scope.ctx.render(&self.template, &call.inputs)?;
            let mut outputs = ValueMap::new();
            outputs.insert(TEMPLATE_OUTPUT.into(), Value::String(text));
            Ok(StepOutcome::next(outputs))
        })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "template_rendering", "template": self.template })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_follow_placeholders() {
        let step = TemplateRenderingStep::new("{{ greeting }}, {{ user.name }}! {{greeting}}");
        let names: Vec<String> = step.inputs().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["greeting", "user"]);
    }
}
