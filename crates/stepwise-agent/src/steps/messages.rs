use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use stepwise_core::error::Result;
use stepwise_core::message::{Message, MessageType};
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

use super::template_inputs;
use crate::flow::{Step, StepInvocation, StepOutcome, StepState};
use crate::status::ExecutionStatus;

pub const USER_PROVIDED_INPUT: &str = "user_provided_input";
pub const OUTPUT_MESSAGE: &str = "output_message";

/// Suspends for a user message, optionally posting a prompt first.
#[derive(Debug, Clone, Default)]
pub struct InputMessageStep {
    message_template: Option<String>,
}

impl InputMessageStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(template: impl Into<String>) -> Self {
        Self {
            message_template: Some(template.into()),
        }
    }
}

impl Step for InputMessageStep {
    fn kind(&self) -> &'static str {
        "input_message"
    }

    fn inputs(&self) -> Vec<Property> {
        self.message_template
            .as_deref()
            .map(template_inputs)
            .unwrap_or_default()
    }

    fn outputs(&self) -> Vec<Property> {
        vec![Property::string(USER_PROVIDED_INPUT)]
    }

    fn may_suspend(&self) -> bool {
        true
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

            match state {
                StepState::Idle => {
                    let prompt = match &self.message_template {
                        Some(template) => {
                            let text = scope.ctx.render(template, &inputs)?;
                            scope.append(Message::agent(text.clone()))?;
                            Some(text)
                        }
                        None => None,
                    };
                    *state = StepState::AwaitingInput {
                        since: scope.messages.len(),
                    };
                    debug!(step = name, "Waiting for user input");
                    Ok(StepOutcome::Suspend(ExecutionStatus::user_message_request(prompt)))
                }
                StepState::AwaitingInput { since } => {
                    let reply = scope
                        .messages
                        .since(*since)
                        .iter()
                        .find(|m| m.message_type == MessageType::User)
                        .map(Message::text);
                    match reply {
                        Some(text) => {
                            let mut outputs = ValueMap::new();
                            outputs.insert(USER_PROVIDED_INPUT.into(), Value::String(text));
                            Ok(StepOutcome::next(outputs))
                        }
                        None => Ok(StepOutcome::Suspend(ExecutionStatus::user_message_request(None))),
                    }
                }
                other => Err(other.unexpected(name)),
            }
        })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "input_message", "message_template": self.message_template })
    }
}

/// Renders a template and posts it to the conversation.
#[derive(Debug, Clone)]
pub struct OutputMessageStep {
    template: String,
    message_type: MessageType,
}

impl OutputMessageStep {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            message_type: MessageType::Agent,
        }
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }
}

impl Step for OutputMessageStep {
    fn kind(&self) -> &'static str {
        "output_message"
    }

    fn inputs(&self) -> Vec<Property> {
        template_inputs(&self.template)
    }

    fn outputs(&self) -> Vec<Property> {
        vec![Property::string(OUTPUT_MESSAGE)]
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let mut scope = call.scope;
            let text = scope.ctx.render(&self.template, &call.inputs)?;
            let message = match self.message_type {
                MessageType::User => Message::user(text.clone()),
                MessageType::System => Message::system(text.clone()),
                _ => Message::agent(text.clone()),
            };
            scope.append(message)?;
            let mut outputs = ValueMap::new();
            outputs.insert(OUTPUT_MESSAGE.into(), Value::String(text));
            Ok(StepOutcome::next(outputs))
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "step_type": "output_message",
            "template": self.template,
            "message_type": self.message_type,
        })
    }
}
