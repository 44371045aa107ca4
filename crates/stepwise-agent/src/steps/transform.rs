use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use stepwise_core::error::Result;
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

use crate::flow::{Step, StepInvocation, StepOutcome};
use crate::transforms::MessageTransform;

/// Rewrites the conversation history in place with a message transform.
#[derive(Clone)]
pub struct TransformMessagesStep {
    transform: Arc<dyn MessageTransform>,
}

impl TransformMessagesStep {
    pub fn new(transform: impl MessageTransform) -> Self {
        Self::from_arc(Arc::new(transform))
    }

    pub fn from_arc(transform: Arc<dyn MessageTransform>) -> Self {
        Self { transform }
    }
}

impl Step for TransformMessagesStep {
    fn kind(&self) -> &'static str {
        "transform_messages"
    }

    fn inputs(&self) -> Vec<Property> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Property> {
        Vec::new()
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let StepInvocation { name, scope, .. } = call;
            let before = scope.messages.len();
            let messages = scope.messages.as_slice().to_vec();
            let transformed = self.transform.apply(messages, scope.ctx).await?;
            scope.messages.replace(transformed)?;
            debug!(step = name, transform = self.transform.name(), before, after = scope.messages.len(), "Messages transformed");
            Ok(StepOutcome::next(ValueMap::new()))
        })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "transform_messages", "transform": self.transform.to_config() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ConversationalComponent;
    use crate::context::ExecutionContext;
    use crate::flow::Flow;
    use crate::steps::OutputMessageStep;
    use crate::transforms::TokenBudgetTransform;

    #[tokio::test]
    async fn test_history_rewritten_in_place() {
        let flow = Flow::builder("chatter")
            .step("one", OutputMessageStep::new("first"))
            .step("two", OutputMessageStep::new("second"))
            .step("three", OutputMessageStep::new("third"))
            .step("prune", TransformMessagesStep::new(TokenBudgetTransform::new(0).keep_recent(1)))
            .sequence(&["one", "two", "three", "prune"])
            .build()
            .unwrap();

        let mut conversation = flow.start_conversation().unwrap();
        flow.execute(&mut conversation, &ExecutionContext::new())
            .await
            .unwrap();
        let texts: Vec<String> = conversation.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["third"]);
    }
}
