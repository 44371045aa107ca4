use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::error::Result;
use stepwise_core::property::Property;
use stepwise_core::types::{ValueMap, DEFAULT_BRANCH};

use crate::flow::{Step, StepInvocation, StepOutcome};

/// Terminal step. The flow finishes through `branch`.
#[derive(Debug, Clone)]
pub struct EndStep {
    branch: String,
}

impl EndStep {
    pub fn new() -> Self {
        Self::named(DEFAULT_BRANCH)
    }

    pub fn named(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
        }
    }
}

impl Default for EndStep {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for EndStep {
    fn kind(&self) -> &'static str {
        "end"
    }

    fn inputs(&self) -> Vec<Property> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Property> {
        Vec::new()
    }

    fn branches(&self) -> Vec<String> {
        vec![self.branch.clone()]
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn invoke<'a>(&'a self, _call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move { Ok(StepOutcome::branch(ValueMap::new(), self.branch.clone())) })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "end", "branch": self.branch })
    }
}
