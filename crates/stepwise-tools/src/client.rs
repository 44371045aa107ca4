use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::traits::Tool;
use stepwise_core::types::{ToolContext, ToolOutput};

/// A tool executed by the caller. Calling it suspends execution with a
/// tool request; the caller submits the result and resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<Property>,
    #[serde(default)]
    pub output: Option<Property>,
}

impl ClientTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            inputs: Vec::new(),
            output: None,
        }
    }

    pub fn input(mut self, property: Property) -> Self {
        self.inputs.push(property);
        self
    }

    pub fn output(mut self, property: Property) -> Self {
        self.output = Some(property);
        self
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        serde_json::from_value(config.clone())
            .map_err(|e| StepwiseError::Deserialization(format!("client tool: {}", e)))
    }
}

impl Tool for ClientTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn inputs(&self) -> Vec<Property> {
        self.inputs.clone()
    }

    fn output(&self) -> Option<Property> {
        self.output.clone()
    }

    fn is_client_side(&self) -> bool {
        true
    }

    fn execute(&self, _args: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            Err(StepwiseError::Config(format!(
                "client-side tool '{}' cannot run in-process",
                self.name
            )))
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "tool_type": "client",
            "name": self.name,
            "description": self.description,
            "inputs": self.inputs,
            "output": self.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let tool = ClientTool::new("open_file", "Open a file in the user's editor")
            .input(Property::string("path"));
        let config = tool.to_config();
        assert_eq!(config["tool_type"], "client");

        let back = ClientTool::from_config(&config).unwrap();
        assert_eq!(back.name, "open_file");
        assert_eq!(back.inputs, tool.inputs);
        assert!(back.may_suspend());
    }

    #[tokio::test]
    async fn test_refuses_in_process_execution() {
        let tool = ClientTool::new("x", "");
        let err = tool.execute(Value::Null, ToolContext::default()).await.unwrap_err();
        assert_eq!(err.kind(), "Config");
    }
}
