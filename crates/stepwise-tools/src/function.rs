use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::traits::{AuthProvider, Tool};
use stepwise_core::types::{ToolContext, ToolOutput};

type Handler = Arc<dyn Fn(Value, ToolContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A tool backed by a Rust closure.
///
/// ```ignore
/// let tool = FunctionTool::new("uppercase", "Uppercase text", |args, _ctx| async move {
///     Ok(json!(args["text"].as_str().unwrap_or_default().to_uppercase()))
/// })
/// .input(Property::string("text"))
/// .output(Property::string("upper"));
/// ```
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    inputs: Vec<Property>,
    output: Option<Property>,
    handler: Handler,
    timeout_secs: u64,
    requires_confirmation: bool,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args, ctx| Box::pin(f(args, ctx)));
        Self {
            name: name.into(),
            description: description.into(),
            inputs: Vec::new(),
            output: None,
            handler,
            timeout_secs: 30,
            requires_confirmation: false,
            auth: None,
        }
    }

    /// A CPU-bound tool. The closure runs on the blocking thread pool so it
    /// does not stall other conversations on the async scheduler.
    pub fn blocking<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let tool_name = name.clone();
        let f = Arc::new(f);
        Self::new(name, description, move |args, _ctx| {
            let f = f.clone();
            let tool_name = tool_name.clone();
            async move {
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| StepwiseError::ToolExecution {
                        tool: tool_name,
                        message: format!("blocking task failed: {}", e),
                    })?
            }
        })
    }

    pub fn input(mut self, property: Property) -> Self {
        self.inputs.push(property);
        self
    }

    pub fn output(mut self, property: Property) -> Self {
        self.output = Some(property);
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_auth(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }
}

impl Tool for FunctionTool {
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

    fn execute(&self, args: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        let fut = (self.handler)(args, ctx);
        Box::pin(async move { fut.await.map(ToolOutput::Value) })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
    }

    fn auth(&self) -> Option<Arc<dyn AuthProvider>> {
        self.auth.clone()
    }
}
