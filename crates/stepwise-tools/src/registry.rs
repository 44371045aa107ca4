use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::{EventBus, ExecutionEvent};
use stepwise_core::message::ToolRequest;
use stepwise_core::property::coerce_values;
use stepwise_core::traits::Tool;
use stepwise_core::types::{ToolContext, ToolDefinition, ToolOutput, ValueMap};

/// Registry of available tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Tool definitions for sending to the LLM, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool request by name.
    pub async fn execute(
        &self,
        request: &ToolRequest,
        ctx: ToolContext,
        events: Option<&EventBus>,
    ) -> Result<Value> {
        let tool = self
            .get(&request.name)
            .ok_or_else(|| StepwiseError::ToolNotFound(request.name.clone()))?;
        execute_tool(tool.as_ref(), &request.id, request.args.clone(), ctx, events).await
    }
}

impl FromIterator<Arc<dyn Tool>> for ToolRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Tool>>>(iter: I) -> Self {
        let mut registry = Self::new();
        for tool in iter {
            registry.register_arc(tool);
        }
        registry
    }
}

/// Validate arguments against the tool's declared inputs, filling defaults.
pub fn validate_args(tool: &dyn Tool, args: Value) -> Result<Value> {
    let map = match args {
        Value::Object(map) => map,
        Value::Null => ValueMap::new(),
        other => {
            return Err(StepwiseError::validation(
                tool.name(),
                format!("arguments must be an object, got {}", other),
            ))
        }
    };
    Ok(Value::Object(coerce_values(&tool.inputs(), map, tool.name())?))
}

/// Run one tool call: validate arguments, execute under the tool's timeout,
/// drain streamed output (all but the last value are progress), and coerce
/// the result against the declared output.
pub async fn execute_tool(
    tool: &dyn Tool,
    request_id: &str,
    args: Value,
    ctx: ToolContext,
    events: Option<&EventBus>,
) -> Result<Value> {
    let name = tool.name().to_string();
    let args = validate_args(tool, args)?;

    if let Some(bus) = events {
        bus.publish(ExecutionEvent::ToolStart {
            tool: name.clone(),
            request_id: request_id.to_string(),
            args: args.clone(),
        });
    }
    debug!(tool = %name, request_id, "Executing tool");

    let result = run_with_deadline(tool, request_id, args, ctx, events).await;

    if let Some(bus) = events {
        bus.publish(ExecutionEvent::ToolEnd {
            tool: name.clone(),
            request_id: request_id.to_string(),
            is_error: result.is_err(),
        });
    }
    if let Err(e) = &result {
        warn!(tool = %name, request_id, error = %e, "Tool failed");
    }
    result
}

async fn run_with_deadline(
    tool: &dyn Tool,
    request_id: &str,
    args: Value,
    ctx: ToolContext,
    events: Option<&EventBus>,
) -> Result<Value> {
    let timeout_secs = tool.timeout_secs();
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let timed_out = || StepwiseError::ToolTimeout {
        tool: tool.name().to_string(),
        timeout_secs,
    };

    let output = tokio::time::timeout_at(deadline, tool.execute(args, ctx))
        .await
        .map_err(|_| timed_out())??;

    let value = match output {
        ToolOutput::Value(v) => v,
        ToolOutput::Stream(mut rx) => {
            let mut last: Option<Value> = None;
            loop {
                let item = tokio::time::timeout_at(deadline, rx.recv())
                    .await
                    .map_err(|_| timed_out())?;
                match item {
                    Some(Ok(v)) => {
                        if let (Some(prev), Some(bus)) = (last.replace(v), events) {
                            bus.publish(ExecutionEvent::ToolProgress {
                                tool: tool.name().to_string(),
                                request_id: request_id.to_string(),
                                chunk: prev,
                            });
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
            last.unwrap_or(Value::Null)
        }
    };

    match tool.output() {
        Some(descriptor) => descriptor.coerce(value).map_err(|e| StepwiseError::ToolExecution {
            tool: tool.name().to_string(),
            message: format!("result does not match declared output: {}", e),
        }),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use stepwise_core::property::Property;
    use tokio::sync::mpsc;

    struct Add;

    impl Tool for Add {
        fn name(&self) -> &str {
            "add"
        }
        fn description(&self) -> &str {
            "Add two integers"
        }
        fn inputs(&self) -> Vec<Property> {
            vec![
                Property::integer("a"),
                Property::integer("b").with_default(json!(1)),
            ]
        }
        fn output(&self) -> Option<Property> {
            Some(Property::integer("sum"))
        }
        fn execute(&self, args: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
            Box::pin(async move {
                let a = args["a"].as_i64().unwrap_or_default();
                let b = args["b"].as_i64().unwrap_or_default();
                // Return as a string to exercise output coercion.
                Ok(ToolOutput::Value(json!((a + b).to_string())))
            })
        }
    }

    struct Slow;

    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Never finishes in time"
        }
        fn inputs(&self) -> Vec<Property> {
            vec![]
        }
        fn timeout_secs(&self) -> u64 {
            1
        }
        fn execute(&self, _args: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ToolOutput::Value(Value::Null))
            })
        }
    }

    struct Counter;

    impl Tool for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn description(&self) -> &str {
            "Streams 1, 2, 3"
        }
        fn inputs(&self) -> Vec<Property> {
            vec![]
        }
        fn execute(&self, _args: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
            Box::pin(async move {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    for i in 1..=3 {
                        let _ = tx.send(Ok(json!(i))).await;
                    }
                });
                Ok(ToolOutput::Stream(rx))
            })
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Add);
        r.register(Slow);
        r.register(Counter);
        r
    }

    #[tokio::test]
    async fn test_execute_validates_and_coerces() {
        let req = ToolRequest::new("add", json!({"a": "2"}));
        let out = registry().execute(&req, ToolContext::default(), None).await.unwrap();
        assert_eq!(out, json!(3));
    }

    #[tokio::test]
    async fn test_execute_rejects_bad_args() {
        let req = ToolRequest::new("add", json!({"a": "two"}));
        let err = registry()
            .execute(&req, ToolContext::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let req = ToolRequest::new("nope", json!({}));
        let err = registry()
            .execute(&req, ToolContext::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepwiseError::ToolNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let req = ToolRequest::new("slow", json!({}));
        let err = registry()
            .execute(&req, ToolContext::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepwiseError::ToolTimeout { timeout_secs: 1, .. }));
    }

    #[tokio::test]
    async fn test_stream_progress_and_final_value() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let req = ToolRequest::new("counter", json!({}));
        let out = registry()
            .execute(&req, ToolContext::default(), Some(&bus))
            .await
            .unwrap();
        assert_eq!(out, json!(3));

        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::ToolProgress { chunk, .. } = event {
                progress.push(chunk);
            }
        }
        assert_eq!(progress, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_definitions_sorted() {
        let names: Vec<String> = registry().definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["add", "counter", "slow"]);
    }
}
