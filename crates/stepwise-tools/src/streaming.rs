use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use stepwise_core::error::Result;
use stepwise_core::property::Property;
use stepwise_core::traits::Tool;
use stepwise_core::types::{ToolContext, ToolOutput};

/// Sending half handed to a streaming tool's producer.
pub type ChunkSender = mpsc::Sender<Result<Value>>;

type Producer =
    Arc<dyn Fn(Value, ToolContext, ChunkSender) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A tool whose producer pushes values onto a channel. Every value but the
/// last is progress; the last one, followed by the channel closing, is the
/// result.
pub struct StreamingTool {
    name: String,
    description: String,
    inputs: Vec<Property>,
    output: Option<Property>,
    producer: Producer,
    buffer: usize,
    timeout_secs: u64,
}

impl StreamingTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, ToolContext, ChunkSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let producer: Producer = Arc::new(move |args, ctx, tx| Box::pin(f(args, ctx, tx)));
        Self {
            name: name.into(),
            description: description.into(),
            inputs: Vec::new(),
            output: None,
            producer,
            buffer: 16,
            timeout_secs: 120,
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

    pub fn buffer(mut self, size: usize) -> Self {
        self.buffer = size.max(1);
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Tool for StreamingTool {
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

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn execute(&self, args: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let producer = self.producer.clone();
        Box::pin(async move {
            let errors = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = producer(args, ctx, tx).await {
                    let _ = errors.send(Err(e)).await;
                }
            });
            Ok(ToolOutput::Stream(rx))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_core::error::StepwiseError;

    async fn drain(out: ToolOutput) -> Vec<Result<Value>> {
        match out {
            ToolOutput::Stream(mut rx) => {
                let mut items = Vec::new();
                while let Some(item) = rx.recv().await {
                    items.push(item);
                }
                items
            }
            ToolOutput::Value(_) => panic!("expected a stream"),
        }
    }

    #[tokio::test]
    async fn test_streams_chunks_in_order() {
        let tool = StreamingTool::new("words", "Split words", |args, _ctx, tx| async move {
            for w in args["text"].as_str().unwrap_or_default().split_whitespace() {
                let _ = tx.send(Ok(json!(w))).await;
            }
            Ok(())
        });
        let items = drain(tool.execute(json!({"text": "a b c"}), ToolContext::default()).await.unwrap()).await;
        let values: Vec<Value> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_producer_error_is_forwarded() {
        let tool = StreamingTool::new("bad", "Fails midway", |_args, _ctx, tx| async move {
            let _ = tx.send(Ok(json!(1))).await;
            Err(StepwiseError::ToolExecution {
                tool: "bad".into(),
                message: "disk full".into(),
            })
        });
        let items = drain(tool.execute(json!({}), ToolContext::default()).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }
}
