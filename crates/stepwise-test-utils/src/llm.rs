use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::message::ToolRequest;
use stepwise_core::traits::LlmClient;
use stepwise_core::types::{Prompt, StopReason, StreamDelta, TokenUsage};

/// One canned LLM turn.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    ToolCalls { text: String, calls: Vec<ToolRequest> },
    Error(String),
}

/// LLM client that replays queued replies in order and records every
/// prompt it receives. Runs out with an `LlmRequest` error.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<Prompt>>,
    usage: TokenUsage,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.push(Reply::Text(text.into()))
    }

    /// A turn with one tool call and a fixed id.
    pub fn tool_call(self, id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        self.tool_calls(vec![ToolRequest::new(name, args).with_id(id)])
    }

    pub fn tool_calls(self, calls: Vec<ToolRequest>) -> Self {
        self.push(Reply::ToolCalls {
            text: String::new(),
            calls,
        })
    }

    pub fn error(self, message: impl Into<String>) -> Self {
        self.push(Reply::Error(message.into()))
    }

    /// Usage reported with every reply.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage::new(input_tokens, output_tokens);
        self
    }

    pub fn push(self, reply: Reply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        prompt: Prompt,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.prompts.lock().unwrap().push(prompt);
        let reply = self.replies.lock().unwrap().pop_front();
        let usage = self.usage;
        Box::pin(async move {
            let reply = reply.ok_or_else(|| StepwiseError::LlmRequest("script exhausted".into()))?;
            let mut deltas: Vec<Result<StreamDelta>> = Vec::new();
            let stop = match reply {
                Reply::Error(message) => return Err(StepwiseError::LlmRequest(message)),
                Reply::Text(text) => {
                    // Two chunks, so streaming consumers see more than one delta.
                    let mid = text.char_indices().nth(text.chars().count() / 2).map_or(0, |(i, _)| i);
                    let (head, tail) = text.split_at(mid);
                    for part in [head, tail] {
                        if !part.is_empty() {
                            deltas.push(Ok(StreamDelta::TextDelta(part.to_string())));
                        }
                    }
                    StopReason::EndTurn
                }
                Reply::ToolCalls { text, calls } => {
                    if !text.is_empty() {
                        deltas.push(Ok(StreamDelta::TextDelta(text)));
                    }
                    for (index, call) in calls.into_iter().enumerate() {
                        deltas.push(Ok(StreamDelta::ToolUseStart {
                            index,
                            id: call.id,
                            name: call.name,
                        }));
                        deltas.push(Ok(StreamDelta::ToolInputDelta {
                            index,
                            delta: call.args.to_string(),
                        }));
                    }
                    StopReason::ToolUse
                }
            };
            deltas.push(Ok(StreamDelta::Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }));
            deltas.push(Ok(StreamDelta::Stop(stop)));
            Ok(stream::iter(deltas).boxed())
        })
    }
}
