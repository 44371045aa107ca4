use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{Message, ToolRequest};

/// Name of the branch every step emits unless it declares others.
pub const DEFAULT_BRANCH: &str = "next";

/// Named bag of values flowing between steps, tools and agents.
pub type ValueMap = serde_json::Map<String, Value>;

/// Why a soft interrupt stopped execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InterruptReason {
    Timeout { elapsed_secs: u64, limit_secs: u64 },
    TokenBudget { used: u64, budget: u64 },
}

impl std::fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout {
                elapsed_secs,
                limit_secs,
            } => write!(f, "timeout after {}s (limit {}s)", elapsed_secs, limit_secs),
            Self::TokenBudget { used, budget } => {
                write!(f, "token budget exhausted ({} of {} tokens)", used, budget)
            }
        }
    }
}

/// Cumulative LLM token usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// Message ID from the API.
    MessageId(String),
}

/// Tool definition for sending to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Provider-agnostic prompt handed to an [`LlmClient`](crate::traits::LlmClient).
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// JSON schema the response must conform to, when structured output is wanted.
    pub output_schema: Option<Value>,
}

impl Prompt {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// A fully accumulated LLM response.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub tool_requests: Vec<ToolRequest>,
    pub usage: TokenUsage,
    pub stop_reason: Option<StopReason>,
}

impl Generation {
    pub fn has_tool_requests(&self) -> bool {
        !self.tool_requests.is_empty()
    }
}

/// Receives tokens a tool spends on its own LLM calls, so they count
/// against the caller's budget.
pub trait UsageSink: Send + Sync + std::fmt::Debug {
    fn record_usage(&self, usage: TokenUsage);
}

/// Context passed to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub conversation_id: String,
    pub request_id: Option<String>,
    /// Token obtained through the tool's auth provider, if it has one.
    pub auth_token: Option<String>,
    pub usage: Option<Arc<dyn UsageSink>>,
}

impl ToolContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(sink);
        self
    }

    /// Charge `usage` to whoever invoked the tool. A no-op without a sink.
    pub fn record_usage(&self, usage: TokenUsage) {
        if let Some(sink) = &self.usage {
            sink.record_usage(usage);
        }
    }
}

/// What a tool hands back: a single value, or a channel of values where every
/// item but the last is progress and the last one is the result.
#[derive(Debug)]
pub enum ToolOutput {
    Value(Value),
    Stream(mpsc::Receiver<Result<Value>>),
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Authorization challenge presented to the caller for a tool that needs auth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub authorization_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_add() {
        let mut usage = TokenUsage::new(10, 5);
        usage.add(TokenUsage::new(3, 2));
        assert_eq!(usage.total(), 20);
    }

    #[test]
    fn test_interrupt_reason_roundtrip() {
        let reason = InterruptReason::TokenBudget {
            used: 120,
            budget: 100,
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "token_budget");
        let back: InterruptReason = serde_json::from_value(json).unwrap();
        assert_eq!(back, reason);
        assert!(reason.to_string().contains("120 of 100"));
    }
}
