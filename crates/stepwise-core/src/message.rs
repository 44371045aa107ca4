use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StepwiseError};

/// Text used for tool results synthesized while healing a history.
pub const SKIPPED_TOOL_RESULT: &str = "skipped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    System,
    User,
    Agent,
    ToolRequest,
    ToolResult,
}

/// A single content chunk in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Structured {
        value: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            args,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub request_id: String,
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(request_id: impl Into<String>, content: Value) -> Self {
        Self {
            request_id: request_id.into(),
            content,
            is_error: false,
        }
    }

    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            content: Value::String(message.into()),
            is_error: true,
        }
    }

    pub fn skipped(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            content: Value::String(SKIPPED_TOOL_RESULT.into()),
            is_error: true,
        }
    }

    /// Content rendered as text: strings verbatim, everything else as JSON.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub contents: Vec<MessageContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_requests: Vec<ToolRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl Message {
    fn build(message_type: MessageType, contents: Vec<MessageContent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            contents,
            tool_requests: Vec::new(),
            tool_result: None,
            timestamp: Utc::now(),
            sender: None,
        }
    }

    fn text_contents(text: String) -> Vec<MessageContent> {
        if text.is_empty() {
            Vec::new()
        } else {
            vec![MessageContent::Text { text }]
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::build(MessageType::System, Self::text_contents(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::build(MessageType::User, Self::text_contents(text.into()))
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::build(MessageType::Agent, Self::text_contents(text.into()))
    }

    /// An agent turn that requests tool calls, with optional accompanying text.
    pub fn tool_requests(text: impl Into<String>, requests: Vec<ToolRequest>) -> Self {
        let mut msg = Self::build(MessageType::ToolRequest, Self::text_contents(text.into()));
        msg.tool_requests = requests;
        msg
    }

    pub fn tool_result(result: ToolResult) -> Self {
        let mut msg = Self::build(MessageType::ToolResult, Vec::new());
        msg.tool_result = Some(result);
        msg
    }

    pub fn structured(message_type: MessageType, value: Value) -> Self {
        Self::build(message_type, vec![MessageContent::Structured { value }])
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Concatenated text chunks. Tool results render their content.
    pub fn text(&self) -> String {
        let text: String = self
            .contents
            .iter()
            .filter_map(|c| match c {
                MessageContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        match (&self.tool_result, text.is_empty()) {
            (Some(result), true) => result.content_text(),
            _ => text,
        }
    }

    /// First structured chunk, if any.
    pub fn structured_value(&self) -> Option<&Value> {
        self.contents.iter().find_map(|c| match c {
            MessageContent::Structured { value } => Some(value),
            _ => None,
        })
    }
}

/// Ordered message history of one conversation thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageList {
    messages: Vec<Message>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from existing messages, checking the tool pairing invariant.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        let list = Self { messages };
        list.validate_pairing()?;
        Ok(list)
    }

    /// Append a message. A TOOL_RESULT must answer an earlier, still
    /// unanswered TOOL_REQUEST.
    pub fn append(&mut self, message: Message) -> Result<()> {
        if message.message_type == MessageType::ToolResult {
            let result = message.tool_result.as_ref().ok_or_else(|| {
                StepwiseError::validation("message", "TOOL_RESULT message carries no result")
            })?;
            if !self.pending_ids().contains(result.request_id.as_str()) {
                return Err(StepwiseError::validation(
                    "message",
                    format!(
                        "tool result '{}' does not answer a pending tool request",
                        result.request_id
                    ),
                ));
            }
        }
        self.messages.push(message);
        Ok(())
    }

    /// Append several messages in order.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) -> Result<()> {
        for m in messages {
            self.append(m)?;
        }
        Ok(())
    }

    /// Replace the whole history, e.g. after a transform.
    pub fn replace(&mut self, messages: Vec<Message>) -> Result<()> {
        *self = Self::from_messages(messages)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Messages appended at or after `index`.
    pub fn since(&self, index: usize) -> &[Message] {
        &self.messages[index.min(self.messages.len())..]
    }

    pub fn last_of_type(&self, message_type: MessageType) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.message_type == message_type)
    }

    fn pending_ids(&self) -> HashSet<&str> {
        let mut pending = HashSet::new();
        for m in &self.messages {
            match m.message_type {
                MessageType::ToolRequest => {
                    pending.extend(m.tool_requests.iter().map(|r| r.id.as_str()));
                }
                MessageType::ToolResult => {
                    if let Some(r) = &m.tool_result {
                        pending.remove(r.request_id.as_str());
                    }
                }
                _ => {}
            }
        }
        pending
    }

    /// Tool requests that have no result yet, in declaration order.
    pub fn pending_tool_requests(&self) -> Vec<ToolRequest> {
        let pending = self.pending_ids();
        self.messages
            .iter()
            .flat_map(|m| m.tool_requests.iter())
            .filter(|r| pending.contains(r.id.as_str()))
            .cloned()
            .collect()
    }

    /// A copy of the history safe to send to an LLM: every tool request is
    /// immediately followed by its results (synthesizing `"skipped"` ones for
    /// unanswered requests) and orphan results are dropped.
    pub fn healed(&self) -> Vec<Message> {
        let mut results: HashMap<&str, &Message> = HashMap::new();
        let mut seen_requests: HashSet<&str> = HashSet::new();
        for m in &self.messages {
            match m.message_type {
                MessageType::ToolRequest => {
                    seen_requests.extend(m.tool_requests.iter().map(|r| r.id.as_str()));
                }
                MessageType::ToolResult => {
                    if let Some(r) = &m.tool_result {
                        if seen_requests.contains(r.request_id.as_str()) {
                            results.entry(r.request_id.as_str()).or_insert(m);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut healed = Vec::with_capacity(self.messages.len());
        for m in &self.messages {
            match m.message_type {
                MessageType::ToolResult => {}
                MessageType::ToolRequest => {
                    healed.push(m.clone());
                    for req in &m.tool_requests {
                        match results.get(req.id.as_str()) {
                            Some(result) => healed.push((*result).clone()),
                            None => healed.push(Message::tool_result(ToolResult::skipped(&req.id))),
                        }
                    }
                }
                _ => healed.push(m.clone()),
            }
        }
        healed
    }

    /// Check that every result answers an earlier request exactly once and
    /// that unanswered requests only sit at the tail of the history.
    pub fn validate_pairing(&self) -> Result<()> {
        let mut requested: HashMap<&str, usize> = HashMap::new();
        let mut answered: HashSet<&str> = HashSet::new();

        for (idx, m) in self.messages.iter().enumerate() {
            match m.message_type {
                MessageType::ToolRequest => {
                    for r in &m.tool_requests {
                        requested.insert(r.id.as_str(), idx);
                    }
                }
                MessageType::ToolResult => {
                    let r = m.tool_result.as_ref().ok_or_else(|| {
                        StepwiseError::validation("messages", "TOOL_RESULT message carries no result")
                    })?;
                    let id = r.request_id.as_str();
                    if !requested.contains_key(id) {
                        return Err(StepwiseError::validation(
                            "messages",
                            format!("tool result '{}' has no preceding request", id),
                        ));
                    }
                    if !answered.insert(id) {
                        return Err(StepwiseError::validation(
                            "messages",
                            format!("tool request '{}' answered twice", id),
                        ));
                    }
                }
                _ => {}
            }
        }

        for (id, idx) in requested {
            if answered.contains(id) {
                continue;
            }
            let tail_only_results = self.messages[idx + 1..]
                .iter()
                .all(|m| m.message_type == MessageType::ToolResult);
            if !tail_only_results {
                return Err(StepwiseError::validation(
                    "messages",
                    format!("tool request '{}' left unanswered mid-history", id),
                ));
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a MessageList {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, name: &str) -> ToolRequest {
        ToolRequest::new(name, json!({})).with_id(id)
    }

    #[test]
    fn test_append_rejects_orphan_result() {
        let mut list = MessageList::new();
        list.append(Message::user("hi")).unwrap();
        let err = list
            .append(Message::tool_result(ToolResult::success("nope", json!("x"))))
            .unwrap_err();
        assert!(err.to_string().contains("does not answer"));
    }

    #[test]
    fn test_append_rejects_double_answer() {
        let mut list = MessageList::new();
        list.append(Message::tool_requests("", vec![request("a", "t")])).unwrap();
        list.append(Message::tool_result(ToolResult::success("a", json!(1)))).unwrap();
        assert!(list
            .append(Message::tool_result(ToolResult::success("a", json!(2))))
            .is_err());
    }

    #[test]
    fn test_pending_tool_requests() {
        let mut list = MessageList::new();
        list.append(Message::tool_requests(
            "",
            vec![request("a", "t1"), request("b", "t2")],
        ))
        .unwrap();
        list.append(Message::tool_result(ToolResult::success("a", json!(1)))).unwrap();
        let pending = list.pending_tool_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
        assert!(list.validate_pairing().is_ok());
    }

    #[test]
    fn test_healed_inserts_skipped_and_reorders() {
        let messages = vec![
            Message::user("q"),
            Message::tool_requests("", vec![request("a", "t1"), request("b", "t2")]),
            Message::tool_result(ToolResult::success("b", json!("B"))),
            Message::agent("done"),
        ];
        // Built directly: "a" is unanswered mid-history, which healing repairs.
        let list = MessageList { messages };
        assert!(list.validate_pairing().is_err());

        let healed = list.healed();
        let kinds: Vec<MessageType> = healed.iter().map(|m| m.message_type).collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::User,
                MessageType::ToolRequest,
                MessageType::ToolResult,
                MessageType::ToolResult,
                MessageType::Agent
            ]
        );
        assert_eq!(healed[2].tool_result.as_ref().unwrap().request_id, "a");
        assert_eq!(healed[2].text(), SKIPPED_TOOL_RESULT);
        assert_eq!(healed[3].text(), "B");
        assert!(MessageList::from_messages(healed).is_ok());
    }

    #[test]
    fn test_healed_drops_orphans() {
        let list = MessageList {
            messages: vec![
                Message::tool_result(ToolResult::success("ghost", json!(1))),
                Message::user("hi"),
            ],
        };
        let healed = list.healed();
        assert_eq!(healed.len(), 1);
        assert_eq!(healed[0].message_type, MessageType::User);
    }

    #[test]
    fn test_message_serde() {
        let msg = Message::tool_requests("calling", vec![request("a", "get_time")]).with_sender("bot");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "TOOL_REQUEST");
        assert_eq!(v["contents"][0]["type"], "text");
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_text_of_tool_result() {
        let msg = Message::tool_result(ToolResult::success("a", json!({"x": 1})));
        assert_eq!(msg.text(), "{\"x\":1}");
    }
}
