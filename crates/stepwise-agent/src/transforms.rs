//! Message transforms run over the history before it is rendered into a
//! prompt. They work on whole units: a TOOL_REQUEST message and the results
//! answering it are kept, summarized or dropped together.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use stepwise_core::error::Result;
use stepwise_core::event::ExecutionEvent;
use stepwise_core::message::{Message, MessageContent, MessageType};
use stepwise_core::property::Property;
use stepwise_core::traits::{Datastore, Entity, Filter};
use stepwise_core::types::Prompt;

use crate::context::ExecutionContext;
use crate::model::LlmHandle;
use crate::tokens::{estimate_tokens, estimate_total};

/// Collection used to cache per-message summaries.
pub const SUMMARY_COLLECTION: &str = "message_summaries";

/// Entity schema of [`SUMMARY_COLLECTION`].
pub fn summary_cache_schema() -> Vec<Property> {
    vec![Property::string("message_id"), Property::string("summary")]
}

pub trait MessageTransform: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn apply<'a>(
        &'a self,
        messages: Vec<Message>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Vec<Message>>>;

    fn to_config(&self) -> Value;
}

/// Split a history into units. A unit is a single message, or a
/// TOOL_REQUEST message followed by its results.
pub(crate) fn units(messages: Vec<Message>) -> Vec<Vec<Message>> {
    let mut units: Vec<Vec<Message>> = Vec::new();
    for message in messages {
        let joins_previous = message.message_type == MessageType::ToolResult
            && units.last().is_some_and(|u| u[0].message_type == MessageType::ToolRequest);
        match units.last_mut() {
            Some(unit) if joins_previous => unit.push(message),
            _ => units.push(vec![message]),
        }
    }
    units
}

fn unit_tokens(unit: &[Message]) -> usize {
    estimate_total(unit)
}

fn publish_applied(ctx: &ExecutionContext, transform: &str, before: usize, after: usize) {
    info!(transform, before, after, "Transform applied");
    ctx.publish(ExecutionEvent::TransformApplied {
        transform: transform.to_string(),
        before,
        after,
    });
}

async fn summarize(
    llm: &LlmHandle,
    source: &str,
    instructions: &str,
    text: &str,
    ctx: &ExecutionContext,
) -> Result<String> {
    let prompt = Prompt::new(vec![Message::user(format!("{}\n\n{}", instructions, text))]);
    let generation = llm.generate(prompt, source, ctx).await?;
    Ok(generation.text.trim().to_string())
}

/// Replaces the text of individual oversized messages with a summary.
/// Tool requests and system messages are left alone; tool results keep
/// their request id.
pub struct MessageSummarizationTransform {
    llm: LlmHandle,
    max_message_tokens: usize,
    cache: Option<(String, Arc<dyn Datastore>)>,
}

impl MessageSummarizationTransform {
    pub fn new(llm: LlmHandle, max_message_tokens: usize) -> Self {
        Self {
            llm,
            max_message_tokens,
            cache: None,
        }
    }

    /// Cache summaries by message id in `datastore`, which must carry the
    /// [`SUMMARY_COLLECTION`] collection.
    pub fn with_cache(mut self, id: impl Into<String>, datastore: Arc<dyn Datastore>) -> Self {
        self.cache = Some((id.into(), datastore));
        self
    }

    async fn cached(&self, message_id: &str) -> Result<Option<String>> {
        let Some((_, store)) = &self.cache else {
            return Ok(None);
        };
        let mut filter = Filter::new();
        filter.insert("message_id".into(), json!(message_id));
        let hits = store.list(SUMMARY_COLLECTION, filter).await?;
        Ok(hits
            .first()
            .and_then(|e| e.get("summary"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn remember(&self, message_id: &str, summary: &str) -> Result<()> {
        if let Some((_, store)) = &self.cache {
            let mut entity = Entity::new();
            entity.insert("message_id".into(), json!(message_id));
            entity.insert("summary".into(), json!(summary));
            store.create(SUMMARY_COLLECTION, vec![entity]).await?;
        }
        Ok(())
    }

    async fn shorten(&self, mut message: Message, ctx: &ExecutionContext) -> Result<Message> {
        let summary = match self.cached(&message.id).await? {
            Some(summary) => {
                debug!(message_id = %message.id, "Summary cache hit");
                summary
            }
            None => {
                let summary = summarize(
                    &self.llm,
                    self.name(),
                    "Summarize the following message concisely, preserving key facts, \
                     numbers, identifiers and file paths. Output only the summary.",
                    &message.text(),
                    ctx,
                )
                .await?;
                self.remember(&message.id, &summary).await?;
                summary
            }
        };

        match &mut message.tool_result {
            Some(result) => result.content = Value::String(summary),
            None => message.contents = vec![MessageContent::Text { text: summary }],
        }
        Ok(message)
    }
}

impl MessageTransform for MessageSummarizationTransform {
    fn name(&self) -> &str {
        "message_summarization"
    }

    fn apply<'a>(
        &'a self,
        messages: Vec<Message>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Vec<Message>>> {
        Box::pin(async move {
            let before = estimate_total(&messages);
            let mut out = Vec::with_capacity(messages.len());
            let mut changed = false;
            for message in messages {
                let eligible = matches!(
                    message.message_type,
                    MessageType::User | MessageType::Agent | MessageType::ToolResult
                );
                if eligible && estimate_tokens(&message.text()) > self.max_message_tokens {
                    out.push(self.shorten(message, ctx).await?);
                    changed = true;
                } else {
                    out.push(message);
                }
            }
            if changed {
                publish_applied(ctx, self.name(), before, estimate_total(&out));
            }
            Ok(out)
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "transform_type": "message_summarization",
            "llm": self.llm.id,
            "max_message_tokens": self.max_message_tokens,
            "cache": self.cache.as_ref().map(|(id, _)| id),
        })
    }
}

/// Once the history exceeds `max_tokens`, replaces everything but leading
/// system messages and the last `keep_recent` units with one summary.
pub struct ConversationSummarizationTransform {
    llm: LlmHandle,
    max_tokens: usize,
    keep_recent: usize,
}

impl ConversationSummarizationTransform {
    pub fn new(llm: LlmHandle, max_tokens: usize) -> Self {
        Self {
            llm,
            max_tokens,
            keep_recent: 4,
        }
    }

    pub fn keep_recent(mut self, units: usize) -> Self {
        self.keep_recent = units;
        self
    }
}

impl MessageTransform for ConversationSummarizationTransform {
    fn name(&self) -> &str {
        "conversation_summarization"
    }

    fn apply<'a>(
        &'a self,
        messages: Vec<Message>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Vec<Message>>> {
        Box::pin(async move {
            let before = estimate_total(&messages);
            if before <= self.max_tokens {
                return Ok(messages);
            }

            let mut units = units(messages);
            let pinned = units
                .iter()
                .take_while(|u| u[0].message_type == MessageType::System)
                .count();
            if units.len() <= pinned + self.keep_recent {
                return Ok(units.into_iter().flatten().collect());
            }

            let tail = units.split_off(units.len() - self.keep_recent);
            let old = units.split_off(pinned);
            let transcript: String = old
                .iter()
                .flatten()
                .map(|m| format!("{:?}: {}\n", m.message_type, m.text()))
                .collect();
            let summary = summarize(
                &self.llm,
                self.name(),
                "Summarize the following conversation concisely, preserving key facts, \
                 decisions, tool results and open questions. Output only the summary.",
                &transcript,
                ctx,
            )
            .await?;

            let mut out: Vec<Message> = units.into_iter().flatten().collect();
            out.push(Message::system(format!("[Conversation Summary]\n{}", summary)));
            out.extend(tail.into_iter().flatten());
            publish_applied(ctx, self.name(), before, estimate_total(&out));
            Ok(out)
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "transform_type": "conversation_summarization",
            "llm": self.llm.id,
            "max_tokens": self.max_tokens,
            "keep_recent": self.keep_recent,
        })
    }
}

/// Drops the oldest non-system units until the history fits `max_tokens`,
/// always keeping the last `keep_recent` units.
#[derive(Debug, Clone)]
pub struct TokenBudgetTransform {
    max_tokens: usize,
    keep_recent: usize,
}

impl TokenBudgetTransform {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            keep_recent: 2,
        }
    }

    pub fn keep_recent(mut self, units: usize) -> Self {
        self.keep_recent = units;
        self
    }

    /// Synchronous core, shared with tests.
    pub fn prune(&self, messages: Vec<Message>) -> Vec<Message> {
        let mut total = estimate_total(&messages);
        if total <= self.max_tokens {
            return messages;
        }

        let units = units(messages);
        let len = units.len();
        let mut keep = vec![true; len];
        for (idx, unit) in units.iter().enumerate() {
            if total <= self.max_tokens {
                break;
            }
            if idx + self.keep_recent >= len {
                break;
            }
            if unit[0].message_type == MessageType::System {
                continue;
            }
            total = total.saturating_sub(unit_tokens(unit));
            keep[idx] = false;
        }
        if total > self.max_tokens {
            warn!(total, budget = self.max_tokens, "History still over budget after pruning");
        }
        units
            .into_iter()
            .zip(keep)
            .filter_map(|(unit, keep)| keep.then_some(unit))
            .flatten()
            .collect()
    }
}

impl MessageTransform for TokenBudgetTransform {
    fn name(&self) -> &str {
        "token_budget"
    }

    fn apply<'a>(
        &'a self,
        messages: Vec<Message>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Vec<Message>>> {
        Box::pin(async move {
            let before = estimate_total(&messages);
            let count = messages.len();
            let out = self.prune(messages);
            if out.len() != count {
                publish_applied(ctx, self.name(), before, estimate_total(&out));
            }
            Ok(out)
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "transform_type": "token_budget",
            "max_tokens": self.max_tokens,
            "keep_recent": self.keep_recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::message::{MessageList, ToolRequest, ToolResult};
    use stepwise_memory::InMemoryDatastore;
    use stepwise_test_utils::ScriptedLlm;

    fn long(text: &str) -> String {
        format!("{} ", text).repeat(200)
    }

    fn tool_exchange(id: &str) -> Vec<Message> {
        vec![
            Message::tool_requests("", vec![ToolRequest::new("lookup", json!({})).with_id(id)]),
            Message::tool_result(ToolResult::success(id, json!(long("result")))),
        ]
    }

    #[test]
    fn test_units_group_requests_with_results() {
        let mut messages = vec![Message::system("sys"), Message::user("q")];
        messages.extend(tool_exchange("a"));
        messages.push(Message::agent("done"));
        let grouped = units(messages);
        let sizes: Vec<usize> = grouped.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 2, 1]);
    }

    #[test]
    fn test_token_budget_never_orphans_results() {
        let mut messages = vec![Message::system("sys"), Message::user("q")];
        messages.extend(tool_exchange("a"));
        messages.extend(tool_exchange("b"));
        messages.push(Message::agent("done"));

        let pruned = TokenBudgetTransform::new(300).keep_recent(1).prune(messages);
        assert_eq!(pruned[0].message_type, MessageType::System);
        assert_eq!(pruned.last().unwrap().text(), "done");
        assert!(MessageList::from_messages(pruned.clone()).is_ok());
        assert!(pruned.len() < 7);
    }

    #[test]
    fn test_token_budget_noop_under_budget() {
        let messages = vec![Message::user("hi"), Message::agent("hello")];
        assert_eq!(TokenBudgetTransform::new(1_000).prune(messages.clone()), messages);
    }

    #[tokio::test]
    async fn test_conversation_summary_keeps_tail() {
        let llm = Arc::new(ScriptedLlm::new().text("they talked about lookups"));
        let handle = LlmHandle::new("summarizer", llm.clone());
        let transform = ConversationSummarizationTransform::new(handle, 200).keep_recent(1);

        let mut messages = vec![Message::system("sys"), Message::user(long("question"))];
        messages.extend(tool_exchange("a"));
        messages.push(Message::agent("final answer"));

        let ctx = ExecutionContext::new();
        let out = transform.apply(messages, &ctx).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text(), "sys");
        assert!(out[1].text().contains("they talked about lookups"));
        assert_eq!(out[2].text(), "final answer");
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_message_summary_is_cached() {
        let llm = Arc::new(ScriptedLlm::new().text("short version"));
        let store: Arc<dyn Datastore> = Arc::new(
            InMemoryDatastore::new().with_collection(SUMMARY_COLLECTION, summary_cache_schema()),
        );
        let transform = MessageSummarizationTransform::new(LlmHandle::new("s", llm.clone()), 50)
            .with_cache("cache", store);

        let mut messages = vec![Message::user("q")];
        messages.extend(tool_exchange("a"));
        let ctx = ExecutionContext::new();

        let first = transform.apply(messages.clone(), &ctx).await.unwrap();
        assert_eq!(first[2].text(), "short version");
        assert_eq!(first[2].tool_result.as_ref().unwrap().request_id, "a");

        // Second pass is served from the cache; the script has no more replies.
        let second = transform.apply(messages, &ctx).await.unwrap();
        assert_eq!(second[2].text(), "short version");
        assert_eq!(llm.calls(), 1);
    }
}
