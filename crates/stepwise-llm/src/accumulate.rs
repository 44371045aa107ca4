use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::message::ToolRequest;
use stepwise_core::traits::LlmClient;
use stepwise_core::types::{Generation, Prompt, StreamDelta};

use crate::structured::OutputCleaner;

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

impl ToolCallAccumulator {
    fn finish(self) -> Result<ToolRequest> {
        let args = if self.input_json.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            OutputCleaner::extract_json(&self.input_json).ok_or_else(|| {
                StepwiseError::LlmParse(format!(
                    "arguments for tool call '{}' are not valid JSON",
                    self.name
                ))
            })?
        };
        let id = if self.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.id
        };
        Ok(ToolRequest {
            id,
            name: self.name,
            args,
        })
    }
}

/// Drain a delta stream into a [`Generation`], calling `on_text` for every
/// text chunk as it arrives.
pub async fn collect_generation<F>(
    mut stream: BoxStream<'_, Result<StreamDelta>>,
    mut on_text: F,
) -> Result<Generation>
where
    F: FnMut(&str),
{
    let mut generation = Generation::default();
    let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(text) => {
                on_text(&text);
                generation.text.push_str(&text);
            }
            StreamDelta::ToolUseStart { index, id, name } => {
                // Ensure vec is large enough
                while tool_calls.len() <= index {
                    tool_calls.push(ToolCallAccumulator::default());
                }
                tool_calls[index].id = id;
                tool_calls[index].name = name;
            }
            StreamDelta::ToolInputDelta { index, delta } => {
                if let Some(tc) = tool_calls.get_mut(index) {
                    tc.input_json.push_str(&delta);
                }
            }
            StreamDelta::Stop(reason) => {
                generation.stop_reason = Some(reason);
            }
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                generation.usage.input_tokens += input_tokens;
                generation.usage.output_tokens += output_tokens;
            }
            StreamDelta::MessageId(id) => {
                debug!(message_id = %id, "LLM response id");
            }
        }
    }

    generation.tool_requests = tool_calls
        .into_iter()
        .filter(|tc| !tc.name.is_empty())
        .map(ToolCallAccumulator::finish)
        .collect::<Result<Vec<_>>>()?;

    Ok(generation)
}

/// Send a prompt and accumulate the full response.
pub async fn generate<F>(
    client: &dyn LlmClient,
    config: &ModelConfig,
    prompt: Prompt,
    on_text: F,
) -> Result<Generation>
where
    F: FnMut(&str),
{
    let stream = client.chat_stream(config, prompt).await?;
    collect_generation(stream, on_text).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use stepwise_core::types::StopReason;

    fn boxed(deltas: Vec<Result<StreamDelta>>) -> BoxStream<'static, Result<StreamDelta>> {
        stream::iter(deltas).boxed()
    }

    #[tokio::test]
    async fn test_collects_text_and_usage() {
        let mut seen = Vec::new();
        let generation = collect_generation(
            boxed(vec![
                Ok(StreamDelta::TextDelta("Hel".into())),
                Ok(StreamDelta::TextDelta("lo".into())),
                Ok(StreamDelta::Usage {
                    input_tokens: 7,
                    output_tokens: 2,
                }),
                Ok(StreamDelta::Stop(StopReason::EndTurn)),
            ]),
            |t| seen.push(t.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(generation.text, "Hello");
        assert_eq!(seen, vec!["Hel", "lo"]);
        assert_eq!(generation.usage.total(), 9);
        assert_eq!(generation.stop_reason, Some(StopReason::EndTurn));
        assert!(!generation.has_tool_requests());
    }

    #[tokio::test]
    async fn test_collects_tool_calls_in_index_order() {
        let generation = collect_generation(
            boxed(vec![
                Ok(StreamDelta::ToolUseStart {
                    index: 1,
                    id: "b".into(),
                    name: "second".into(),
                }),
                Ok(StreamDelta::ToolUseStart {
                    index: 0,
                    id: "a".into(),
                    name: "first".into(),
                }),
                Ok(StreamDelta::ToolInputDelta {
                    index: 0,
                    delta: "{\"x\": ".into(),
                }),
                Ok(StreamDelta::ToolInputDelta {
                    index: 0,
                    delta: "1}".into(),
                }),
            ]),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(generation.tool_requests.len(), 2);
        assert_eq!(generation.tool_requests[0].name, "first");
        assert_eq!(generation.tool_requests[0].args, json!({"x": 1}));
        assert_eq!(generation.tool_requests[1].args, json!({}));
    }

    #[tokio::test]
    async fn test_bad_tool_arguments() {
        let err = collect_generation(
            boxed(vec![
                Ok(StreamDelta::ToolUseStart {
                    index: 0,
                    id: "a".into(),
                    name: "t".into(),
                }),
                Ok(StreamDelta::ToolInputDelta {
                    index: 0,
                    delta: "not json".into(),
                }),
            ]),
            |_| {},
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "LlmParse");
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let err = collect_generation(
            boxed(vec![
                Ok(StreamDelta::TextDelta("partial".into())),
                Err(StepwiseError::LlmStream("connection reset".into())),
            ]),
            |_| {},
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "LlmStream");
    }
}
