use std::sync::Arc;

use serde_json::{json, Value};

use stepwise_core::config::{AppConfig, ModelConfig};
use stepwise_core::error::Result;
use stepwise_core::event::ExecutionEvent;
use stepwise_core::traits::LlmClient;
use stepwise_core::types::{Generation, Prompt};

use crate::context::ExecutionContext;

/// A live LLM client plus the generation settings used with it. Serialized
/// by `id` only; a registry maps the id back to a client.
#[derive(Clone)]
pub struct LlmHandle {
    pub id: String,
    pub client: Arc<dyn LlmClient>,
    pub config: ModelConfig,
}

impl LlmHandle {
    pub fn new(id: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        Self {
            id: id.into(),
            client,
            config: ModelConfig::default(),
        }
    }

    /// `primary` wrapped with the `[model.retry]` policy and the
    /// `[[fallback_models]]` chain, generating with the `[model]` settings.
    pub fn from_config(
        id: impl Into<String>,
        primary: Arc<dyn LlmClient>,
        fallbacks: Vec<Arc<dyn LlmClient>>,
        config: &AppConfig,
    ) -> Self {
        Self {
            id: id.into(),
            client: stepwise_llm::with_retries(primary, fallbacks, config),
            config: config.model.clone(),
        }
    }

    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    /// One generation. Text deltas are published as `source`, and usage is
    /// recorded on the context for budget interrupts.
    pub async fn generate(
        &self,
        prompt: Prompt,
        source: &str,
        ctx: &ExecutionContext,
    ) -> Result<Generation> {
        let generation = stepwise_llm::generate(self.client.as_ref(), &self.config, prompt, |delta| {
            ctx.publish(ExecutionEvent::TextDelta {
                agent: source.to_string(),
                delta: delta.to_string(),
            })
        })
        .await?;
        ctx.record_usage(generation.usage);
        Ok(generation)
    }

    pub fn to_config(&self) -> Value {
        json!({ "llm": self.id })
    }
}

impl std::fmt::Debug for LlmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmHandle")
            .field("id", &self.id)
            .field("model", &self.config.model_id)
            .finish()
    }
}
