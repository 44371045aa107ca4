use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{json, Value};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::property::{object_schema, Property};
use crate::types::*;

/// LLM client. Provider protocols live behind this boundary.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a prompt and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        prompt: Prompt,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// A callable with declared input and output descriptors.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Declared arguments.
    fn inputs(&self) -> Vec<Property>;

    /// Declared result. When `None` the result descriptor is inferred.
    fn output(&self) -> Option<Property> {
        None
    }

    /// Execute the tool with already-validated arguments.
    fn execute(&self, args: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Whether the caller must confirm each call before it runs.
    fn requires_confirmation(&self) -> bool {
        false
    }

    /// Whether the tool runs on the caller's side, outside this process.
    fn is_client_side(&self) -> bool {
        false
    }

    /// Auth provider consulted before the first call.
    fn auth(&self) -> Option<Arc<dyn AuthProvider>> {
        None
    }

    /// Whether calling this tool can pause execution.
    fn may_suspend(&self) -> bool {
        self.is_client_side() || self.requires_confirmation() || self.auth().is_some()
    }

    /// JSON schema of the arguments object.
    fn input_schema(&self) -> Value {
        object_schema(&self.inputs())
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }

    /// Serializable description. Executable code is never part of it; a
    /// registry maps `name` back to a live tool.
    fn to_config(&self) -> Value {
        json!({
            "tool_type": "server",
            "name": self.name(),
            "description": self.description(),
            "inputs": self.inputs(),
            "output": self.output(),
            "requires_confirmation": self.requires_confirmation(),
        })
    }
}

/// A stored record: field name to value.
pub type Entity = serde_json::Map<String, Value>;

/// Equality filter on entity fields. Empty matches every entity.
pub type Filter = BTreeMap<String, Value>;

/// Query options beyond a plain filter.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filter: Filter,
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(field.into());
        self.descending = descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Collections of entities validated against a schema.
/// Every method is one logical operation; there is no multi-call transaction.
pub trait Datastore: Send + Sync + 'static {
    /// Insert entities, returning them as stored.
    fn create(&self, collection: &str, entities: Vec<Entity>) -> BoxFuture<'_, Result<Vec<Entity>>>;

    /// All entities matching the filter, in insertion order.
    fn list(&self, collection: &str, filter: Filter) -> BoxFuture<'_, Result<Vec<Entity>>>;

    /// Set `values` on every matching entity, returning the updated entities.
    fn update(
        &self,
        collection: &str,
        filter: Filter,
        values: Entity,
    ) -> BoxFuture<'_, Result<Vec<Entity>>>;

    /// Delete matching entities, returning how many were removed.
    fn delete(&self, collection: &str, filter: Filter) -> BoxFuture<'_, Result<usize>>;

    /// Filtered, ordered and limited listing.
    fn query(&self, collection: &str, query: Query) -> BoxFuture<'_, Result<Vec<Entity>>>;
}

/// Text templating.
pub trait Renderer: Send + Sync + 'static {
    fn render(&self, template: &str, bindings: &ValueMap) -> Result<String>;

    /// Names the template expects to be bound.
    fn placeholders(&self, template: &str) -> Vec<String>;
}

/// Challenge/response authorization for tools that need a user grant.
pub trait AuthProvider: Send + Sync + 'static {
    /// Challenge shown to the caller for `tool`.
    fn challenge(&self, tool: &str) -> AuthChallenge;

    /// Exchange the code the caller obtained for a token.
    fn exchange(&self, code: String) -> BoxFuture<'_, Result<String>>;
}
