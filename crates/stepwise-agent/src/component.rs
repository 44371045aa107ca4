use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{error, info};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::ExecutionEvent;
use stepwise_core::message::{Message, MessageList};
use stepwise_core::property::Property;
use stepwise_core::types::{TokenUsage, ToolContext, ValueMap};

use crate::context::ExecutionContext;
use crate::conversation::{ComponentRef, ComponentState, Conversation, Inbox};
use crate::status::ExecutionStatus;
use crate::variables::VariableStore;

/// Mutable view of one conversation thread handed down the call tree.
pub struct Scope<'a> {
    pub ctx: &'a ExecutionContext,
    pub conversation_id: &'a str,
    pub messages: &'a mut MessageList,
    pub variables: &'a mut VariableStore,
    pub inbox: &'a mut Inbox,
}

impl<'a> Scope<'a> {
    pub fn reborrow(&mut self) -> Scope<'_> {
        Scope {
            ctx: self.ctx,
            conversation_id: self.conversation_id,
            messages: &mut *self.messages,
            variables: &mut *self.variables,
            inbox: &mut *self.inbox,
        }
    }

    /// Same conversation, another message thread (a worker's or a callee's).
    pub fn with_messages<'b>(&'b mut self, messages: &'b mut MessageList) -> Scope<'b> {
        Scope {
            ctx: self.ctx,
            conversation_id: self.conversation_id,
            messages,
            variables: &mut *self.variables,
            inbox: &mut *self.inbox,
        }
    }

    pub fn append(&mut self, message: Message) -> Result<()> {
        let message_type = format!("{:?}", message.message_type);
        self.messages.append(message)?;
        self.ctx.publish(ExecutionEvent::MessageAppended {
            conversation_id: self.conversation_id.to_string(),
            message_type,
        });
        Ok(())
    }

    pub fn tool_context(&self, request_id: &str) -> ToolContext {
        ToolContext::new(self.conversation_id)
            .with_request_id(request_id)
            .with_usage_sink(Arc::new(self.ctx.clone()))
    }
}

/// Anything that can own a conversation: flows, agents, swarms and
/// manager-workers groups. Nesting in either direction is composition
/// through this trait.
pub trait ConversationalComponent: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Serialized component type: `flow`, `agent`, `swarm`, `manager_workers`.
    fn kind(&self) -> &'static str;

    fn input_descriptors(&self) -> Vec<Property>;

    fn output_descriptors(&self) -> Vec<Property>;

    /// Whether execution can return anything other than `Finished`.
    fn may_suspend(&self) -> bool;

    /// Fresh execution state for the given inputs.
    fn new_state(&self, inputs: ValueMap) -> Result<ComponentState>;

    /// Run from the continuation point recorded in `state` until the next
    /// suspension or the end.
    fn resume<'a>(
        &'a self,
        state: &'a mut ComponentState,
        scope: Scope<'a>,
    ) -> BoxFuture<'a, Result<ExecutionStatus>>;

    fn to_config(&self) -> Value;

    fn start_conversation(&self) -> Result<Conversation> {
        self.start_conversation_with(ValueMap::new())
    }

    fn start_conversation_with(&self, inputs: ValueMap) -> Result<Conversation> {
        let state = self.new_state(inputs)?;
        Ok(Conversation::new(
            ComponentRef {
                kind: self.kind().to_string(),
                name: self.name().to_string(),
            },
            state,
        ))
    }

    /// One `execute()` call. Errors are logged with full detail; callers
    /// facing end users should show `StepwiseError::user_message()`.
    fn execute<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionStatus>> {
        Box::pin(run_component(self, conversation, ctx))
    }
}

async fn run_component<C: ConversationalComponent + ?Sized>(
    component: &C,
    conversation: &mut Conversation,
    ctx: &ExecutionContext,
) -> Result<ExecutionStatus> {
    if conversation.component.name != component.name() {
        return Err(StepwiseError::Conversation(format!(
            "conversation belongs to '{}', not '{}'",
            conversation.component.name,
            component.name()
        )));
    }

    let conversation_id = conversation.id.clone();
    let name = component.name().to_string();
    let usage_before = ctx.usage();
    info!(conversation_id = %conversation_id, component = %name, "Executing");
    ctx.publish(ExecutionEvent::ExecutionStarted {
        conversation_id: conversation_id.clone(),
        component: name.clone(),
    });

    let result = {
        let Conversation {
            id,
            messages,
            variables,
            state,
            inbox,
            ..
        } = &mut *conversation;
        let scope = Scope {
            ctx,
            conversation_id: id.as_str(),
            messages,
            variables,
            inbox,
        };
        component.resume(state, scope).await
    };

    let usage_after = ctx.usage();
    conversation.token_usage.add(TokenUsage::new(
        usage_after.input_tokens.saturating_sub(usage_before.input_tokens),
        usage_after.output_tokens.saturating_sub(usage_before.output_tokens),
    ));
    conversation.updated_at = Utc::now();

    match result {
        Ok(status) => {
            conversation.status = Some(status.clone());
            if status.is_finished() {
                info!(conversation_id = %conversation_id, component = %name, "Execution finished");
                ctx.publish(ExecutionEvent::ExecutionFinished {
                    conversation_id,
                    component: name,
                });
            } else {
                info!(conversation_id = %conversation_id, component = %name, status = status.tag(), "Execution suspended");
                ctx.publish(ExecutionEvent::ExecutionSuspended {
                    conversation_id,
                    component: name,
                    status: status.tag().to_string(),
                });
            }
            Ok(status)
        }
        Err(e) => {
            error!(
                conversation_id = %conversation_id,
                component = %name,
                kind = e.kind(),
                error = %e,
                "Execution failed"
            );
            ctx.publish(ExecutionEvent::ExecutionFailed {
                conversation_id,
                component: name,
                kind: e.kind().to_string(),
                error: e.to_string(),
            });
            Err(e)
        }
    }
}
