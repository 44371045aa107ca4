//! The persisted unit of execution state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::message::{Message, MessageList, MessageType, ToolResult};
use stepwise_core::types::TokenUsage;

use crate::agent::AgentState;
use crate::flow::FlowState;
use crate::multi::manager_workers::ManagerWorkersState;
use crate::multi::swarm::SwarmState;
use crate::status::{Awaiting, ExecutionStatus};
use crate::variables::VariableStore;

/// Which component a conversation belongs to. The component itself is
/// rebuilt from its config through a registry, never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub kind: String,
    pub name: String,
}

/// Execution frame of the owning component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentState {
    Flow(FlowState),
    Agent(AgentState),
    Swarm(SwarmState),
    ManagerWorkers(ManagerWorkersState),
}

impl ComponentState {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Flow(_) => "flow",
            Self::Agent(_) => "agent",
            Self::Swarm(_) => "swarm",
            Self::ManagerWorkers(_) => "manager_workers",
        }
    }

    pub(crate) fn mismatch(&self, expected: &str) -> StepwiseError {
        StepwiseError::Conversation(format!(
            "expected {} state, found {} state",
            expected,
            self.kind()
        ))
    }
}

/// Caller decision on a tool call awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Confirmation {
    Confirm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
    Reject {
        #[serde(default)]
        reason: String,
    },
}

/// Values submitted by the caller, consumed by whichever step or agent
/// suspended for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inbox {
    #[serde(default)]
    pub tool_results: BTreeMap<String, ToolResult>,
    #[serde(default)]
    pub confirmations: BTreeMap<String, Confirmation>,
    /// Authorization codes keyed by challenge id.
    #[serde(default)]
    pub auth_codes: BTreeMap<String, String>,
    /// Tokens already obtained, keyed by tool name.
    #[serde(default)]
    pub grants: BTreeMap<String, String>,
}

impl Inbox {
    pub fn take_tool_result(&mut self, request_id: &str) -> Option<ToolResult> {
        self.tool_results.remove(request_id)
    }

    pub fn take_confirmation(&mut self, request_id: &str) -> Option<Confirmation> {
        self.confirmations.remove(request_id)
    }

    pub fn take_auth_code(&mut self, challenge_id: &str) -> Option<String> {
        self.auth_codes.remove(challenge_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub component: ComponentRef,
    #[serde(default)]
    pub messages: MessageList,
    #[serde(default)]
    pub variables: VariableStore,
    pub state: ComponentState,
    #[serde(default)]
    pub inbox: Inbox,
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// Status returned by the last `execute()` call.
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(component: ComponentRef, state: ComponentState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            component,
            messages: MessageList::new(),
            variables: VariableStore::new(),
            state,
            inbox: Inbox::default(),
            token_usage: TokenUsage::default(),
            status: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let conversation: Self = serde_json::from_value(value)
            .map_err(|e| StepwiseError::Deserialization(format!("conversation: {}", e)))?;
        conversation.messages.validate_pairing()?;
        Ok(conversation)
    }

    pub fn is_finished(&self) -> bool {
        self.status.as_ref().is_some_and(ExecutionStatus::is_finished)
    }

    pub fn last_agent_message(&self) -> Option<&Message> {
        self.messages.last_of_type(MessageType::Agent)
    }

    /// Append a user message. Valid before the first execution, after a
    /// user-message request, and after a finished run.
    pub fn append_user_message(&mut self, text: impl Into<String>) -> Result<()> {
        match &self.status {
            None
            | Some(ExecutionStatus::UserMessageRequest { .. })
            | Some(ExecutionStatus::Finished { .. }) => {}
            Some(other) => {
                return Err(StepwiseError::Conversation(format!(
                    "cannot add a user message while the conversation awaits a {}",
                    other.tag()
                )))
            }
        }
        self.messages.append(Message::user(text))?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn submit_user_message(&mut self, text: impl Into<String>) -> Result<()> {
        self.append_user_message(text)
    }

    fn expect_request(&self, request_id: &str, awaiting: Awaiting) -> Result<()> {
        match &self.status {
            Some(ExecutionStatus::ToolRequest {
                requests,
                awaiting: current,
            }) if *current == awaiting => {
                if requests.iter().any(|r| r.id == request_id) {
                    Ok(())
                } else {
                    Err(StepwiseError::Conversation(format!(
                        "no pending tool request with id '{}'",
                        request_id
                    )))
                }
            }
            _ => Err(StepwiseError::Conversation(format!(
                "conversation is not awaiting tool {}",
                match awaiting {
                    Awaiting::Results => "results",
                    Awaiting::Confirmation => "confirmation",
                }
            ))),
        }
    }

    pub fn submit_tool_result(&mut self, result: ToolResult) -> Result<()> {
        self.expect_request(&result.request_id, Awaiting::Results)?;
        if self.inbox.tool_results.contains_key(&result.request_id) {
            return Err(StepwiseError::Conversation(format!(
                "result for '{}' already submitted",
                result.request_id
            )));
        }
        self.inbox
            .tool_results
            .insert(result.request_id.clone(), result);
        Ok(())
    }

    pub fn submit_tool_results(&mut self, results: impl IntoIterator<Item = ToolResult>) -> Result<()> {
        results.into_iter().try_for_each(|r| self.submit_tool_result(r))
    }

    /// Approve a call awaiting confirmation, optionally with edited arguments.
    pub fn confirm(&mut self, request_id: &str, edited_args: Option<Value>) -> Result<()> {
        self.expect_request(request_id, Awaiting::Confirmation)?;
        self.inbox.confirmations.insert(
            request_id.to_string(),
            Confirmation::Confirm { args: edited_args },
        );
        Ok(())
    }

    pub fn reject(&mut self, request_id: &str, reason: impl Into<String>) -> Result<()> {
        self.expect_request(request_id, Awaiting::Confirmation)?;
        self.inbox.confirmations.insert(
            request_id.to_string(),
            Confirmation::Reject {
                reason: reason.into(),
            },
        );
        Ok(())
    }

    pub fn submit_auth_result(&mut self, code: impl Into<String>) -> Result<()> {
        match &self.status {
            Some(ExecutionStatus::AuthChallengeRequest { challenge_id, .. }) => {
                self.inbox.auth_codes.insert(challenge_id.clone(), code.into());
                Ok(())
            }
            _ => Err(StepwiseError::Conversation(
                "conversation is not awaiting an authorization code".into(),
            )),
        }
    }
}
