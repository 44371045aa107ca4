//! Gating of a single tool call: authorization, confirmation, and
//! client-side execution all suspend the caller until the conversation
//! receives the missing value.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use stepwise_core::error::Result;
use stepwise_core::message::{ToolRequest, ToolResult};
use stepwise_core::traits::Tool;
use stepwise_core::types::ToolContext;

use crate::component::Scope;
use crate::conversation::Confirmation;
use crate::status::{Awaiting, ExecutionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum CallStage {
    New,
    AwaitingAuth { challenge_id: String },
    AwaitingConfirmation,
    Confirmed,
    AwaitingClient,
    Done,
}

/// A tool call in flight, persisted across suspensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCall {
    pub request: ToolRequest,
    pub stage: CallStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

/// Where a call stands after [`advance`].
#[derive(Debug)]
pub(crate) enum Advance {
    /// The caller must supply something first.
    Suspend(ExecutionStatus),
    /// Waiting on a client-side result.
    Client,
    /// Cleared to run server-side.
    Ready,
    /// Result available.
    Done,
}

impl PendingCall {
    pub fn new(request: ToolRequest) -> Self {
        Self {
            request,
            stage: CallStage::New,
            result: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn is_done(&self) -> bool {
        self.stage == CallStage::Done
    }

    pub fn finish(&mut self, result: ToolResult) {
        self.stage = CallStage::Done;
        self.result = Some(result);
    }

    /// Tool context for running this call, with any token granted earlier.
    pub(crate) fn tool_context(&self, tool: &dyn Tool, scope: &Scope<'_>) -> ToolContext {
        scope
            .tool_context(&self.request.id)
            .with_auth_token(scope.inbox.grants.get(tool.name()).cloned())
    }

    fn confirmation_request(&self) -> ExecutionStatus {
        ExecutionStatus::ToolRequest {
            requests: vec![self.request.clone()],
            awaiting: Awaiting::Confirmation,
        }
    }
}

/// Move a call through its gates as far as the conversation allows.
pub(crate) async fn advance(
    tool: &dyn Tool,
    call: &mut PendingCall,
    scope: &mut Scope<'_>,
) -> Result<Advance> {
    if matches!(call.stage, CallStage::New | CallStage::AwaitingAuth { .. }) {
        if let Some(status) = authorize(tool, call, scope).await? {
            return Ok(Advance::Suspend(status));
        }
        if tool.requires_confirmation() {
            call.stage = CallStage::AwaitingConfirmation;
            info!(tool = tool.name(), request_id = %call.request.id, "Tool call awaits confirmation");
            return Ok(Advance::Suspend(call.confirmation_request()));
        }
        call.stage = CallStage::Confirmed;
    }

    if call.stage == CallStage::AwaitingConfirmation {
        match scope.inbox.take_confirmation(&call.request.id) {
            None => return Ok(Advance::Suspend(call.confirmation_request())),
            Some(Confirmation::Confirm { args }) => {
                if let Some(args) = args {
                    call.request.args = args;
                }
                call.stage = CallStage::Confirmed;
            }
            Some(Confirmation::Reject { reason }) => {
                info!(tool = tool.name(), request_id = %call.request.id, %reason, "Tool call rejected");
                let id = call.request.id.clone();
                call.finish(ToolResult::error(id, format!("rejected by user: {}", reason)));
                return Ok(Advance::Done);
            }
        }
    }

    if call.stage == CallStage::Confirmed && tool.is_client_side() {
        call.stage = CallStage::AwaitingClient;
    }

    match call.stage {
        CallStage::AwaitingClient => match scope.inbox.take_tool_result(&call.request.id) {
            Some(result) => {
                debug!(tool = tool.name(), request_id = %call.request.id, "Client result received");
                call.finish(result);
                Ok(Advance::Done)
            }
            None => Ok(Advance::Client),
        },
        CallStage::Done => Ok(Advance::Done),
        _ => Ok(Advance::Ready),
    }
}

/// `Some(status)` while the tool still lacks a token.
async fn authorize(
    tool: &dyn Tool,
    call: &mut PendingCall,
    scope: &mut Scope<'_>,
) -> Result<Option<ExecutionStatus>> {
    let Some(provider) = tool.auth() else {
        return Ok(None);
    };
    if scope.inbox.grants.contains_key(tool.name()) {
        return Ok(None);
    }

    let challenge_id = match &call.stage {
        CallStage::AwaitingAuth { challenge_id } => {
            if let Some(code) = scope.inbox.take_auth_code(challenge_id) {
                let token = provider.exchange(code).await?;
                info!(tool = tool.name(), "Authorization granted");
                scope.inbox.grants.insert(tool.name().to_string(), token);
                return Ok(None);
            }
            challenge_id.clone()
        }
        _ => Uuid::new_v4().to_string(),
    };

    info!(tool = tool.name(), %challenge_id, "Tool requires authorization");
    call.stage = CallStage::AwaitingAuth {
        challenge_id: challenge_id.clone(),
    };
    Ok(Some(ExecutionStatus::AuthChallengeRequest {
        challenge_id,
        tool: tool.name().to_string(),
        challenge: provider.challenge(tool.name()),
    }))
}
