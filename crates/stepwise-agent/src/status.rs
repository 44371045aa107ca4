//! What one `execute()` call hands back to the caller.

use serde::{Deserialize, Serialize};

use stepwise_core::message::ToolRequest;
use stepwise_core::types::{AuthChallenge, ValueMap, DEFAULT_BRANCH};

/// What a tool-request suspension is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Awaiting {
    /// Results of client-side tools, submitted with `submit_tool_result`.
    Results,
    /// Approval of a tool call, given with `confirm` or `reject`.
    Confirmation,
}

/// Outcome of one `execute()` call. Every variant except `Finished` is a
/// suspension: supply the missing value on the conversation and execute again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    UserMessageRequest {
        /// Text of the last message addressed to the user, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ToolRequest {
        requests: Vec<ToolRequest>,
        awaiting: Awaiting,
    },
    AuthChallengeRequest {
        challenge_id: String,
        tool: String,
        challenge: AuthChallenge,
    },
    Finished {
        #[serde(default)]
        outputs: ValueMap,
        #[serde(default = "default_branch")]
        exit_branch: String,
    },
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl ExecutionStatus {
    pub fn user_message_request(message: Option<String>) -> Self {
        Self::UserMessageRequest { message }
    }

    pub fn finished(outputs: ValueMap) -> Self {
        Self::Finished {
            outputs,
            exit_branch: default_branch(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }

    /// Stable tag, as serialized.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UserMessageRequest { .. } => "user_message_request",
            Self::ToolRequest { .. } => "tool_request",
            Self::AuthChallengeRequest { .. } => "auth_challenge_request",
            Self::Finished { .. } => "finished",
        }
    }

    pub fn outputs(&self) -> Option<&ValueMap> {
        match self {
            Self::Finished { outputs, .. } => Some(outputs),
            _ => None,
        }
    }

    pub fn tool_requests(&self) -> &[ToolRequest] {
        match self {
            Self::ToolRequest { requests, .. } => requests,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_serialization() {
        let status = ExecutionStatus::ToolRequest {
            requests: vec![ToolRequest::new("open_url", json!({"url": "https://x"})).with_id("t1")],
            awaiting: Awaiting::Results,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "tool_request");
        assert_eq!(json["awaiting"], "results");
        let back: ExecutionStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
        assert_eq!(back.tool_requests()[0].id, "t1");
    }

    #[test]
    fn test_finished_defaults() {
        let status: ExecutionStatus = serde_json::from_value(json!({"status": "finished"})).unwrap();
        assert!(status.is_finished());
        assert_eq!(status, ExecutionStatus::finished(ValueMap::new()));
        assert_eq!(status.tag(), "finished");
    }
}
