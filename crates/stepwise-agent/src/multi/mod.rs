//! Multi-agent components.

pub mod manager_workers;
pub mod swarm;

use serde::{Deserialize, Serialize};

use stepwise_core::message::{MessageList, MessageType};
use stepwise_core::types::ValueMap;

use crate::status::ExecutionStatus;

pub use manager_workers::{ManagerWorkers, ManagerWorkersState};
pub use swarm::{HandoffMode, Swarm, SwarmBuilder, SwarmState};

/// A private message thread between two participants, with the callee's
/// state on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread<S> {
    #[serde(default)]
    pub messages: MessageList,
    pub state: S,
}

impl<S> Thread<S> {
    pub fn new(state: S) -> Self {
        Self {
            messages: MessageList::new(),
            state,
        }
    }
}

/// What a participant's run means to whoever asked it something. `None`
/// when the run suspended for the human or a client.
pub(crate) fn answer(status: &ExecutionStatus, thread: &MessageList) -> Option<String> {
    match status {
        ExecutionStatus::Finished { outputs, .. } => Some(outputs_text(outputs, thread)),
        ExecutionStatus::UserMessageRequest { message } => Some(message.clone().unwrap_or_default()),
        _ => None,
    }
}

fn outputs_text(outputs: &ValueMap, thread: &MessageList) -> String {
    if outputs.is_empty() {
        return thread
            .last_of_type(MessageType::Agent)
            .map(|m| m.text())
            .unwrap_or_default();
    }
    serde_json::Value::Object(outputs.clone()).to_string()
}
