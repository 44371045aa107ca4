use serde::Serialize;
use serde_json::Value;

use crate::types::InterruptReason;

/// Observable execution events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        conversation_id: String,
        component: String,
    },
    ExecutionSuspended {
        conversation_id: String,
        component: String,
        status: String,
    },
    ExecutionFinished {
        conversation_id: String,
        component: String,
    },
    /// Operator-facing failure detail. End users only ever see the sanitized text.
    ExecutionFailed {
        conversation_id: String,
        component: String,
        kind: String,
        error: String,
    },
    StepStarted {
        flow: String,
        step: String,
    },
    StepCompleted {
        flow: String,
        step: String,
        branch: String,
    },
    TextDelta {
        agent: String,
        delta: String,
    },
    UsageUpdate {
        input_tokens: u64,
        output_tokens: u64,
    },
    ToolStart {
        tool: String,
        request_id: String,
        args: Value,
    },
    ToolProgress {
        tool: String,
        request_id: String,
        chunk: Value,
    },
    ToolEnd {
        tool: String,
        request_id: String,
        is_error: bool,
    },
    MessageAppended {
        conversation_id: String,
        message_type: String,
    },
    Delegated {
        from: String,
        to: String,
    },
    Handoff {
        from: String,
        to: String,
    },
    Interrupted {
        reason: InterruptReason,
    },
    TransformApplied {
        transform: String,
        before: usize,
        after: usize,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(ExecutionEvent::Handoff {
            from: "a".into(),
            to: "b".into(),
        });
        match rx.recv().await.unwrap() {
            ExecutionEvent::Handoff { from, to } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new(4).publish(ExecutionEvent::UsageUpdate {
            input_tokens: 1,
            output_tokens: 1,
        });
    }
}
