use std::sync::Arc;

use serde_json::json;

use stepwise_agent::{
    Agent, ComponentState, ConversationalComponent, ExecutionContext, ExecutionStatus, HandoffMode,
    LlmHandle, ManagerWorkers, Swarm,
};
use stepwise_core::message::MessageType;
use stepwise_test_utils::ScriptedLlm;

fn agent(name: &str, llm: &Arc<ScriptedLlm>) -> Agent {
    Agent::builder(name, LlmHandle::new(name, llm.clone()))
        .description(format!("The {} agent", name))
        .build()
        .unwrap()
}

fn user_texts(prompt: &stepwise_core::types::Prompt) -> Vec<String> {
    prompt
        .messages
        .iter()
        .filter(|m| m.message_type == MessageType::User)
        .map(|m| m.text())
        .collect()
}

#[tokio::test]
async fn test_manager_delegates_and_relays_answer() {
    let manager_llm = Arc::new(
        ScriptedLlm::new()
            .tool_call("d1", "delegate_to_researcher", json!({"task": "Find the answer to X"}))
            .text("The researcher says 42."),
    );
    let worker_llm = Arc::new(ScriptedLlm::new().text("42"));
    let group = ManagerWorkers::new(
        "research_team",
        agent("manager", &manager_llm),
        vec![Arc::new(agent("researcher", &worker_llm))],
    )
    .unwrap();

    let mut conversation = group.start_conversation().unwrap();
    conversation.submit_user_message("What is X?").unwrap();
    let status = group
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(
        status,
        ExecutionStatus::user_message_request(Some("The researcher says 42.".into()))
    );
    // The worker only sees the delegated task.
    assert_eq!(user_texts(&worker_llm.prompts()[0]), vec!["Find the answer to X"]);
    let relayed: Vec<_> = manager_llm.prompts()[1]
        .messages
        .iter()
        .filter_map(|m| m.tool_result.as_ref().map(|r| r.content.clone()))
        .collect();
    assert_eq!(relayed, vec![json!("42")]);
    conversation.messages.validate_pairing().unwrap();
}

#[test]
fn test_manager_rejects_duplicate_workers() {
    let llm = Arc::new(ScriptedLlm::new());
    let result = ManagerWorkers::new(
        "team",
        agent("manager", &llm),
        vec![Arc::new(agent("a", &llm)), Arc::new(agent("a", &llm))],
    );
    assert!(result.is_err());
}

fn support_swarm(triage: &Arc<ScriptedLlm>, billing: &Arc<ScriptedLlm>, mode: HandoffMode) -> Swarm {
    Swarm::builder("support")
        .agent(agent("triage", triage))
        .agent(agent("billing", billing))
        .relationship("triage", "billing")
        .handoff(mode)
        .first("triage")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_swarm_send_message_returns_reply_to_caller() {
    let triage = Arc::new(
        ScriptedLlm::new()
            .tool_call(
                "m1",
                "send_message",
                json!({"recipient": "billing", "message": "Can we refund order 7?"}),
            )
            .text("Billing approved your refund."),
    );
    let billing = Arc::new(ScriptedLlm::new().text("Approved."));
    let swarm = support_swarm(&triage, &billing, HandoffMode::Never);

    let mut conversation = swarm.start_conversation().unwrap();
    conversation.submit_user_message("I want a refund").unwrap();
    let status = swarm
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(
        status,
        ExecutionStatus::user_message_request(Some("Billing approved your refund.".into()))
    );
    assert_eq!(user_texts(&billing.prompts()[0]), vec!["Can we refund order 7?"]);
    // The private exchange stays off the user-facing thread.
    assert!(conversation
        .messages
        .iter()
        .filter(|m| m.message_type == MessageType::Agent)
        .all(|m| m.text() != "Approved."));

    let ComponentState::Swarm(state) = &conversation.state else {
        panic!("expected swarm state");
    };
    assert_eq!(state.active, "triage");
    assert!(state.stack.is_empty());
    assert!(state.threads.contains_key("triage->billing"));
}

#[tokio::test]
async fn test_swarm_handoff_moves_the_user_to_recipient() {
    let triage = Arc::new(ScriptedLlm::new().tool_call(
        "h1",
        "handoff_conversation",
        json!({"recipient": "billing", "message": "Customer wants a refund."}),
    ));
    let billing = Arc::new(
        ScriptedLlm::new()
            .text("Hi, billing here. Which order?")
            .text("Refund issued."),
    );
    let swarm = support_swarm(&triage, &billing, HandoffMode::Optional);
    let ctx = ExecutionContext::new();

    let mut conversation = swarm.start_conversation().unwrap();
    conversation.submit_user_message("I want a refund").unwrap();
    let status = swarm.execute(&mut conversation, &ctx).await.unwrap();
    assert_eq!(
        status,
        ExecutionStatus::user_message_request(Some("Hi, billing here. Which order?".into()))
    );

    conversation.submit_user_message("Order 7").unwrap();
    let status = swarm.execute(&mut conversation, &ctx).await.unwrap();
    assert_eq!(
        status,
        ExecutionStatus::user_message_request(Some("Refund issued.".into()))
    );

    // Triage never spoke again after handing off.
    assert_eq!(triage.calls(), 1);
    let ComponentState::Swarm(state) = &conversation.state else {
        panic!("expected swarm state");
    };
    assert_eq!(state.active, "billing");
    conversation.messages.validate_pairing().unwrap();
}

#[tokio::test]
async fn test_handoff_not_offered_in_never_mode() {
    let triage = Arc::new(ScriptedLlm::new().text("How can I help?"));
    let billing = Arc::new(ScriptedLlm::new());
    let swarm = support_swarm(&triage, &billing, HandoffMode::Never);

    let mut conversation = swarm.start_conversation().unwrap();
    conversation.submit_user_message("hello").unwrap();
    swarm
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();

    let offered: Vec<String> = triage.prompts()[0]
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(offered, vec!["send_message".to_string()]);
}

#[tokio::test]
async fn test_swarm_state_survives_serialization() {
    let triage = Arc::new(
        ScriptedLlm::new()
            .tool_call(
                "m1",
                "send_message",
                json!({"recipient": "billing", "message": "Check order 7"}),
            )
            .text("All set."),
    );
    let billing = Arc::new(ScriptedLlm::new().text("Order 7 is fine."));
    let swarm = support_swarm(&triage, &billing, HandoffMode::Optional);

    let mut conversation = swarm.start_conversation().unwrap();
    conversation.submit_user_message("check my order").unwrap();
    swarm
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();

    let value = conversation.to_value().unwrap();
    let restored = stepwise_agent::Conversation::from_value(value).unwrap();
    assert_eq!(restored.state, conversation.state);
    assert_eq!(restored.status, conversation.status);
    assert_eq!(restored.messages.len(), conversation.messages.len());
}

#[tokio::test]
async fn test_callee_cannot_hand_off_the_user() {
    let triage = Arc::new(
        ScriptedLlm::new()
            .tool_call(
                "m1",
                "send_message",
                json!({"recipient": "billing", "message": "Refund order 7?"}),
            )
            .text("Billing says it is done."),
    );
    let billing = Arc::new(
        ScriptedLlm::new()
            .tool_call(
                "h1",
                "handoff_conversation",
                json!({"recipient": "triage", "message": "Take it back."}),
            )
            .text("Refunded."),
    );
    let swarm = support_swarm(&triage, &billing, HandoffMode::Optional);

    let mut conversation = swarm.start_conversation().unwrap();
    conversation.submit_user_message("Refund please").unwrap();
    let status = swarm
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(
        status,
        ExecutionStatus::user_message_request(Some("Billing says it is done.".into()))
    );
    let rejected: Vec<_> = billing.prompts()[1]
        .messages
        .iter()
        .filter_map(|m| m.tool_result.clone())
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].request_id, "h1");
    assert!(rejected[0].is_error);

    let ComponentState::Swarm(state) = &conversation.state else {
        panic!("expected swarm state");
    };
    assert_eq!(state.active, "triage");
    assert!(state.stack.is_empty());
}
