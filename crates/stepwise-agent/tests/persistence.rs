use std::sync::Arc;

use serde_json::json;

use stepwise_agent::steps::{InputMessageStep, OutputMessageStep, ToolExecutionStep};
use stepwise_agent::{
    Agent, CallerInputMode, ComponentRegistry, ConversationalComponent, Conversation,
    ExecutionContext, Flow, LlmHandle,
};
use stepwise_core::message::ToolResult;
use stepwise_memory::ConversationStore;
use stepwise_test_utils::{client_tool, uppercase_tool, ScriptedLlm};

fn texts(conversation: &Conversation) -> Vec<String> {
    conversation.messages.iter().map(|m| m.text()).collect()
}

#[tokio::test]
async fn test_agent_resumes_after_reload_from_store() {
    let script = || {
        ScriptedLlm::new()
            .tool_call("c1", "open_url", json!({"url": "https://example.com"}))
            .text("Opened.")
    };
    let live = Arc::new(script());
    let agent = Agent::builder("browser", LlmHandle::new("scripted", live.clone()))
        .tool(client_tool())
        .caller_input_mode(CallerInputMode::Never)
        .build()
        .unwrap();
    let ctx = ExecutionContext::new();

    let mut original = agent.start_conversation().unwrap();
    original.submit_user_message("open the site").unwrap();
    agent.execute(&mut original, &ctx).await.unwrap();

    let store = ConversationStore::in_memory().unwrap();
    store.save(&original.to_value().unwrap()).unwrap();
    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].component, "browser");
    assert_eq!(listed[0].status.as_deref(), Some("tool_request"));

    // A second process: the first LLM turn already happened, so its replacement
    // only needs the remaining reply.
    let replay = Arc::new(ScriptedLlm::new().text("Opened."));
    let registry = ComponentRegistry::new().with_llm(LlmHandle::new("scripted", replay.clone()));
    let rebuilt = registry.load_component(&agent.to_config()).unwrap();
    let mut restored = Conversation::from_value(store.load(&original.id).unwrap().unwrap()).unwrap();
    assert_eq!(restored.status, original.status);

    original
        .submit_tool_result(ToolResult::success("c1", json!(true)))
        .unwrap();
    restored
        .submit_tool_result(ToolResult::success("c1", json!(true)))
        .unwrap();
    let a = agent.execute(&mut original, &ctx).await.unwrap();
    let b = rebuilt.execute(&mut restored, &ctx).await.unwrap();

    assert_eq!(a, b);
    assert_eq!(texts(&original), texts(&restored));
    assert_eq!(replay.calls(), 1);
    assert_eq!(live.remaining(), 0);
}

#[tokio::test]
async fn test_flow_rebuilt_from_config_resumes_suspended_conversation() {
    let flow = Flow::builder("shout")
        .step("read_input", InputMessageStep::with_prompt("Say something"))
        .step("uppercase", ToolExecutionStep::new(uppercase_tool()))
        .step("output", OutputMessageStep::new("{{ uppercased }}"))
        .sequence(&["read_input", "uppercase", "output"])
        .connect("read_input", "user_provided_input", "uppercase", "text")
        .build()
        .unwrap();
    let ctx = ExecutionContext::new();

    let mut conversation = flow.start_conversation().unwrap();
    flow.execute(&mut conversation, &ctx).await.unwrap();
    assert_eq!(texts(&conversation), vec!["Say something"]);

    let config = serde_json::to_string(&flow.to_config()).unwrap();
    let registry = ComponentRegistry::new().with_tool(uppercase_tool());
    let rebuilt = registry
        .load_component(&serde_json::from_str(&config).unwrap())
        .unwrap();
    assert_eq!(rebuilt.kind(), "flow");

    let mut restored = Conversation::from_value(conversation.to_value().unwrap()).unwrap();
    restored.submit_user_message("quiet please").unwrap();
    let status = rebuilt.execute(&mut restored, &ctx).await.unwrap();
    assert_eq!(status.outputs().unwrap()["uppercased"], json!("QUIET PLEASE"));
    assert_eq!(
        texts(&restored),
        vec!["Say something", "quiet please", "QUIET PLEASE"]
    );
}
