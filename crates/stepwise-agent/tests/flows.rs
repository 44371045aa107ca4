use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::{json, Value};

use stepwise_agent::steps::{
    BranchingStep, CatchExceptionStep, InputMessageStep, MapStep, OutputMessageStep,
    ParallelFlowExecutionStep, RetryStep, TemplateRenderingStep, ToolExecutionStep,
};
use stepwise_agent::{
    ConversationalComponent, ExecutionContext, ExecutionStatus, Flow, TimeoutInterrupt,
};
use stepwise_core::config::FlowConfig;
use stepwise_core::error::StepwiseError;
use stepwise_core::property::Property;
use stepwise_core::types::{InterruptReason, ValueMap};
use stepwise_test_utils::{client_tool, flaky_tool, uppercase_tool};

fn inputs(pairs: &[(&str, Value)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn shout_flow() -> Flow {
    Flow::builder("shout")
        .step("read_input", InputMessageStep::new())
        .step("uppercase", ToolExecutionStep::new(uppercase_tool()))
        .step("output", OutputMessageStep::new("{{ uppercased }}"))
        .sequence(&["read_input", "uppercase", "output"])
        .connect("read_input", "user_provided_input", "uppercase", "text")
        .build()
        .expect("build shout flow")
}

fn routing_flow() -> Flow {
    Flow::builder("route")
        .step("route", BranchingStep::new([("ok", "success"), ("err", "failure")]))
        .step("success_step", OutputMessageStep::new("went well"))
        .step("fail_step", OutputMessageStep::new("went badly"))
        .step("fallback", OutputMessageStep::new("no idea"))
        .branch("route", "success", "success_step")
        .branch("route", "failure", "fail_step")
        .branch("route", "default", "fallback")
        .end("success_step")
        .end("fail_step")
        .end("fallback")
        .build()
        .expect("build routing flow")
}

#[tokio::test]
async fn test_linear_flow_uppercases_user_input() {
    let flow = shout_flow();
    let ctx = ExecutionContext::new();
    let mut conversation = flow.start_conversation().unwrap();

    let status = flow.execute(&mut conversation, &ctx).await.unwrap();
    assert_eq!(status, ExecutionStatus::user_message_request(None));

    conversation.submit_user_message("hello").unwrap();
    let status = flow.execute(&mut conversation, &ctx).await.unwrap();
    let outputs = status.outputs().expect("finished");
    assert_eq!(outputs["uppercased"], json!("HELLO"));
    assert_eq!(outputs["output_message"], json!("HELLO"));
    assert_eq!(conversation.last_agent_message().unwrap().text(), "HELLO");
}

#[tokio::test]
async fn test_branching_routes_mapped_and_default_values() {
    let flow = routing_flow();
    let ctx = ExecutionContext::new();

    for (value, expected) in [("ok", "went well"), ("err", "went badly"), ("unexpected", "no idea")] {
        let mut conversation = flow
            .start_conversation_with(inputs(&[("next_step_name", json!(value))]))
            .unwrap();
        let status = flow.execute(&mut conversation, &ctx).await.unwrap();
        assert_eq!(status.outputs().unwrap()["output_message"], json!(expected), "{}", value);
        let said: Vec<String> = conversation.messages.iter().map(|m| m.text()).collect();
        assert_eq!(said, vec![expected.to_string()]);
    }
}

#[test]
fn test_missing_default_edge_fails_at_construction() {
    let result = Flow::builder("route")
        .step("route", BranchingStep::new([("ok", "success")]))
        .step("success_step", OutputMessageStep::new("went well"))
        .branch("route", "success", "success_step")
        .end("success_step")
        .build();

    match result {
        Err(StepwiseError::MissingBranch { step, branch, .. }) => {
            assert_eq!(step, "route");
            assert_eq!(branch, "default");
        }
        other => panic!("expected a missing branch error, got {:?}", other),
    }
}

fn exclaim_flow() -> Flow {
    Flow::builder("exclaim")
        .step("render", TemplateRenderingStep::new("{{ word }}!"))
        .end("render")
        .build()
        .unwrap()
}

async fn run_map(step: MapStep, items: Value) -> Value {
    let flow = Flow::builder("mapper")
        .step("map", step)
        .end("map")
        .build()
        .unwrap();
    let mut conversation = flow
        .start_conversation_with(inputs(&[("iterated_input", items)]))
        .unwrap();
    let status = flow
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();
    status.outputs().unwrap()["output"].clone()
}

#[tokio::test]
async fn test_map_outputs_align_with_inputs() {
    let items = json!(["a", "b", "c", "d", "e"]);
    let expected = json!(["a!", "b!", "c!", "d!", "e!"]);

    let sequential = MapStep::new(exclaim_flow(), "word").unwrap();
    assert_eq!(run_map(sequential, items.clone()).await, expected);

    let parallel = MapStep::parallel(exclaim_flow(), "word").unwrap();
    assert_eq!(run_map(parallel, items).await, expected);
}

#[tokio::test]
async fn test_map_over_empty_list() {
    let step = MapStep::parallel(exclaim_flow(), "word").unwrap();
    assert_eq!(run_map(step, json!([])).await, json!([]));
}

#[test]
fn test_parallel_regions_reject_suspending_flows() {
    let asks = Flow::builder("asks")
        .step("ask", InputMessageStep::with_prompt("Tell me about {{ topic }}"))
        .end("ask")
        .build()
        .unwrap();
    assert!(matches!(
        MapStep::parallel(asks.clone(), "topic"),
        Err(StepwiseError::SuspendingInParallel { .. })
    ));
    assert!(matches!(
        ParallelFlowExecutionStep::new(vec![asks.clone()]),
        Err(StepwiseError::SuspendingInParallel { .. })
    ));
    // Sequential maps may suspend.
    assert!(MapStep::new(asks, "topic").is_ok());

    let opens = Flow::builder("opens")
        .step("open", ToolExecutionStep::new(client_tool()))
        .end("open")
        .build()
        .unwrap();
    assert!(matches!(
        MapStep::parallel(opens, "url"),
        Err(StepwiseError::SuspendingInParallel { .. })
    ));
}

#[tokio::test]
async fn test_parallel_flows_merge_outputs() {
    let greet = Flow::builder("greet")
        .step("hello", TemplateRenderingStep::new("Hello, {{ name }}"))
        .end("hello")
        .outputs(vec![Property::string("output")])
        .build()
        .unwrap();
    let shout = Flow::builder("shout")
        .step("upper", ToolExecutionStep::new(uppercase_tool()))
        .end("upper")
        .build()
        .unwrap();
    let flow = Flow::builder("both")
        .step("fan_out", ParallelFlowExecutionStep::new(vec![greet, shout]).unwrap())
        .end("fan_out")
        .build()
        .unwrap();

    let mut conversation = flow
        .start_conversation_with(inputs(&[("name", json!("Ada")), ("text", json!("quiet"))]))
        .unwrap();
    let status = flow
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();
    let outputs = status.outputs().unwrap();
    assert_eq!(outputs["output"], json!("Hello, Ada"));
    assert_eq!(outputs["uppercased"], json!("QUIET"));
}

fn retry_flow(max_retries: usize, failures: usize) -> (Flow, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
    let (tool, calls) = flaky_tool(failures);
    let attempt = Flow::builder("attempt")
        .step("call", ToolExecutionStep::new(tool))
        .end("call")
        .build()
        .unwrap();
    let flow = Flow::builder("retrying")
        .step("retry", RetryStep::new(attempt, max_retries))
        .step("done", OutputMessageStep::new("got {{ result }}"))
        .step("gave_up", OutputMessageStep::new("gave up"))
        .branch("retry", "success", "done")
        .branch("retry", "failure", "gave_up")
        .end("done")
        .end("gave_up")
        .build()
        .unwrap();
    (flow, calls)
}

#[tokio::test]
async fn test_retry_succeeds_within_limit() {
    let (flow, calls) = retry_flow(2, 2);
    let mut conversation = flow.start_conversation().unwrap();
    flow.execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(conversation.last_agent_message().unwrap().text(), "got ok");
}

#[tokio::test]
async fn test_retry_gives_up_after_max_retries() {
    let (flow, calls) = retry_flow(2, 3);
    let mut conversation = flow.start_conversation().unwrap();
    flow.execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(conversation.last_agent_message().unwrap().text(), "gave up");
}

fn failing_flow() -> Flow {
    let (tool, _) = flaky_tool(usize::MAX);
    Flow::builder("failing")
        .step("call", ToolExecutionStep::new(tool))
        .end("call")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_catch_routes_on_error_kind() {
    let guarded = CatchExceptionStep::new(failing_flow())
        .catch("ToolExecution")
        .unwrap();
    let flow = Flow::builder("guarded")
        .step("guarded", guarded)
        .step("fine", OutputMessageStep::new("fine"))
        .step("handled", OutputMessageStep::new("handled {{ exception_kind }}"))
        .branch("guarded", "next", "fine")
        .branch("guarded", "ToolExecution", "handled")
        .end("fine")
        .end("handled")
        .build()
        .unwrap();

    let mut conversation = flow.start_conversation().unwrap();
    flow.execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(
        conversation.last_agent_message().unwrap().text(),
        "handled ToolExecution"
    );
}

#[tokio::test]
async fn test_uncaught_kind_propagates() {
    let guarded = CatchExceptionStep::new(failing_flow())
        .catch("LlmRequest")
        .unwrap();
    let flow = Flow::builder("guarded")
        .step("guarded", guarded)
        .step("fine", OutputMessageStep::new("fine"))
        .step("handled", OutputMessageStep::new("handled"))
        .branch("guarded", "next", "fine")
        .branch("guarded", "LlmRequest", "handled")
        .end("fine")
        .end("handled")
        .build()
        .unwrap();

    let mut conversation = flow.start_conversation().unwrap();
    let err = flow
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ToolExecution");
}

#[tokio::test]
async fn test_variables_written_and_read_through_edges() {
    let flow = Flow::builder("greeter")
        .variable(Property::string("greeting"))
        .step("render", TemplateRenderingStep::new("Hello {{ name }}"))
        .step("show", OutputMessageStep::new("{{ greeting }}!"))
        .sequence(&["render", "show"])
        .write_variable("render", "output", "greeting")
        .read_variable("greeting", "show", "greeting")
        .build()
        .unwrap();

    let mut conversation = flow
        .start_conversation_with(inputs(&[("name", json!("Ada"))]))
        .unwrap();
    flow.execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(conversation.variables.read("greeting").unwrap(), json!("Hello Ada"));
    assert_eq!(conversation.last_agent_message().unwrap().text(), "Hello Ada!");
}

#[tokio::test]
async fn test_transition_limit_stops_loops() {
    let flow = Flow::builder("spin")
        .step("route", BranchingStep::new([("stop", "stop")]))
        .end_branch("route", "stop")
        .branch("route", "default", "route")
        .build()
        .unwrap();
    let ctx = ExecutionContext::new().with_limits(FlowConfig {
        max_transitions: 10,
        max_parallel: 4,
    });

    let mut conversation = flow
        .start_conversation_with(inputs(&[("next_step_name", json!("again"))]))
        .unwrap();
    let err = flow.execute(&mut conversation, &ctx).await.unwrap_err();
    assert!(matches!(err, StepwiseError::MaxTransitionsExceeded { limit: 10, .. }));
}

#[tokio::test]
async fn test_suspended_flow_resumes_after_serialization() {
    let flow = shout_flow();
    let ctx = ExecutionContext::new();
    let mut original = flow.start_conversation().unwrap();
    flow.execute(&mut original, &ctx).await.unwrap();

    let text = serde_json::to_string(&original.to_value().unwrap()).unwrap();
    let mut restored =
        stepwise_agent::Conversation::from_value(serde_json::from_str(&text).unwrap()).unwrap();

    original.submit_user_message("again").unwrap();
    restored.submit_user_message("again").unwrap();
    let a = flow.execute(&mut original, &ctx).await.unwrap();
    let b = flow.execute(&mut restored, &ctx).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(b.outputs().unwrap()["uppercased"], json!("AGAIN"));
}

#[tokio::test]
async fn test_failed_parallel_branch_merges_nothing() {
    let greet = Flow::builder("greet")
        .step("hello", OutputMessageStep::new("Hello, {{ name }}"))
        .end("hello")
        .build()
        .unwrap();
    let flow = Flow::builder("both")
        .step("fan_out", ParallelFlowExecutionStep::new(vec![greet, failing_flow()]).unwrap())
        .end("fan_out")
        .build()
        .unwrap();

    let mut conversation = flow
        .start_conversation_with(inputs(&[("name", json!("Ada"))]))
        .unwrap();
    let err = flow
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap_err();

    match err {
        StepwiseError::ParallelBranches {
            step,
            failures,
            completed,
        } => {
            assert_eq!(step, "fan_out");
            assert_eq!(completed, vec!["greet".to_string()]);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].branch, "failing");
            assert_eq!(failures[0].kind, "ToolExecution");
        }
        other => panic!("expected a parallel failure, got {:?}", other),
    }
    assert!(conversation.messages.is_empty());
}

#[tokio::test]
async fn test_timeout_interrupt_leaves_flow_resumable() {
    let flow = Flow::builder("greet")
        .step("hello", OutputMessageStep::new("Hello"))
        .end("hello")
        .build()
        .unwrap();
    let expired = ExecutionContext::new().with_interrupt(TimeoutInterrupt::new(Duration::ZERO));

    let mut conversation = flow.start_conversation().unwrap();
    let err = flow.execute(&mut conversation, &expired).await.unwrap_err();
    assert!(matches!(
        err,
        StepwiseError::Interrupted(InterruptReason::Timeout { limit_secs: 0, .. })
    ));
    assert!(conversation.messages.is_empty());

    let status = flow
        .execute(&mut conversation, &ExecutionContext::new())
        .await
        .unwrap();
    assert!(status.is_finished());
    assert_eq!(conversation.last_agent_message().unwrap().text(), "Hello");
}
