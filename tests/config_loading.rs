use std::io::Write;
use std::sync::Arc;

use serde_json::json;

use stepwise_agent::steps::BranchingStep;
use stepwise_agent::{Agent, ConversationalComponent, ExecutionContext, Flow, LlmHandle};
use stepwise_core::config::AppConfig;
use stepwise_core::error::StepwiseError;
use stepwise_core::types::InterruptReason;
use stepwise_test_utils::{test_config, write_config, ScriptedLlm};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[model]
model_id = "claude-sonnet-4-20250514"
max_tokens = 2048
temperature = 0.5

[model.retry]
max_retries = 5

[[fallback_models]]
model_id = "small-model"

[agent]
max_iterations = 12
max_validation_retries = 1
parallel_tool_calls = true

[flow]
max_transitions = 50
max_parallel = 2

[interrupts]
timeout_secs = 30
token_budget = 10000

[log]
level = "stepwise_agent=debug"
json = true

[store]
path = "/tmp/stepwise-test/conversations.db"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.model_id, "claude-sonnet-4-20250514");
    assert_eq!(config.model.max_tokens, 2048);
    let retry = config.model.retry.expect("retry present");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 1000);
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "small-model");

    assert_eq!(config.agent.max_iterations, 12);
    assert_eq!(config.agent.max_validation_retries, 1);
    assert!(config.agent.parallel_tool_calls);
    assert_eq!(config.flow.max_transitions, 50);
    assert_eq!(config.flow.max_parallel, 2);
    assert_eq!(config.interrupts.timeout_secs, Some(30));
    assert_eq!(config.interrupts.token_budget, Some(10000));
    assert_eq!(config.log.level, "stepwise_agent=debug");
    assert!(config.log.json);
    assert_eq!(
        config.store.resolved_path(),
        std::path::PathBuf::from("/tmp/stepwise-test/conversations.db")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STEPWISE_TEST_MODEL", "expanded-model");

    let (_dir, path) = write_config(
        r#"
[model]
model_id = "${STEPWISE_TEST_MODEL}"
"#,
    );
    let config = AppConfig::load(&path).expect("load config");
    assert_eq!(config.model.model_id, "expanded-model");

    std::env::remove_var("STEPWISE_TEST_MODEL");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let (_dir, path) = write_config("");
    let config = AppConfig::load(&path).expect("load config");

    assert_eq!(config.agent.max_iterations, 10);
    assert_eq!(config.agent.max_validation_retries, 2);
    assert!(!config.agent.parallel_tool_calls);
    assert_eq!(config.flow.max_transitions, 1_000);
    assert_eq!(config.flow.max_parallel, 8);
    assert!(config.interrupts.timeout_secs.is_none());
    assert!(config.interrupts.token_budget.is_none());
    assert_eq!(config.log.level, "info");
    assert!(!config.log.json);
    assert!(config.model.retry.is_none());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, StepwiseError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let (_dir, path) = write_config("[flow]\nmax_transitions = \"many\"\n");
    let err = AppConfig::load(&path).unwrap_err();
    assert!(matches!(err, StepwiseError::Config(_)));
}

#[tokio::test]
async fn test_flow_limits_from_config() {
    let (_dir, path) = write_config("[flow]\nmax_transitions = 3\n");
    let config = AppConfig::load(&path).expect("load config");
    let ctx = ExecutionContext::from_config(&config);

    let flow = Flow::builder("spin")
        .step("route", BranchingStep::new([("stop", "stop")]))
        .end_branch("route", "stop")
        .branch("route", "default", "route")
        .build()
        .expect("build flow");
    let mut inputs = serde_json::Map::new();
    inputs.insert("next_step_name".into(), json!("again"));
    let mut conversation = flow.start_conversation_with(inputs).expect("start");

    let err = flow.execute(&mut conversation, &ctx).await.unwrap_err();
    assert!(matches!(err, StepwiseError::MaxTransitionsExceeded { limit: 3, .. }));
}

#[tokio::test]
async fn test_token_budget_from_config() {
    let mut config = test_config();
    config.interrupts.token_budget = Some(10);
    let ctx = ExecutionContext::from_config(&config);

    let llm = Arc::new(
        ScriptedLlm::new()
            .text("first")
            .text("second")
            .with_usage(8, 4),
    );
    let agent = Agent::builder("chatty", LlmHandle::new("scripted", llm.clone()))
        .with_config(&config.agent)
        .build()
        .expect("build agent");

    let mut conversation = agent.start_conversation().expect("start");
    conversation.submit_user_message("hi").expect("message");
    agent.execute(&mut conversation, &ctx).await.expect("first turn");

    conversation.submit_user_message("again").expect("message");
    let err = agent.execute(&mut conversation, &ctx).await.unwrap_err();
    assert!(matches!(
        err,
        StepwiseError::Interrupted(InterruptReason::TokenBudget { used: 12, budget: 10 })
    ));
    assert_eq!(llm.calls(), 1);
}
