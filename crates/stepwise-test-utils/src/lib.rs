//! Shared test utilities: a scripted LLM, canned tools and fixtures.

pub mod llm;
pub mod tools;

use std::path::PathBuf;

use stepwise_core::config::AppConfig;

pub use llm::{Reply, ScriptedLlm};
pub use tools::{authed_tool, client_tool, flaky_tool, time_tool, uppercase_tool, StaticAuth};

/// Config with small limits so runaway loops fail fast in tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.agent.max_iterations = 5;
    config.flow.max_transitions = 100;
    config.flow.max_parallel = 4;
    config
}

/// Write `content` to `stepwise.toml` inside a fresh temp dir.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("stepwise.toml");
    std::fs::write(&path, content).expect("write config");
    (dir, path)
}
