use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::traits::AuthProvider;
use stepwise_core::types::AuthChallenge;
use stepwise_tools::{ClientTool, FunctionTool};

/// `uppercase(text) -> uppercased`
pub fn uppercase_tool() -> FunctionTool {
    FunctionTool::new("uppercase", "Uppercase the given text", |args, _ctx| async move {
        Ok(json!(args["text"].as_str().unwrap_or_default().to_uppercase()))
    })
    .input(Property::string("text"))
    .output(Property::string("uppercased"))
}

/// `get_time() -> "12:00"`
pub fn time_tool() -> FunctionTool {
    FunctionTool::new("get_time", "Current wall-clock time", |_args, _ctx| async move {
        Ok(json!("12:00"))
    })
    .output(Property::string("time"))
}

/// A tool that fails its first `failures` calls, then echoes `value`.
/// The returned counter tracks how many times it ran.
pub fn flaky_tool(failures: usize) -> (FunctionTool, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tool = FunctionTool::new("flaky", "Fails a few times first", move |args, _ctx| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < failures {
                Err(StepwiseError::ToolExecution {
                    tool: "flaky".into(),
                    message: format!("attempt {} failed", n + 1),
                })
            } else {
                Ok(args["value"].clone())
            }
        }
    })
    .input(Property::string("value").with_default(json!("ok")))
    .output(Property::string("result"));
    (tool, calls)
}

/// Client-side `open_url(url) -> opened`.
pub fn client_tool() -> ClientTool {
    ClientTool::new("open_url", "Open a URL in the user's browser")
        .input(Property::string("url"))
        .output(Property::boolean("opened"))
}

/// Auth provider that accepts any code and returns `token-<code>`.
pub struct StaticAuth;

impl AuthProvider for StaticAuth {
    fn challenge(&self, tool: &str) -> AuthChallenge {
        AuthChallenge {
            authorization_url: format!("https://auth.example.com/authorize?tool={}", tool),
            state: Some("xyz".into()),
        }
    }

    fn exchange(&self, code: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if code.is_empty() {
                Err(StepwiseError::validation("code", "empty authorization code"))
            } else {
                Ok(format!("token-{}", code))
            }
        })
    }
}

/// `whoami() -> token` behind [`StaticAuth`]; returns the token it was given.
pub fn authed_tool() -> FunctionTool {
    FunctionTool::new("whoami", "Who am I?", |_args, ctx| async move {
        Ok(Value::String(ctx.auth_token.unwrap_or_default()))
    })
    .with_auth(Arc::new(StaticAuth))
}
