use std::path::Path;

use anyhow::Context;

use stepwise_agent::{Awaiting, ComponentState, Conversation, ExecutionStatus};
use stepwise_memory::ConversationStore;

/// Load a conversation from a JSON file, or by id from the store.
pub fn load(target: &str, store_path: &Path) -> anyhow::Result<Conversation> {
    let path = Path::new(target);
    let value: serde_json::Value = if path.is_file() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        let store = ConversationStore::open(store_path)?;
        store
            .load(target)?
            .with_context(|| format!("no conversation '{}' in {}", target, store_path.display()))?
    };
    Ok(Conversation::from_value(value)?)
}

/// One `label: detail` line per fact about the conversation.
pub fn describe(conversation: &Conversation) -> Vec<(String, String)> {
    let mut lines = vec![
        ("Conversation".to_string(), conversation.id.clone()),
        (
            "Component".to_string(),
            format!("{} ({})", conversation.component.name, conversation.component.kind),
        ),
        ("Status".to_string(), status_line(conversation.status.as_ref())),
    ];

    if let Some(status) = &conversation.status {
        lines.extend(pending_lines(status));
    }
    if let Some(position) = position(&conversation.state) {
        lines.push(("Position".to_string(), position));
    }

    lines.push(("Messages".to_string(), conversation.messages.len().to_string()));
    let variables = conversation.variables.names();
    if !variables.is_empty() {
        lines.push(("Variables".to_string(), variables.join(", ")));
    }
    let usage = &conversation.token_usage;
    lines.push((
        "Tokens".to_string(),
        format!(
            "{} in / {} out ({} total)",
            usage.input_tokens,
            usage.output_tokens,
            usage.total()
        ),
    ));
    lines.push((
        "Updated".to_string(),
        conversation.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    ));
    lines
}

pub fn print(conversation: &Conversation) {
    for (label, detail) in describe(conversation) {
        println!("  {:<13} {}", format!("{}:", label), detail);
    }
}

fn status_line(status: Option<&ExecutionStatus>) -> String {
    match status {
        None => "not started".to_string(),
        Some(ExecutionStatus::Finished { exit_branch, .. }) => {
            format!("finished via '{}'", exit_branch)
        }
        Some(other) => format!("suspended ({})", other.tag()),
    }
}

fn pending_lines(status: &ExecutionStatus) -> Vec<(String, String)> {
    match status {
        ExecutionStatus::UserMessageRequest { message } => message
            .iter()
            .map(|m| ("Asked".to_string(), super::truncate(m, 80).to_string()))
            .collect(),
        ExecutionStatus::ToolRequest { requests, awaiting } => {
            let label = match awaiting {
                Awaiting::Results => "Awaiting result",
                Awaiting::Confirmation => "Needs approval",
            };
            requests
                .iter()
                .map(|r| {
                    (
                        label.to_string(),
                        format!("{} [{}] {}", r.name, r.id, super::truncate(&r.args.to_string(), 60)),
                    )
                })
                .collect()
        }
        ExecutionStatus::AuthChallengeRequest {
            challenge_id,
            tool,
            challenge,
        } => vec![(
            "Auth needed".to_string(),
            format!("{} [{}] {}", tool, challenge_id, challenge.authorization_url),
        )],
        ExecutionStatus::Finished { outputs, .. } => {
            let names: Vec<&str> = outputs.keys().map(String::as_str).collect();
            if names.is_empty() {
                Vec::new()
            } else {
                vec![("Outputs".to_string(), names.join(", "))]
            }
        }
    }
}

/// Where execution resumes, when the component tracks it.
fn position(state: &ComponentState) -> Option<String> {
    match state {
        ComponentState::Flow(flow) => Some(match &flow.current_step {
            Some(step) => format!("step '{}'", step),
            None => "exited".to_string(),
        }),
        ComponentState::Swarm(swarm) => Some(match swarm.stack.last() {
            Some(frame) => format!("{} waiting on {}", frame.caller, frame.callee),
            None => format!("agent '{}'", swarm.active),
        }),
        ComponentState::ManagerWorkers(group) => group
            .active
            .as_ref()
            .map(|a| format!("worker '{}'", a.worker)),
        ComponentState::Agent(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_agent::steps::InputMessageStep;
    use stepwise_agent::{ConversationalComponent, ExecutionContext, Flow};
    use stepwise_core::message::ToolRequest;

    fn asking_flow() -> Flow {
        Flow::builder("asker")
            .step("ask", InputMessageStep::with_prompt("Name?"))
            .end("ask")
            .build()
            .expect("build flow")
    }

    fn lookup<'a>(lines: &'a [(String, String)], label: &str) -> Option<&'a str> {
        lines
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, d)| d.as_str())
    }

    #[test]
    fn test_describe_fresh_conversation() {
        let conversation = asking_flow().start_conversation().expect("start");
        let lines = describe(&conversation);
        assert_eq!(lookup(&lines, "Component"), Some("asker (flow)"));
        assert_eq!(lookup(&lines, "Status"), Some("not started"));
        assert_eq!(lookup(&lines, "Position"), Some("step 'ask'"));
        assert_eq!(lookup(&lines, "Messages"), Some("0"));
    }

    #[tokio::test]
    async fn test_describe_suspended_flow() {
        let flow = asking_flow();
        let mut conversation = flow.start_conversation().expect("start");
        flow.execute(&mut conversation, &ExecutionContext::new())
            .await
            .expect("execute");

        let lines = describe(&conversation);
        assert_eq!(lookup(&lines, "Status"), Some("suspended (user_message_request)"));
        assert_eq!(lookup(&lines, "Asked"), Some("Name?"));
        assert_eq!(lookup(&lines, "Messages"), Some("1"));
    }

    #[test]
    fn test_pending_tool_requests_listed() {
        let status = ExecutionStatus::ToolRequest {
            requests: vec![ToolRequest::new("delete_file", json!({"path": "a"})).with_id("d1")],
            awaiting: Awaiting::Confirmation,
        };
        let lines = pending_lines(&status);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, "Needs approval");
        assert!(lines[0].1.starts_with("delete_file [d1]"));
    }

    #[test]
    fn test_load_from_file() {
        let conversation = asking_flow().start_conversation().expect("start");
        let dir = tempfile::tempdir().expect("temp dir");
        let file = dir.path().join("conversation.json");
        std::fs::write(
            &file,
            serde_json::to_string(&conversation.to_value().expect("serialize")).expect("json"),
        )
        .expect("write");

        let loaded = load(
            file.to_str().expect("utf-8 path"),
            &dir.path().join("unused.db"),
        )
        .expect("load");
        assert_eq!(loaded.id, conversation.id);
    }

    #[test]
    fn test_load_unknown_id_from_store() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = load("missing", &dir.path().join("conversations.db")).unwrap_err();
        assert!(err.to_string().contains("no conversation 'missing'"));
    }
}
