use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use stepwise_core::message::Message;

/// Get or initialize the tokenizer for cl100k_base.
fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer")
    })
}

pub fn estimate_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

/// Contents, tool requests and tool result serialized to JSON, plus 4
/// tokens of per-message overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut text = serde_json::to_string(&message.contents).unwrap_or_default();
    if !message.tool_requests.is_empty() {
        text.push_str(&serde_json::to_string(&message.tool_requests).unwrap_or_default());
    }
    if let Some(result) = &message.tool_result {
        text.push_str(&result.content_text());
    }
    estimate_tokens(&text) + 4
}

pub fn estimate_total(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Truncate `content` to roughly `max_tokens` (4 chars per token), cutting
/// at a newline when one is available, and mark the cut.
pub fn compact_tool_output(content: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(4);
    if content.len() <= max_chars {
        return content.to_string();
    }
    let mut cut = max_chars;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncated = &content[..cut];
    match truncated.rfind('\n') {
        Some(nl) => format!("{}\n[truncated]", &content[..nl]),
        None => format!("{}\n[truncated]", truncated),
    }
}
