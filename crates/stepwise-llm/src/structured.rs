use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::{coerce_values, Property};
use stepwise_core::types::ValueMap;

/// Cleans up raw LLM text before it is parsed as structured output.
pub struct OutputCleaner;

impl OutputCleaner {
    /// Strip code fences and balance JSON braces.
    pub fn heuristic_repair(output: &str) -> String {
        let mut result = strip_code_fences(output);

        result = result.trim().to_string();

        if result.starts_with('{') || result.starts_with('[') {
            result = balance_braces(&result);
        }

        result
    }

    /// Find a JSON value in free text: the whole text, its repaired form, or
    /// the first `{`/`[` onward.
    pub fn extract_json(text: &str) -> Option<Value> {
        if let Ok(v) = serde_json::from_str::<Value>(text.trim()) {
            return Some(v);
        }
        let repaired = Self::heuristic_repair(text);
        if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
            return Some(v);
        }
        let start = repaired.find(['{', '['])?;
        let candidate = balance_braces(trim_trailing_prose(&repaired[start..]));
        serde_json::from_str::<Value>(&candidate).ok()
    }
}

/// Parse LLM text as an object matching `outputs`.
pub fn parse_structured(text: &str, outputs: &[Property]) -> Result<ValueMap> {
    let value = OutputCleaner::extract_json(text)
        .ok_or_else(|| StepwiseError::LlmParse("no JSON object found in response".into()))?;
    let map = match value {
        Value::Object(map) => map,
        other if outputs.len() == 1 => {
            let mut map = ValueMap::new();
            map.insert(outputs[0].name.clone(), other);
            map
        }
        _ => {
            return Err(StepwiseError::LlmParse(
                "structured response is not a JSON object".into(),
            ))
        }
    };
    coerce_values(outputs, map, "output")
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Drop text after the last closing brace or bracket.
fn trim_trailing_prose(text: &str) -> &str {
    match text.rfind(['}', ']']) {
        Some(end) => &text[..=end],
        None => text,
    }
}

/// Balance JSON braces/brackets by appending missing closers.
fn balance_braces(text: &str) -> String {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    let mut result = text.to_string();
    if in_string {
        result.push('"');
    }
    while let Some(c) = closers.pop() {
        result.push(c);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heuristic_repair_markdown() {
        let input = "```json\n{\"key\": \"value\", \"count\": 42}\n```";
        let result = OutputCleaner::heuristic_repair(input);
        assert_eq!(result, r#"{"key": "value", "count": 42}"#);
    }

    #[test]
    fn test_nested_balancing_respects_order() {
        let input = r#"{"items": [{"a": 1"#;
        let result = OutputCleaner::heuristic_repair(input);
        assert_eq!(result, r#"{"items": [{"a": 1}]}"#);
        assert!(serde_json::from_str::<Value>(&result).is_ok());
    }

    #[test]
    fn test_balanced_json_unchanged() {
        let input = r#"{"key": "value"}"#;
        assert_eq!(OutputCleaner::heuristic_repair(input), input);
    }

    #[test]
    fn test_extract_json_from_prose() {
        let text = "Sure! Here it is: {\"current_time\": \"12:00\"} Let me know.";
        assert_eq!(
            OutputCleaner::extract_json(text),
            Some(json!({"current_time": "12:00"}))
        );
        assert_eq!(OutputCleaner::extract_json("no json here"), None);
    }

    #[test]
    fn test_parse_structured() {
        let outputs = vec![Property::string("current_time"), Property::integer("offset").with_default(json!(0))];
        let parsed = parse_structured("```json\n{\"current_time\": \"12:00\"}\n```", &outputs).unwrap();
        assert_eq!(parsed["current_time"], "12:00");
        assert_eq!(parsed["offset"], 0);

        let err = parse_structured("{\"offset\": 1}", &outputs).unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }

    #[test]
    fn test_parse_structured_bare_value_for_single_output() {
        let outputs = vec![Property::list("tags", Property::string(""))];
        let parsed = parse_structured("[\"a\", \"b\"]", &outputs).unwrap();
        assert_eq!(parsed["tags"], json!(["a", "b"]));
    }
}
