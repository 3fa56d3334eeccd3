//! Extracts a structured directive from free-form model output.
//!
//! Best-effort JSON scraping is contained here as an explicit ordered list of
//! strategies: a fenced block marked as a directive payload, then a trailing
//! JSON object carrying `thought` or `tool_calls`. When no strategy yields an
//! object with those keys the caller treats the whole response as a final
//! plain-text answer; malformed structured output degrades to a visible
//! answer, never a hard failure.

use crate::application::registry::ToolCall;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// The `{thought?, tool_calls?}` payload a model emits to request tool
/// execution.
#[derive(Debug, Default)]
pub struct Directive {
    pub thought: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

pub fn parse(content: &str) -> Option<Directive> {
    if let Some(value) = fenced_block(content) {
        if let Some(directive) = from_value(&value) {
            return Some(directive);
        }
    }
    if let Some(value) = trailing_object(content) {
        if let Some(directive) = from_value(&value) {
            return Some(directive);
        }
    }
    None
}

/// Strategy (a): a fenced block tagged as JSON or directive payload.
fn fenced_block(content: &str) -> Option<Value> {
    for marker in ["```json", "```JSON", "```directive"] {
        if let Some(start) = content.find(marker) {
            let rest = &content[start + marker.len()..];
            if let Some(end) = rest.find("```") {
                if let Ok(value) = serde_json::from_str::<Value>(rest[..end].trim()) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Strategy (b): the whole response, or the outermost `{...}` span, parses as
/// JSON.
fn trailing_object(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            let candidate = &trimmed[start..=end];
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return Some(value);
            }
        }
    }

    None
}

/// Accepts only an object whose top-level keys include `thought` or
/// `tool_calls`; anything else is not a directive.
fn from_value(value: &Value) -> Option<Directive> {
    let map = value.as_object()?;
    if !map.contains_key("thought") && !map.contains_key("tool_calls") {
        return None;
    }

    let thought = map
        .get("thought")
        .and_then(Value::as_str)
        .map(str::to_string);

    let tool_calls = map
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_call).collect())
        .unwrap_or_default();

    Some(Directive {
        thought,
        tool_calls,
    })
}

fn parse_call(value: &Value) -> Option<ToolCall> {
    let map = value.as_object()?;
    let Some(name) = map
        .get("name")
        .or_else(|| map.get("tool"))
        .and_then(Value::as_str)
    else {
        debug!("Skipping tool call entry without a name");
        return None;
    };

    let arguments = map
        .get("arguments")
        .or_else(|| map.get("input"))
        .or_else(|| map.get("parameters"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    let id = map
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Some(ToolCall {
        id,
        name: name.to_string(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_fenced_directive_block() {
        let content = r#"I'll read the file first.

```json
{"thought": "need the contents", "tool_calls": [{"id": "c1", "name": "read_file", "arguments": {"path": "a.rs"}}]}
```"#;
        let directive = parse(content).expect("directive parsed");
        assert_eq!(directive.thought.as_deref(), Some("need the contents"));
        assert_eq!(directive.tool_calls.len(), 1);
        assert_eq!(directive.tool_calls[0].id, "c1");
        assert_eq!(directive.tool_calls[0].name, "read_file");
        assert_eq!(directive.tool_calls[0].arguments, json!({"path": "a.rs"}));
    }

    #[test]
    fn parses_trailing_object_after_prose() {
        let content = r#"Let me check.
{"tool_calls": [{"name": "list_dir", "input": {"path": "."}}]}"#;
        let directive = parse(content).expect("directive parsed");
        assert_eq!(directive.tool_calls.len(), 1);
        assert_eq!(directive.tool_calls[0].name, "list_dir");
        assert_eq!(directive.tool_calls[0].arguments, json!({"path": "."}));
        assert!(!directive.tool_calls[0].id.is_empty());
    }

    #[test]
    fn thought_only_directive_has_no_calls() {
        let directive = parse(r#"{"thought": "all done"}"#).expect("directive parsed");
        assert_eq!(directive.thought.as_deref(), Some("all done"));
        assert!(directive.tool_calls.is_empty());
    }

    #[test]
    fn object_without_directive_keys_is_not_a_directive() {
        assert!(parse(r#"{"answer": "42"}"#).is_none());
    }

    #[test]
    fn malformed_json_is_not_a_directive() {
        assert!(parse("here is some output { not json at all").is_none());
        assert!(parse("plain prose answer").is_none());
    }

    #[test]
    fn entries_without_names_are_skipped() {
        let directive = parse(
            r#"{"tool_calls": [{"arguments": {}}, {"name": "ok_tool"}]}"#,
        )
        .expect("directive parsed");
        assert_eq!(directive.tool_calls.len(), 1);
        assert_eq!(directive.tool_calls[0].name, "ok_tool");
        assert_eq!(directive.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn fenced_block_wins_over_trailing_object() {
        let content = r#"```json
{"tool_calls": [{"name": "from_fence"}]}
```
{"tool_calls": [{"name": "from_tail"}]}"#;
        let directive = parse(content).expect("directive parsed");
        assert_eq!(directive.tool_calls[0].name, "from_fence");
    }
}
