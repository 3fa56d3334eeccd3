//! Flattens the typed content parts of a remote tool result into one display
//! string the model can reason about. Unknown part types are dumped as raw
//! JSON rather than dropped, so nothing a server reports goes invisible.

use serde_json::Value;

pub fn flatten_content(result: &Value) -> String {
    let Some(parts) = result.get("content").and_then(Value::as_array) else {
        // No content array at all: show the raw result.
        return serde_json::to_string(result).unwrap_or_default();
    };

    let mut rendered = Vec::with_capacity(parts.len());
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    rendered.push(text.to_string());
                }
            }
            Some("image") => {
                let mime = part
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("image");
                let size = part
                    .get("data")
                    .and_then(Value::as_str)
                    .map(str::len)
                    .unwrap_or(0);
                rendered.push(format!("[{mime} image, {size} base64 bytes]"));
            }
            Some("resource") => {
                let resource = part.get("resource").unwrap_or(part);
                let uri = resource
                    .get("uri")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                match resource.get("text").and_then(Value::as_str) {
                    Some(text) => rendered.push(format!("[resource {uri}]\n{text}")),
                    None => rendered.push(format!("[resource {uri}]")),
                }
            }
            _ => rendered.push(serde_json::to_string(part).unwrap_or_default()),
        }
    }

    rendered.join("\n")
}

/// Best-effort error message for a result flagged with `isError`.
pub fn extract_error_message(result: &Value) -> String {
    let flattened = flatten_content(result);
    if flattened.trim().is_empty() {
        "remote tool reported an error without a message".to_string()
    } else {
        flattened
    }
}
