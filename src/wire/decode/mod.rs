pub mod anthropic;
pub mod openai_chat;
pub mod openai_responses;

use crate::wire::{Part, ToolDefinition};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Collect top-level fields outside `known` so encoders can merge them back.
pub fn split_extra(obj: &Map<String, Value>, known: &[&str]) -> HashMap<String, Value> {
    let mut extra = HashMap::new();
    for (k, v) in obj {
        if !known.contains(&k.as_str()) {
            extra.insert(k.clone(), v.clone());
        }
    }
    extra
}

/// Parse one tool definition in any of the three shapes:
/// chat `{type:function,function:{...}}`, responses
/// `{type:function,name,...}`, anthropic `{name,description,input_schema}`.
pub fn parse_tool_definition(raw: &Value) -> Option<ToolDefinition> {
    let obj = raw.as_object()?;

    if let Some(function) = obj.get("function").and_then(|v| v.as_object()) {
        let name = function.get("name").and_then(|v| v.as_str())?.to_string();
        return Some(ToolDefinition {
            name,
            description: function
                .get("description")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            parameters: function.get("parameters").cloned(),
        });
    }

    let name = obj.get("name").and_then(|v| v.as_str())?.to_string();
    Some(ToolDefinition {
        name,
        description: obj
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        parameters: obj
            .get("parameters")
            .cloned()
            .or_else(|| obj.get("input_schema").cloned()),
    })
}

/// Stringify tool-call arguments: strings pass through, anything else is
/// serialized.
pub fn arguments_to_string(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(s)) => s.clone(),
        Some(v) => serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()),
        None => String::new(),
    }
}

/// Flatten tool-result content (string, block array, or object) to text.
pub fn tool_result_content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => {
            let mut out = String::new();
            for block in blocks {
                if let Some(s) = block.as_str() {
                    out.push_str(s);
                    continue;
                }
                if let Some(obj) = block.as_object() {
                    let btype = obj.get("type").and_then(|v| v.as_str()).unwrap_or("");
                    if !btype.is_empty() && btype != "text" && btype != "output_text" {
                        continue;
                    }
                    if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                        out.push_str(text);
                    }
                }
            }
            if out.is_empty() {
                serde_json::to_string(blocks).unwrap_or_default()
            } else {
                out
            }
        }
        Some(v) => serde_json::to_string(v).unwrap_or_default(),
        None => String::new(),
    }
}

/// Parse an image part out of a chat `image_url` / responses `input_image`
/// block.
pub fn parse_image_part(obj: &Map<String, Value>) -> Option<Part> {
    match obj.get("image_url") {
        Some(Value::String(url)) => {
            let url = url.trim();
            if url.is_empty() {
                return None;
            }
            Some(Part::Image {
                url: url.to_string(),
                detail: obj
                    .get("detail")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            })
        }
        Some(Value::Object(inner)) => {
            let url = inner.get("url").and_then(|v| v.as_str())?.trim();
            if url.is_empty() {
                return None;
            }
            Some(Part::Image {
                url: url.to_string(),
                detail: inner
                    .get("detail")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            })
        }
        _ => None,
    }
}
