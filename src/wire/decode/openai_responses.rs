use crate::wire::decode::{
    arguments_to_string, parse_image_part, parse_tool_definition, split_extra,
    tool_result_content_text,
};
use crate::wire::{
    FinishReason, GatewayRequest, GatewayResponse, Message, Part, Role, ToolChoice, Usage,
};
use serde_json::Value;

pub fn decode_request(value: &Value) -> Result<GatewayRequest, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "responses request must be an object".to_string())?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing model".to_string())?
        .to_string();

    let mut messages = Vec::new();
    if let Some(instructions) = obj
        .get("instructions")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        messages.push(Message::text(Role::System, instructions));
    }

    match obj.get("input") {
        Some(Value::String(s)) => {
            if !s.trim().is_empty() {
                messages.push(Message::text(Role::User, s.trim()));
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let Some(item_obj) = item.as_object() else {
                    continue;
                };
                let mut item_type = item_obj
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if item_type.is_empty() && item_obj.contains_key("role") {
                    item_type = "message".to_string();
                }
                match item_type.as_str() {
                    "message" => {
                        let role = Role::parse(
                            item_obj.get("role").and_then(|v| v.as_str()).unwrap_or("user"),
                        );
                        let mut msg = Message::new(role);
                        decode_message_content(item_obj.get("content"), &mut msg);
                        if !msg.parts.is_empty() {
                            messages.push(msg);
                        }
                    }
                    "function_call" => {
                        let name = item_obj
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        if name.is_empty() {
                            continue;
                        }
                        let mut msg = Message::new(Role::Assistant);
                        msg.parts.push(Part::ToolCall {
                            call_id: item_obj
                                .get("call_id")
                                .or_else(|| item_obj.get("id"))
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            name,
                            arguments: arguments_to_string(item_obj.get("arguments")),
                        });
                        messages.push(msg);
                    }
                    "function_call_output" => {
                        let mut msg = Message::new(Role::Tool);
                        msg.parts.push(Part::ToolResult {
                            call_id: item_obj
                                .get("call_id")
                                .or_else(|| item_obj.get("tool_call_id"))
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            is_error: false,
                            content: tool_result_content_text(item_obj.get("output")),
                        });
                        messages.push(msg);
                    }
                    "reasoning" => {
                        let text = item_obj
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        if !text.is_empty() {
                            let mut msg = Message::new(Role::Assistant);
                            msg.parts.push(Part::Thinking {
                                text,
                                signature: None,
                            });
                            messages.push(msg);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let tools = obj.get("tools").and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(parse_tool_definition)
            .collect::<Vec<_>>()
    });

    Ok(GatewayRequest {
        model,
        messages,
        stream: obj.get("stream").and_then(|v| v.as_bool()),
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        max_output_tokens: obj
            .get("max_output_tokens")
            .or_else(|| obj.get("max_tokens"))
            .and_then(|v| v.as_u64()),
        reasoning_effort: obj
            .get("reasoning")
            .and_then(|r| r.get("effort"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        tools,
        tool_choice: obj.get("tool_choice").map(decode_tool_choice),
        metadata: obj.get("metadata").cloned(),
        thinking: None,
        extra: split_extra(
            obj,
            &[
                "model",
                "input",
                "instructions",
                "stream",
                "temperature",
                "top_p",
                "max_output_tokens",
                "max_tokens",
                "reasoning",
                "tools",
                "tool_choice",
                "metadata",
                // upstream-session fields never forwarded
                "previous_response_id",
                "prompt_cache_retention",
                "safety_identifier",
                "store",
            ],
        ),
    })
}

pub fn decode_response(value: &Value) -> Result<GatewayResponse, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "responses response must be an object".to_string())?;

    let mut message = Message::new(Role::Assistant);
    let mut saw_tool_call = false;

    if let Some(output) = obj.get("output").and_then(|v| v.as_array()) {
        for item in output {
            let Some(item_obj) = item.as_object() else {
                continue;
            };
            match item_obj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "message" => {
                    if let Some(blocks) = item_obj.get("content").and_then(|v| v.as_array()) {
                        for block in blocks {
                            let btype =
                                block.get("type").and_then(|v| v.as_str()).unwrap_or("");
                            if btype != "output_text" && btype != "text" {
                                continue;
                            }
                            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                                message.parts.push(Part::Text {
                                    text: text.to_string(),
                                });
                            }
                        }
                    }
                }
                "function_call" => {
                    saw_tool_call = true;
                    message.parts.push(Part::ToolCall {
                        call_id: item_obj
                            .get("call_id")
                            .or_else(|| item_obj.get("id"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        name: item_obj
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        arguments: arguments_to_string(item_obj.get("arguments")),
                    });
                }
                "reasoning" => {
                    let text = reasoning_item_text(item_obj);
                    if !text.is_empty() {
                        message.parts.push(Part::Thinking {
                            text,
                            signature: None,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    let finish_reason = if saw_tool_call {
        Some(FinishReason::ToolCalls)
    } else if obj.get("status").and_then(|v| v.as_str()) == Some("incomplete") {
        Some(FinishReason::Length)
    } else {
        Some(FinishReason::Stop)
    };

    let usage = obj
        .get("usage")
        .or_else(|| obj.get("response").and_then(|r| r.get("usage")))
        .and_then(|v| v.as_object())
        .map(|u| Usage {
            input_tokens: u
                .get("input_tokens")
                .or_else(|| u.get("prompt_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: u
                .get("output_tokens")
                .or_else(|| u.get("completion_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_read_input_tokens: u
                .get("input_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_creation_input_tokens: 0,
            cache_ttl: None,
            reasoning_tokens: u
                .get("output_tokens_details")
                .and_then(|d| d.get("reasoning_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        });

    Ok(GatewayResponse {
        id: obj
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("resp")
            .to_string(),
        model: obj
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        message,
        finish_reason,
        usage,
    })
}

fn decode_message_content(content: Option<&Value>, msg: &mut Message) {
    match content {
        Some(Value::String(s)) => {
            if !s.is_empty() {
                msg.parts.push(Part::Text { text: s.clone() });
            }
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                let Some(bobj) = block.as_object() else {
                    continue;
                };
                match bobj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "input_text" | "output_text" | "text" | "" => {
                        if let Some(text) = bobj.get("text").and_then(|v| v.as_str()) {
                            msg.parts.push(Part::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    "input_image" | "image_url" => {
                        if let Some(part) = parse_image_part(bobj) {
                            msg.parts.push(part);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn reasoning_item_text(item: &serde_json::Map<String, Value>) -> String {
    if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    if let Some(summary) = item.get("summary").and_then(|v| v.as_array()) {
        let mut out = String::new();
        for block in summary {
            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
        }
        return out;
    }
    String::new()
}

fn decode_tool_choice(v: &Value) -> ToolChoice {
    if let Some(s) = v.as_str() {
        return ToolChoice::Mode(s.to_string());
    }
    if let Some(name) = v.get("name").and_then(|v| v.as_str()) {
        return ToolChoice::Function(name.to_string());
    }
    if let Some(name) = v
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(|v| v.as_str())
    {
        return ToolChoice::Function(name.to_string());
    }
    ToolChoice::Mode("auto".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_item_list_input() {
        let body = json!({
            "model": "gpt-5",
            "instructions": "be terse",
            "input": [
                {"type": "message", "role": "user",
                 "content": [{"type": "input_text", "text": "weather?"}]},
                {"type": "function_call", "call_id": "c1", "name": "get_weather",
                 "arguments": "{\"city\":\"SF\"}"},
                {"type": "function_call_output", "call_id": "c1", "output": "sunny"}
            ],
            "max_output_tokens": 64,
            "reasoning": {"effort": "high"}
        });
        let req = decode_request(&body).expect("decode");
        assert_eq!(req.messages.len(), 4);
        assert_eq!(req.messages[0].role, Role::System);
        assert!(matches!(req.messages[2].parts[0], Part::ToolCall { .. }));
        assert_eq!(req.messages[3].role, Role::Tool);
        assert_eq!(req.max_output_tokens, Some(64));
        assert_eq!(req.reasoning_effort.as_deref(), Some("high"));
    }

    #[test]
    fn string_input_becomes_user_message() {
        let body = json!({"model": "m", "input": "hello"});
        let req = decode_request(&body).expect("decode");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
    }

    #[test]
    fn upstream_session_fields_are_not_kept() {
        let body = json!({
            "model": "m",
            "input": "x",
            "previous_response_id": "resp_0",
            "prompt_cache_retention": "24h",
            "safety_identifier": "s"
        });
        let req = decode_request(&body).expect("decode");
        assert!(!req.extra.contains_key("previous_response_id"));
        assert!(!req.extra.contains_key("prompt_cache_retention"));
        assert!(!req.extra.contains_key("safety_identifier"));
    }

    #[test]
    fn decodes_response_output() {
        let body = json!({
            "id": "resp_1",
            "model": "gpt-5",
            "status": "completed",
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "hm"}]},
                {"type": "message", "role": "assistant",
                 "content": [{"type": "output_text", "text": "hello"}]},
                {"type": "function_call", "call_id": "c1", "name": "f", "arguments": "{}"}
            ],
            "usage": {"input_tokens": 7, "output_tokens": 3}
        });
        let resp = decode_response(&body).expect("decode");
        assert_eq!(resp.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(resp.message.parts.len(), 3);
        assert!(matches!(resp.message.parts[0], Part::Thinking { .. }));
    }
}
