use crate::wire::decode::{
    arguments_to_string, parse_image_part, parse_tool_definition, split_extra,
    tool_result_content_text,
};
use crate::wire::{
    FinishReason, GatewayRequest, GatewayResponse, Message, Part, Role, ToolChoice, ToolDefinition,
    Usage,
};
use serde_json::Value;

pub fn decode_request(value: &Value) -> Result<GatewayRequest, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "chat request must be an object".to_string())?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing model".to_string())?
        .to_string();

    let mut messages = Vec::new();
    for raw_msg in obj
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "missing messages".to_string())?
    {
        let Some(msg_obj) = raw_msg.as_object() else {
            continue;
        };
        let role = Role::parse(msg_obj.get("role").and_then(|v| v.as_str()).unwrap_or("user"));
        let mut msg = Message::new(role);

        if role == Role::Tool {
            msg.parts.push(Part::ToolResult {
                call_id: msg_obj
                    .get("tool_call_id")
                    .or_else(|| msg_obj.get("call_id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                is_error: false,
                content: tool_result_content_text(msg_obj.get("content")),
            });
            messages.push(msg);
            continue;
        }

        match msg_obj.get("content") {
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
                    match bobj.get("type").and_then(|v| v.as_str()).unwrap_or("text") {
                        "text" => {
                            if let Some(text) = bobj.get("text").and_then(|v| v.as_str()) {
                                msg.parts.push(Part::Text {
                                    text: text.to_string(),
                                });
                            }
                        }
                        "image_url" => {
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

        if let Some(reasoning) = msg_obj.get("reasoning_content").and_then(|v| v.as_str()) {
            if !reasoning.is_empty() {
                msg.parts.push(Part::Thinking {
                    text: reasoning.to_string(),
                    signature: None,
                });
            }
        }

        if let Some(tool_calls) = msg_obj.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tool_calls {
                let Some(tc_obj) = tc.as_object() else { continue };
                let function = tc_obj.get("function").and_then(|v| v.as_object());
                msg.parts.push(Part::ToolCall {
                    call_id: tc_obj
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: function
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    arguments: arguments_to_string(function.and_then(|f| f.get("arguments"))),
                });
            }
        }

        if !msg.parts.is_empty() {
            messages.push(msg);
        }
    }

    let mut tools: Option<Vec<ToolDefinition>> = obj
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(parse_tool_definition).collect());
    // Legacy chat-completions `functions` are promoted to tools.
    if tools.is_none() {
        tools = obj
            .get("functions")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(parse_tool_definition).collect());
    }

    let mut tool_choice = obj.get("tool_choice").map(decode_tool_choice);
    if tool_choice.is_none() {
        tool_choice = obj.get("function_call").and_then(decode_legacy_function_call);
    }

    Ok(GatewayRequest {
        model,
        messages,
        stream: obj.get("stream").and_then(|v| v.as_bool()),
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        max_output_tokens: obj
            .get("max_tokens")
            .or_else(|| obj.get("max_completion_tokens"))
            .and_then(|v| v.as_u64()),
        reasoning_effort: obj
            .get("reasoning_effort")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        tools,
        tool_choice,
        metadata: obj.get("metadata").cloned(),
        thinking: obj.get("thinking").cloned(),
        extra: split_extra(
            obj,
            &[
                "model",
                "messages",
                "stream",
                "temperature",
                "top_p",
                "max_tokens",
                "max_completion_tokens",
                "reasoning_effort",
                "tools",
                "functions",
                "tool_choice",
                "function_call",
                "metadata",
                "thinking",
            ],
        ),
    })
}

pub fn decode_response(value: &Value) -> Result<GatewayResponse, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "chat response must be an object".to_string())?;

    let choice = obj
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .cloned()
        .unwrap_or(Value::Null);

    let mut message = Message::new(Role::Assistant);
    let msg = choice.get("message").cloned().unwrap_or(Value::Null);

    if let Some(reasoning) = msg.get("reasoning_content").and_then(|v| v.as_str()) {
        if !reasoning.is_empty() {
            message.parts.push(Part::Thinking {
                text: reasoning.to_string(),
                signature: None,
            });
        }
    }
    if let Some(text) = msg.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            message.parts.push(Part::Text {
                text: text.to_string(),
            });
        }
    }
    if let Some(tool_calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tool_calls {
            let function = tc.get("function");
            message.parts.push(Part::ToolCall {
                call_id: tc
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                name: function
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                arguments: arguments_to_string(function.and_then(|f| f.get("arguments"))),
            });
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(FinishReason::from_chat);

    let usage = obj.get("usage").and_then(|v| v.as_object()).map(|u| Usage {
        input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_read_input_tokens: u
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_input_tokens: 0,
        cache_ttl: None,
        reasoning_tokens: u
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    });

    Ok(GatewayResponse {
        id: obj
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("chatcmpl")
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

fn decode_tool_choice(v: &Value) -> ToolChoice {
    if let Some(s) = v.as_str() {
        return ToolChoice::Mode(s.to_string());
    }
    if let Some(name) = v
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(|v| v.as_str())
    {
        return ToolChoice::Function(name.to_string());
    }
    if let Some(name) = v.get("name").and_then(|v| v.as_str()) {
        return ToolChoice::Function(name.to_string());
    }
    ToolChoice::Mode("auto".to_string())
}

fn decode_legacy_function_call(v: &Value) -> Option<ToolChoice> {
    if let Some(s) = v.as_str() {
        return match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(ToolChoice::Mode("none".to_string())),
            "auto" => Some(ToolChoice::Mode("auto".to_string())),
            "required" => Some(ToolChoice::Mode("required".to_string())),
            _ => None,
        };
    }
    v.get("name")
        .and_then(|n| n.as_str())
        .filter(|n| !n.trim().is_empty())
        .map(|n| ToolChoice::Function(n.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_tool_round_trip_request() {
        let body = json!({
            "model": "gpt",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "sunny"}
            ],
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {}}}],
            "tool_choice": "auto"
        });
        let req = decode_request(&body).expect("decode");
        assert_eq!(req.messages.len(), 4);
        assert_eq!(req.messages[0].role, Role::System);
        assert!(matches!(req.messages[2].parts[0], Part::ToolCall { .. }));
        assert_eq!(req.messages[3].role, Role::Tool);
        assert_eq!(req.tools.as_ref().unwrap().len(), 1);
        assert_eq!(req.tool_choice, Some(ToolChoice::Mode("auto".to_string())));
    }

    #[test]
    fn promotes_legacy_functions() {
        let body = json!({
            "model": "gpt",
            "messages": [{"role": "user", "content": "x"}],
            "functions": [{"name": "f", "parameters": {"type": "object"}}],
            "function_call": {"name": "f"}
        });
        let req = decode_request(&body).expect("decode");
        assert_eq!(req.tools.as_ref().unwrap()[0].name, "f");
        assert_eq!(req.tool_choice, Some(ToolChoice::Function("f".to_string())));
    }

    #[test]
    fn decodes_response_usage() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt",
            "choices": [{"message": {"role": "assistant", "content": "hello"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1}
        });
        let resp = decode_response(&body).expect("decode");
        assert_eq!(resp.finish_reason, Some(FinishReason::Stop));
        let usage = resp.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (5, 1));
    }
}
