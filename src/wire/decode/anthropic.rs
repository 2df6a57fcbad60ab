use crate::wire::decode::{parse_tool_definition, split_extra, tool_result_content_text};
use crate::wire::{
    FinishReason, GatewayRequest, GatewayResponse, Message, Part, Role, ToolChoice, Usage,
};
use serde_json::Value;

pub fn decode_request(value: &Value) -> Result<GatewayRequest, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "messages request must be an object".to_string())?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing model".to_string())?
        .to_string();

    let mut messages = Vec::new();

    if let Some(system) = obj.get("system") {
        let system_text = match system {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !system_text.is_empty() {
            messages.push(Message::text(Role::System, system_text));
        }
    }

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
        // tool_result blocks split off into Tool-role messages of their own
        let mut tool_messages: Vec<Message> = Vec::new();

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
                    match bobj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                        "text" => {
                            if let Some(text) = bobj.get("text").and_then(|v| v.as_str()) {
                                msg.parts.push(Part::Text {
                                    text: text.to_string(),
                                });
                            }
                        }
                        "thinking" => {
                            if let Some(thinking) = bobj.get("thinking").and_then(|v| v.as_str()) {
                                msg.parts.push(Part::Thinking {
                                    text: thinking.to_string(),
                                    signature: bobj
                                        .get("signature")
                                        .and_then(|v| v.as_str())
                                        .filter(|s| !s.is_empty())
                                        .map(|s| s.to_string()),
                                });
                            }
                        }
                        "tool_use" => {
                            msg.parts.push(Part::ToolCall {
                                call_id: bobj
                                    .get("id")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                name: bobj
                                    .get("name")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                arguments: serde_json::to_string(
                                    bobj.get("input").unwrap_or(&Value::Null),
                                )
                                .unwrap_or_else(|_| "{}".to_string()),
                            });
                        }
                        "tool_result" => {
                            let mut tool_msg = Message::new(Role::Tool);
                            tool_msg.parts.push(Part::ToolResult {
                                call_id: bobj
                                    .get("tool_use_id")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                is_error: bobj
                                    .get("is_error")
                                    .and_then(|v| v.as_bool())
                                    .unwrap_or(false),
                                content: tool_result_content_text(bobj.get("content")),
                            });
                            tool_messages.push(tool_msg);
                        }
                        "image" => {
                            if let Some(part) = decode_image_block(bobj) {
                                msg.parts.push(part);
                            }
                        }
                        _ => {
                            msg.parts.push(Part::Text {
                                text: serde_json::to_string(block).unwrap_or_default(),
                            });
                        }
                    }
                }
            }
            _ => {}
        }

        if !msg.parts.is_empty() {
            messages.push(msg);
        }
        messages.extend(tool_messages);
    }

    let tools = obj.get("tools").and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(parse_tool_definition)
            .collect::<Vec<_>>()
    });

    let thinking = obj.get("thinking").cloned();
    let reasoning_effort = thinking
        .as_ref()
        .and_then(|t| t.get("budget_tokens"))
        .and_then(|v| v.as_u64())
        .and_then(|budget| {
            if budget == 0 {
                None
            } else if budget <= 512 {
                Some("low".to_string())
            } else if budget >= 2048 {
                Some("high".to_string())
            } else {
                Some("medium".to_string())
            }
        });

    Ok(GatewayRequest {
        model,
        messages,
        stream: obj.get("stream").and_then(|v| v.as_bool()),
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        max_output_tokens: obj.get("max_tokens").and_then(|v| v.as_u64()),
        reasoning_effort,
        tools,
        tool_choice: obj.get("tool_choice").map(decode_tool_choice),
        metadata: obj.get("metadata").cloned(),
        thinking,
        extra: split_extra(
            obj,
            &[
                "model",
                "messages",
                "system",
                "stream",
                "temperature",
                "top_p",
                "max_tokens",
                "thinking",
                "tools",
                "tool_choice",
                "metadata",
            ],
        ),
    })
}

pub fn decode_response(value: &Value) -> Result<GatewayResponse, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "messages response must be an object".to_string())?;

    let mut message = Message::new(Role::Assistant);
    if let Some(content) = obj.get("content").and_then(|v| v.as_array()) {
        for block in content {
            let Some(bobj) = block.as_object() else {
                continue;
            };
            match bobj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text" => {
                    if let Some(text) = bobj.get("text").and_then(|v| v.as_str()) {
                        message.parts.push(Part::Text {
                            text: text.to_string(),
                        });
                    }
                }
                "thinking" => {
                    if let Some(thinking) = bobj.get("thinking").and_then(|v| v.as_str()) {
                        message.parts.push(Part::Thinking {
                            text: thinking.to_string(),
                            signature: bobj
                                .get("signature")
                                .and_then(|v| v.as_str())
                                .filter(|s| !s.is_empty())
                                .map(|s| s.to_string()),
                        });
                    }
                }
                "tool_use" => {
                    message.parts.push(Part::ToolCall {
                        call_id: bobj
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        name: bobj
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        arguments: serde_json::to_string(bobj.get("input").unwrap_or(&Value::Null))
                            .unwrap_or_else(|_| "{}".to_string()),
                    });
                }
                _ => {}
            }
        }
    }

    let finish_reason = obj
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(FinishReason::from_anthropic);

    let usage = obj.get("usage").and_then(|v| v.as_object()).map(|u| Usage {
        input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        cache_read_input_tokens: u
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_input_tokens: u
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_ttl: None,
        reasoning_tokens: 0,
    });

    Ok(GatewayResponse {
        id: obj
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("msg")
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
    if let Some(obj) = v.as_object() {
        match obj.get("type").and_then(|x| x.as_str()) {
            Some("auto") => return ToolChoice::Mode("auto".to_string()),
            Some("any") => return ToolChoice::Mode("required".to_string()),
            Some("none") => return ToolChoice::Mode("none".to_string()),
            Some("tool") => {
                if let Some(name) = obj.get("name").and_then(|x| x.as_str()) {
                    return ToolChoice::Function(name.to_string());
                }
            }
            _ => {}
        }
    }
    if let Some(s) = v.as_str() {
        return ToolChoice::Mode(s.to_string());
    }
    ToolChoice::Mode("auto".to_string())
}

fn decode_image_block(bobj: &serde_json::Map<String, Value>) -> Option<Part> {
    let source = bobj.get("source").and_then(|v| v.as_object())?;
    match source.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "url" => source.get("url").and_then(|v| v.as_str()).map(|url| Part::Image {
            url: url.to_string(),
            detail: None,
        }),
        "base64" => {
            let media_type = source
                .get("media_type")
                .and_then(|v| v.as_str())
                .unwrap_or("image/png");
            let data = source.get("data").and_then(|v| v.as_str())?;
            Some(Part::Image {
                url: format!("data:{media_type};base64,{data}"),
                detail: None,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_text_request() {
        let body = json!({
            "model": "combo:main",
            "system": "be brief",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
            "stream": true,
            "metadata": {"user_id": "conv-1"}
        });
        let req = decode_request(&body).expect("decode");
        assert_eq!(req.model, "combo:main");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.max_output_tokens, Some(16));
        assert_eq!(req.stream, Some(true));
        assert!(req.metadata.is_some());
    }

    #[test]
    fn splits_tool_results_into_tool_messages() {
        let body = json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "c1", "name": "get_weather", "input": {"city": "SF"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "c1", "content": "sunny"}
                ]}
            ]
        });
        let req = decode_request(&body).expect("decode");
        assert_eq!(req.messages.len(), 2);
        assert!(matches!(req.messages[0].parts[0], Part::ToolCall { .. }));
        assert_eq!(req.messages[1].role, Role::Tool);
        match &req.messages[1].parts[0] {
            Part::ToolResult {
                call_id, content, ..
            } => {
                assert_eq!(call_id, "c1");
                assert_eq!(content, "sunny");
            }
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[test]
    fn missing_model_is_an_error() {
        let body = json!({"messages": []});
        assert!(decode_request(&body).is_err());
    }

    #[test]
    fn decodes_response_with_tool_use() {
        let body = json!({
            "id": "msg_1",
            "model": "claude",
            "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "c9", "name": "f", "input": {"a": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        });
        let resp = decode_response(&body).expect("decode");
        assert_eq!(resp.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(resp.usage.as_ref().unwrap().input_tokens, 10);
        assert!(matches!(resp.message.parts[1], Part::ToolCall { .. }));
    }
}
