use crate::wire::encode::{merge_extra, split_data_url};
use crate::wire::{
    FinishReason, GatewayRequest, GatewayResponse, Message, Part, Role, ToolChoice, ToolDefinition,
};
use serde_json::{Value, json};

pub fn encode_request(req: &GatewayRequest, upstream_model: &str, stream: bool) -> Value {
    let mut system_blocks: Vec<Value> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in &req.messages {
        match message.role {
            Role::System | Role::Developer => {
                let text = crate::wire::text_of(&message.parts);
                if !text.is_empty() {
                    system_blocks.push(json!({ "type": "text", "text": text }));
                }
            }
            Role::Tool => {
                if let Some(item) = encode_tool_result_message(message) {
                    messages.push(item);
                }
            }
            Role::User | Role::Assistant => {
                if let Some(item) = encode_regular_message(message) {
                    messages.push(item);
                }
            }
        }
    }

    let mut body = json!({
        "model": upstream_model,
        "messages": messages,
        "max_tokens": req.max_output_tokens.unwrap_or(4096),
        "stream": stream,
    });
    let obj = body.as_object_mut().expect("anthropic request object");

    if !system_blocks.is_empty() {
        obj.insert("system".to_string(), Value::Array(system_blocks));
    }
    if let Some(temp) = req.temperature {
        obj.insert("temperature".to_string(), Value::from(temp));
    }
    if let Some(top_p) = req.top_p {
        obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(tools) = &req.tools {
        obj.insert("tools".to_string(), Value::Array(encode_tools(tools)));
    }
    if let Some(choice) = &req.tool_choice {
        obj.insert("tool_choice".to_string(), encode_tool_choice(choice));
    }
    if let Some(thinking) = &req.thinking {
        obj.insert("thinking".to_string(), thinking.clone());
    } else if let Some(effort) = &req.reasoning_effort {
        obj.insert(
            "thinking".to_string(),
            json!({ "type": "enabled", "budget_tokens": effort_to_budget(effort) }),
        );
    }
    if let Some(metadata) = &req.metadata {
        obj.insert("metadata".to_string(), metadata.clone());
    }
    merge_extra(obj, &req.extra);
    body
}

pub fn encode_response(resp: &GatewayResponse, model: &str) -> Value {
    let mut content = Vec::new();
    for part in &resp.message.parts {
        match part {
            Part::Thinking { text, signature } => {
                let mut block = json!({ "type": "thinking", "thinking": text });
                if let Some(sig) = signature {
                    block["signature"] = Value::String(sig.clone());
                }
                content.push(block);
            }
            Part::Text { text } => content.push(json!({ "type": "text", "text": text })),
            Part::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                let input = serde_json::from_str::<Value>(arguments)
                    .unwrap_or_else(|_| json!({ "_raw": arguments }));
                content.push(json!({
                    "type": "tool_use",
                    "id": call_id,
                    "name": name,
                    "input": input
                }));
            }
            Part::Image { url, .. } => content.push(encode_image_block(url, None)),
            Part::ToolResult { .. } => {}
        }
    }
    // a reply always carries at least one content block
    if content.is_empty() {
        content.push(json!({ "type": "text", "text": "" }));
    }

    let stop_reason = resp
        .finish_reason
        .as_ref()
        .unwrap_or(&FinishReason::Stop)
        .as_anthropic()
        .to_string();
    let (input_tokens, output_tokens, cache_read) = match &resp.usage {
        Some(u) => (u.input_tokens, u.output_tokens, u.cache_read_input_tokens),
        None => (0, 0, 0),
    };

    json!({
        "id": resp.id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "cache_read_input_tokens": cache_read
        }
    })
}

fn encode_regular_message(message: &Message) -> Option<Value> {
    let role = match message.role {
        Role::Assistant => "assistant",
        _ => "user",
    };
    let mut content = Vec::new();
    for part in &message.parts {
        match part {
            Part::Text { text } => content.push(json!({ "type": "text", "text": text })),
            Part::Thinking { text, signature } => {
                let mut block = json!({ "type": "thinking", "thinking": text });
                if let Some(sig) = signature {
                    block["signature"] = Value::String(sig.clone());
                }
                content.push(block);
            }
            Part::Image { url, detail: _ } => content.push(encode_image_block(url, None)),
            Part::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                let input = serde_json::from_str::<Value>(arguments)
                    .unwrap_or_else(|_| json!({ "_raw": arguments }));
                content.push(json!({
                    "type": "tool_use",
                    "id": call_id,
                    "name": name,
                    "input": input
                }));
            }
            Part::ToolResult { .. } => {}
        }
    }
    if content.is_empty() {
        return None;
    }
    Some(json!({ "role": role, "content": content }))
}

fn encode_tool_result_message(message: &Message) -> Option<Value> {
    let (call_id, is_error, text) = message.parts.iter().find_map(|part| match part {
        Part::ToolResult {
            call_id,
            is_error,
            content,
        } => Some((call_id.clone(), *is_error, content.clone())),
        _ => None,
    })?;
    Some(json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": call_id,
            "is_error": is_error,
            "content": [{ "type": "text", "text": text }]
        }]
    }))
}

fn encode_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.parameters.clone().unwrap_or(json!({
                    "type": "object",
                    "properties": {},
                    "additionalProperties": true
                }))
            })
        })
        .collect()
}

fn encode_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "required" => json!({ "type": "any" }),
            "none" => json!({ "type": "none" }),
            _ => json!({ "type": "auto" }),
        },
        ToolChoice::Function(name) => json!({ "type": "tool", "name": name }),
    }
}

fn encode_image_block(url: &str, _detail: Option<&str>) -> Value {
    if let Some((media_type, data)) = split_data_url(url) {
        json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data }
        })
    } else {
        json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        })
    }
}

fn effort_to_budget(effort: &str) -> u32 {
    match effort {
        "minimal" | "low" => 1024,
        "high" | "xhigh" => 16384,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode;
    use serde_json::json;

    #[test]
    fn chat_request_converts_to_messages_shape() {
        let chat = json!({
            "model": "combo:x",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "function": {"name": "f", "arguments": "{\"a\":1}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "done"}
            ],
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {"type": "object"}}}]
        });
        let req = decode::openai_chat::decode_request(&chat).expect("decode");
        let body = encode_request(&req, "claude-x", false);

        assert_eq!(body["model"], "claude-x");
        assert_eq!(body["stream"], false);
        assert_eq!(body["system"][0]["text"], "sys");
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1]["content"][0]["type"], "tool_use");
        assert_eq!(msgs[1]["content"][0]["input"]["a"], 1);
        assert_eq!(msgs[2]["content"][0]["type"], "tool_result");
        assert_eq!(msgs[2]["content"][0]["tool_use_id"], "c1");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn response_never_has_empty_content() {
        let resp = GatewayResponse {
            id: "r1".to_string(),
            model: "m".to_string(),
            message: Message::new(Role::Assistant),
            finish_reason: Some(FinishReason::Stop),
            usage: None,
        };
        let body = encode_response(&resp, "m");
        assert_eq!(body["content"][0]["type"], "text");
        assert_eq!(body["content"][0]["text"], "");
        assert_eq!(body["stop_reason"], "end_turn");
    }
}
