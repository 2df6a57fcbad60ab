use crate::wire::encode::merge_extra;
use crate::wire::{
    FinishReason, GatewayRequest, GatewayResponse, Message, Part, Role, ToolChoice, ToolDefinition,
};
use serde_json::{Value, json};

pub fn encode_request(req: &GatewayRequest, upstream_model: &str, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    for message in &req.messages {
        messages.extend(encode_message(message));
    }

    let mut body = json!({
        "model": upstream_model,
        "messages": messages,
        "stream": stream,
    });
    let obj = body.as_object_mut().expect("chat request object");

    if let Some(max_tokens) = req.max_output_tokens {
        obj.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    if let Some(temp) = req.temperature {
        obj.insert("temperature".to_string(), Value::from(temp));
    }
    if let Some(top_p) = req.top_p {
        obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(effort) = &req.reasoning_effort {
        obj.insert(
            "reasoning_effort".to_string(),
            Value::String(effort.clone()),
        );
    }
    if let Some(tools) = &req.tools {
        if !tools.is_empty() {
            obj.insert("tools".to_string(), Value::Array(encode_tools(tools)));
            obj.insert(
                "tool_choice".to_string(),
                req.tool_choice
                    .as_ref()
                    .map(encode_tool_choice)
                    .unwrap_or_else(|| Value::String("auto".to_string())),
            );
        }
    }
    if let Some(metadata) = &req.metadata {
        obj.insert("metadata".to_string(), metadata.clone());
    }
    if let Some(thinking) = &req.thinking {
        obj.insert("thinking".to_string(), thinking.clone());
    }
    merge_extra(obj, &req.extra);
    body
}

pub fn encode_response(resp: &GatewayResponse, model: &str) -> Value {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for part in &resp.message.parts {
        match part {
            Part::Text { text: t } => text.push_str(t),
            Part::Thinking { text: t, .. } => reasoning.push_str(t),
            Part::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                tool_calls.push(json!({
                    "id": call_id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments }
                }));
            }
            Part::Image { .. } | Part::ToolResult { .. } => {}
        }
    }

    let mut message = json!({ "role": "assistant", "content": text });
    if !reasoning.is_empty() {
        message["reasoning_content"] = Value::String(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let finish_reason = resp
        .finish_reason
        .as_ref()
        .unwrap_or(&FinishReason::Stop)
        .as_chat()
        .to_string();
    let (prompt_tokens, completion_tokens) = match &resp.usage {
        Some(u) => (u.input_tokens, u.output_tokens),
        None => (0, 0),
    };

    json!({
        "id": resp.id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

fn encode_message(message: &Message) -> Vec<Value> {
    match message.role {
        Role::Tool => {
            let mut out = Vec::new();
            for part in &message.parts {
                if let Part::ToolResult {
                    call_id, content, ..
                } = part
                {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": call_id,
                        "content": content
                    }));
                }
            }
            out
        }
        role => {
            let role_str = match role {
                Role::System => "system",
                Role::Developer => "developer",
                Role::Assistant => "assistant",
                _ => "user",
            };
            let mut text = String::new();
            let mut image_blocks: Vec<Value> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();
            for part in &message.parts {
                match part {
                    Part::Text { text: t } => text.push_str(t),
                    Part::Thinking { .. } => {}
                    Part::Image { url, detail } => {
                        let mut image_url = json!({ "url": url });
                        if let Some(detail) = detail {
                            image_url["detail"] = Value::String(detail.clone());
                        }
                        image_blocks.push(json!({ "type": "image_url", "image_url": image_url }));
                    }
                    Part::ToolCall {
                        call_id,
                        name,
                        arguments,
                    } => tool_calls.push(json!({
                        "id": call_id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments }
                    })),
                    Part::ToolResult { .. } => {}
                }
            }

            let content: Value = if image_blocks.is_empty() {
                Value::String(text)
            } else {
                let mut blocks = Vec::new();
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                blocks.extend(image_blocks);
                Value::Array(blocks)
            };

            let mut msg = json!({ "role": role_str, "content": content });
            if !tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(tool_calls);
                // tool-call-only assistant turns carry a null content
                if msg["content"] == Value::String(String::new()) {
                    msg["content"] = Value::Null;
                }
            }
            vec![msg]
        }
    }
}

fn encode_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }
            })
        })
        .collect()
}

fn encode_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Mode(mode) => Value::String(mode.clone()),
        ToolChoice::Function(name) => json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode;
    use serde_json::json;

    #[test]
    fn anthropic_request_converts_to_chat_shape() {
        let messages_req = json!({
            "model": "combo:x",
            "system": "be brief",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "c1", "name": "f", "input": {"a": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "c1", "content": "42"}
                ]}
            ],
            "tools": [{"name": "f", "description": "d", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "tool", "name": "f"},
            "max_tokens": 16
        });
        let req = decode::anthropic::decode_request(&messages_req).expect("decode");
        let body = encode_request(&req, "gpt-4o-mini", false);

        assert_eq!(body["model"], "gpt-4o-mini");
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["content"], "hi");
        assert_eq!(msgs[2]["tool_calls"][0]["function"]["name"], "f");
        assert_eq!(
            msgs[2]["tool_calls"][0]["function"]["arguments"],
            "{\"a\":1}"
        );
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["tool_call_id"], "c1");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["tool_choice"]["function"]["name"], "f");
        assert_eq!(body["max_tokens"], 16);
    }

    #[test]
    fn round_trip_preserves_text_conversation() {
        let original = json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "s"},
                {"role": "user", "content": "q1"},
                {"role": "assistant", "content": "a1"},
                {"role": "user", "content": "q2"}
            ]
        });
        // chat -> hub -> anthropic -> hub -> chat
        let hub = decode::openai_chat::decode_request(&original).expect("decode chat");
        let anthropic = crate::wire::encode::anthropic::encode_request(&hub, "m", false);
        let hub2 = decode::anthropic::decode_request(&anthropic).expect("decode anthropic");
        let chat = encode_request(&hub2, "m", false);

        let roles: Vec<&str> = chat["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        let texts: Vec<String> = chat["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| match &m["content"] {
                Value::String(s) => s.clone(),
                Value::Array(blocks) => blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<String>(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(texts, vec!["s", "q1", "a1", "q2"]);
    }
}
