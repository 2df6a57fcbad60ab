use crate::wire::encode::merge_extra;
use crate::wire::{
    GatewayRequest, GatewayResponse, Message, Part, Role, ToolChoice, ToolDefinition,
    map_reasoning_effort,
};
use serde_json::{Value, json};

pub fn encode_request(req: &GatewayRequest, upstream_model: &str, stream: bool) -> Value {
    let mut instructions = String::new();
    let mut input: Vec<Value> = Vec::new();

    for message in &req.messages {
        match message.role {
            Role::System | Role::Developer if instructions.is_empty() => {
                instructions = crate::wire::text_of(&message.parts);
            }
            Role::System | Role::Developer => {
                // further system turns stay in the input list
                if let Some(item) = encode_message_item(message, "system") {
                    input.push(item);
                }
            }
            Role::Tool => {
                for part in &message.parts {
                    if let Part::ToolResult {
                        call_id, content, ..
                    } = part
                    {
                        input.push(json!({
                            "type": "function_call_output",
                            "call_id": call_id,
                            "output": content
                        }));
                    }
                }
            }
            Role::Assistant => {
                if let Some(item) = encode_message_item(message, "assistant") {
                    input.push(item);
                }
                for part in &message.parts {
                    if let Part::ToolCall {
                        call_id,
                        name,
                        arguments,
                    } = part
                    {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call_id,
                            "name": name,
                            "arguments": arguments
                        }));
                    }
                }
            }
            Role::User => {
                if let Some(item) = encode_message_item(message, "user") {
                    input.push(item);
                }
            }
        }
    }

    let mut body = json!({
        "model": upstream_model,
        "input": input,
        "instructions": instructions,
        "stream": stream,
    });
    let obj = body.as_object_mut().expect("responses request object");

    if let Some(max_tokens) = req.max_output_tokens {
        obj.insert("max_output_tokens".to_string(), Value::from(max_tokens));
    }
    if let Some(temp) = req.temperature {
        obj.insert("temperature".to_string(), Value::from(temp));
    }
    if let Some(top_p) = req.top_p {
        obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(effort) = &req.reasoning_effort {
        obj.insert(
            "reasoning".to_string(),
            json!({ "effort": map_reasoning_effort(effort) }),
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
    merge_extra(obj, &req.extra);
    // session fields are never forwarded upstream
    obj.remove("previous_response_id");
    obj.remove("prompt_cache_retention");
    obj.remove("safety_identifier");
    body
}

pub fn encode_response(resp: &GatewayResponse, model: &str) -> Value {
    let mut output: Vec<Value> = Vec::new();
    let mut text_blocks: Vec<Value> = Vec::new();

    for part in &resp.message.parts {
        match part {
            Part::Thinking { text, .. } => {
                output.push(json!({
                    "type": "reasoning",
                    "summary": [{ "type": "summary_text", "text": text }]
                }));
            }
            Part::Text { text } => {
                text_blocks.push(json!({
                    "type": "output_text",
                    "text": text,
                    "annotations": []
                }));
            }
            Part::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                output.push(json!({
                    "type": "function_call",
                    "call_id": call_id,
                    "name": name,
                    "arguments": arguments
                }));
            }
            Part::Image { .. } | Part::ToolResult { .. } => {}
        }
    }
    output.push(json!({
        "type": "message",
        "role": "assistant",
        "content": text_blocks
    }));

    let (input_tokens, output_tokens) = match &resp.usage {
        Some(u) => (u.input_tokens, u.output_tokens),
        None => (0, 0),
    };

    json!({
        "id": resp.id,
        "object": "response",
        "created_at": chrono::Utc::now().timestamp(),
        "model": model,
        "status": "completed",
        "output": output,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens
        }
    })
}

fn encode_message_item(message: &Message, role: &str) -> Option<Value> {
    let text_type = if role == "assistant" {
        "output_text"
    } else {
        "input_text"
    };
    let mut content: Vec<Value> = Vec::new();
    for part in &message.parts {
        match part {
            Part::Text { text } => {
                content.push(json!({ "type": text_type, "text": text }));
            }
            Part::Image { url, detail } => {
                let mut block = json!({ "type": "input_image", "image_url": url });
                if let Some(detail) = detail {
                    block["detail"] = Value::String(detail.clone());
                }
                content.push(block);
            }
            _ => {}
        }
    }
    if content.is_empty() {
        return None;
    }
    Some(json!({ "type": "message", "role": role, "content": content }))
}

fn encode_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters
            })
        })
        .collect()
}

fn encode_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Mode(mode) => Value::String(mode.clone()),
        ToolChoice::Function(name) => json!({ "type": "function", "name": name }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode;
    use serde_json::json;

    #[test]
    fn chat_request_converts_to_responses_shape() {
        let chat = json!({
            "model": "combo:x",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "sunny"}
            ],
            "max_tokens": 32,
            "reasoning_effort": "minimal",
            "previous_response_id": "resp_0"
        });
        let req = decode::openai_chat::decode_request(&chat).expect("decode");
        let body = encode_request(&req, "gpt-5", true);

        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["instructions"], "be brief");
        assert_eq!(body["max_output_tokens"], 32);
        assert_eq!(body["reasoning"]["effort"], "low");
        assert_eq!(body["stream"], true);
        assert!(body.get("previous_response_id").is_none());
        assert!(body.get("max_tokens").is_none());

        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0]["type"], "message");
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "c1");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "sunny");
    }

    #[test]
    fn image_blocks_map_to_input_image() {
        let chat = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "https://x/img.png"}}
            ]}]
        });
        let req = decode::openai_chat::decode_request(&chat).expect("decode");
        let body = encode_request(&req, "m", false);
        let content = body["input"][0]["content"].as_array().unwrap();
        assert_eq!(content[1]["type"], "input_image");
        assert_eq!(content[1]["image_url"], "https://x/img.png");
    }

    #[test]
    fn response_encodes_output_items() {
        let resp = decode::openai_chat::decode_response(&json!({
            "id": "chatcmpl-1",
            "model": "m",
            "choices": [{"message": {"role": "assistant", "content": "hi",
                "tool_calls": [{"id": "c1", "function": {"name": "f", "arguments": "{}"}}]},
                "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 3}
        }))
        .expect("decode");
        let body = encode_response(&resp, "m");
        assert_eq!(body["status"], "completed");
        let output = body["output"].as_array().unwrap();
        assert_eq!(output[0]["type"], "function_call");
        assert_eq!(output.last().unwrap()["type"], "message");
        assert_eq!(body["usage"]["total_tokens"], 5);
    }
}
