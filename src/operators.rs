use crate::backends::Backend;
use crate::config::OperatorEndpoint;
use crate::upstream::{self, UpstreamCallError, UpstreamErrorKind, network_error_from_reqwest};
use crate::wire::{self, GatewayRequest, Part, Role};
use async_trait::async_trait;
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Endpoint settings handed to a strategy, already merged from the backend
/// row and the operator config.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub upstream_model: String,
    pub api_key: String,
    pub base_url: String,
    pub stream: bool,
}

/// What a strategy hands back: a buffered JSON body or the raw upstream
/// response for streaming, plus nothing else — the orchestrator owns reply
/// translation.
pub struct OperatorReply {
    pub status: StatusCode,
    pub body: Option<Value>,
    pub stream: Option<reqwest::Response>,
}

/// A bespoke forwarding strategy for one operator. Each strategy owns its URL
/// shape and payload normalization; `reply_interface` names the wire format
/// its replies come back in so the generic translators can take over.
#[async_trait]
pub trait OperatorStrategy: Send + Sync {
    fn reply_interface(&self) -> &'static str;

    async fn execute(
        &self,
        client: &reqwest::Client,
        req: &GatewayRequest,
        opts: &ExecuteOptions,
    ) -> Result<OperatorReply, UpstreamCallError>;
}

pub struct OperatorRegistry {
    strategies: HashMap<String, Arc<dyn OperatorStrategy>>,
}

impl OperatorRegistry {
    pub fn get(&self, operator_id: &str) -> Option<Arc<dyn OperatorStrategy>> {
        self.strategies.get(operator_id.trim()).cloned()
    }
}

/// Build the strategy registry. Constructed explicitly at startup so tests
/// can substitute their own.
pub fn registry() -> OperatorRegistry {
    let mut strategies: HashMap<String, Arc<dyn OperatorStrategy>> = HashMap::new();
    strategies.insert("codex".to_string(), Arc::new(CodexStrategy));
    let passthrough: Arc<dyn OperatorStrategy> = Arc::new(MessagesPassthroughStrategy);
    for id in ["minimax", "glm", "kimi", "proxy"] {
        strategies.insert(id.to_string(), passthrough.clone());
    }
    strategies.insert(
        "iflow".to_string(),
        Arc::new(ChatForwardStrategy {
            default_base_url: "https://apis.iflow.cn",
        }),
    );
    strategies.insert(
        "newapi".to_string(),
        Arc::new(ChatForwardStrategy {
            default_base_url: "https://api.newapi.pro",
        }),
    );
    OperatorRegistry { strategies }
}

/// Merge the operator's endpoint config under the backend row: backend fields
/// always win, operator config only fills blanks.
pub fn resolve_endpoint(
    backend: &Backend,
    operator: Option<&OperatorEndpoint>,
) -> (String, String, String) {
    let mut interface = backend.interface.trim().to_string();
    let mut base_url = backend.base_url.trim().to_string();
    let mut api_key = backend.api_key.trim().to_string();
    if let Some(op) = operator {
        if interface.is_empty() {
            interface = op.interface.trim().to_string();
        }
        if base_url.is_empty() {
            base_url = op.base_url.trim().to_string();
        }
        if api_key.is_empty() {
            api_key = op.api_key.trim().to_string();
        }
    }
    (interface, base_url, api_key)
}

/// Codex upstream: Responses API with flattened plain-text input items and
/// instructions lifted out of the system turns. The upstream only speaks SSE,
/// so buffered requests collect the stream down to its terminal event.
struct CodexStrategy;

#[async_trait]
impl OperatorStrategy for CodexStrategy {
    fn reply_interface(&self) -> &'static str {
        "openai_responses"
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        req: &GatewayRequest,
        opts: &ExecuteOptions,
    ) -> Result<OperatorReply, UpstreamCallError> {
        let body = codex_request_body(req, &opts.upstream_model);
        let base = if opts.base_url.trim().is_empty() {
            upstream::DEFAULT_RESPONSES_BASE_URL
        } else {
            opts.base_url.trim()
        };
        let url = format!("{}/v1/responses", base.trim_end_matches('/'));
        tracing::debug!(url = %url, stream = opts.stream, "codex dispatch");

        let mut request = client
            .post(&url)
            .timeout(upstream::UPSTREAM_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        if !opts.api_key.trim().is_empty() {
            request = request.header("Authorization", format!("Bearer {}", opts.api_key.trim()));
        }
        let resp = request
            .send()
            .await
            .map_err(|err| network_error_from_reqwest(&err))?;
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        if !status.is_success() {
            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            return Err(UpstreamCallError::http(status, body));
        }
        if opts.stream {
            return Ok(OperatorReply {
                status,
                body: None,
                stream: Some(resp),
            });
        }
        let completed = collect_responses_terminal_event(resp).await?;
        Ok(OperatorReply {
            status,
            body: Some(completed),
            stream: None,
        })
    }
}

fn codex_request_body(req: &GatewayRequest, upstream_model: &str) -> Value {
    let mut instructions = String::new();
    let mut input: Vec<Value> = Vec::new();
    for message in &req.messages {
        match message.role {
            Role::System | Role::Developer => {
                let text = wire::text_of(&message.parts);
                if instructions.is_empty() {
                    instructions = text;
                } else if !text.is_empty() {
                    instructions.push_str("\n\n");
                    instructions.push_str(&text);
                }
            }
            _ => {
                let role = if message.role == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                };
                let text = flatten_parts(&message.parts);
                if text.is_empty() {
                    continue;
                }
                input.push(json!({ "role": role, "content": text }));
            }
        }
    }
    if instructions.is_empty() {
        instructions = "You are a helpful assistant.".to_string();
    }
    if input.is_empty() {
        input.push(json!({ "role": "user", "content": "" }));
    }

    let mut tools: Vec<Value> = Vec::new();
    if let Some(defs) = &req.tools {
        for tool in defs {
            tools.push(json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }
            }));
        }
    }

    let mut body = json!({
        "model": upstream_model,
        "instructions": instructions,
        "input": input,
        "stream": true,
        "store": false,
        "tools": tools,
        "tool_choice": "auto"
    });
    if let Some(effort) = &req.reasoning_effort {
        body["reasoning"] = json!({ "effort": wire::map_reasoning_effort(effort) });
    }
    body
}

/// Flatten message parts to plain text, rendering tool traffic inline so the
/// upstream still sees the transcript.
fn flatten_parts(parts: &[Part]) -> String {
    let mut out: Vec<String> = Vec::new();
    for part in parts {
        match part {
            Part::Text { text } => {
                if !text.is_empty() {
                    out.push(text.clone());
                }
            }
            Part::ToolCall {
                name, arguments, ..
            } => {
                out.push(format!("[Tool Call: {name}({arguments})]"));
            }
            Part::ToolResult {
                call_id,
                is_error,
                content,
            } => {
                let prefix = if *is_error { "Tool Error" } else { "Tool Result" };
                out.push(format!("[{prefix} ({call_id})]: {content}"));
            }
            Part::Thinking { .. } | Part::Image { .. } => {}
        }
    }
    out.join("\n")
}

/// Scan an SSE body for the terminal Responses event and return its
/// `response` object; `response.failed`/`error` events surface as upstream
/// errors carrying the raw event body.
async fn collect_responses_terminal_event(
    resp: reqwest::Response,
) -> Result<Value, UpstreamCallError> {
    let mut stream = resp.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let ev = ev.map_err(|err| UpstreamCallError::network(err.to_string()))?;
        let data = ev.data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        match value.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "response.completed" | "response.done" => {
                return Ok(value.get("response").cloned().unwrap_or(value));
            }
            "response.failed" | "error" => {
                return Err(UpstreamCallError {
                    kind: UpstreamErrorKind::Http,
                    status: Some(StatusCode::BAD_GATEWAY),
                    message: "upstream stream error event".to_string(),
                    body: data.as_bytes().to_vec(),
                });
            }
            _ => {}
        }
    }
    Err(UpstreamCallError::network(
        "responses stream ended without a terminal event",
    ))
}

/// Anthropic-native upstreams (minimax, glm, kimi): plain `/v1/messages`
/// forward with the key swapped and the model replaced. Some of these return
/// 200 bodies that carry an error object; those are flipped to a 500.
struct MessagesPassthroughStrategy;

#[async_trait]
impl OperatorStrategy for MessagesPassthroughStrategy {
    fn reply_interface(&self) -> &'static str {
        "anthropic"
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        req: &GatewayRequest,
        opts: &ExecuteOptions,
    ) -> Result<OperatorReply, UpstreamCallError> {
        let base = opts.base_url.trim();
        if base.is_empty() {
            return Err(UpstreamCallError::network("operator base_url required"));
        }
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let body =
            crate::wire::encode::anthropic::encode_request(req, &opts.upstream_model, opts.stream);
        tracing::debug!(url = %url, stream = opts.stream, "messages passthrough dispatch");

        let mut request = client
            .post(&url)
            .timeout(upstream::UPSTREAM_TIMEOUT)
            .header("Content-Type", "application/json")
            .json(&body);
        if opts.stream {
            request = request.header("Accept", "text/event-stream");
        }
        if !opts.api_key.trim().is_empty() {
            request = request.header("Authorization", format!("Bearer {}", opts.api_key.trim()));
        }
        let resp = request
            .send()
            .await
            .map_err(|err| network_error_from_reqwest(&err))?;
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        if !status.is_success() {
            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            return Err(UpstreamCallError::http(status, body));
        }
        if opts.stream {
            return Ok(OperatorReply {
                status,
                body: None,
                stream: Some(resp),
            });
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| network_error_from_reqwest(&err))?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|err| UpstreamCallError {
            kind: UpstreamErrorKind::Http,
            status: Some(status),
            message: format!("invalid upstream json: {err}"),
            body: bytes.to_vec(),
        })?;
        let has_error = value.get("error").map(|e| !e.is_null()).unwrap_or(false)
            || value.get("type").and_then(|v| v.as_str()) == Some("error");
        if has_error {
            return Err(UpstreamCallError::http(
                StatusCode::INTERNAL_SERVER_ERROR,
                bytes.to_vec(),
            ));
        }
        Ok(OperatorReply {
            status,
            body: Some(value),
            stream: None,
        })
    }
}

/// OpenAI-compatible upstreams (iflow, newapi): chat-completions forward with
/// the operator's default host when the backend leaves the base blank.
struct ChatForwardStrategy {
    default_base_url: &'static str,
}

#[async_trait]
impl OperatorStrategy for ChatForwardStrategy {
    fn reply_interface(&self) -> &'static str {
        "openai"
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        req: &GatewayRequest,
        opts: &ExecuteOptions,
    ) -> Result<OperatorReply, UpstreamCallError> {
        let base = if opts.base_url.trim().is_empty() {
            self.default_base_url
        } else {
            opts.base_url.trim()
        };
        let body =
            crate::wire::encode::openai_chat::encode_request(req, &opts.upstream_model, opts.stream);
        let resp = upstream::call(client, "openai", base, &opts.api_key, opts.stream, &body).await?;
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        if opts.stream {
            return Ok(OperatorReply {
                status,
                body: None,
                stream: Some(resp),
            });
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| network_error_from_reqwest(&err))?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|err| UpstreamCallError {
            kind: UpstreamErrorKind::Http,
            status: Some(status),
            message: format!("invalid upstream json: {err}"),
            body: bytes.to_vec(),
        })?;
        Ok(OperatorReply {
            status,
            body: Some(value),
            stream: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Message;

    fn backend(interface: &str, base_url: &str, api_key: &str) -> Backend {
        Backend {
            id: "b".to_string(),
            name: String::new(),
            provider: String::new(),
            interface: interface.to_string(),
            upstream_id: String::new(),
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
            description: String::new(),
            enabled: true,
            forward_metadata: false,
            forward_thinking: false,
            max_qps: 0.0,
            operator_id: "codex".to_string(),
            response_format: String::new(),
            input_price: 0.0,
            output_price: 0.0,
        }
    }

    #[test]
    fn backend_fields_win_over_operator_config() {
        let op = OperatorEndpoint {
            base_url: "https://operator".to_string(),
            api_key: "op-key".to_string(),
            interface: "openai_responses".to_string(),
            enabled: true,
            ..Default::default()
        };
        let (interface, base_url, api_key) =
            resolve_endpoint(&backend("anthropic", "https://model", "model-key"), Some(&op));
        assert_eq!(interface, "anthropic");
        assert_eq!(base_url, "https://model");
        assert_eq!(api_key, "model-key");

        let (interface, base_url, api_key) =
            resolve_endpoint(&backend("", "", ""), Some(&op));
        assert_eq!(interface, "openai_responses");
        assert_eq!(base_url, "https://operator");
        assert_eq!(api_key, "op-key");
    }

    #[test]
    fn registry_covers_known_operators() {
        let registry = registry();
        for id in ["codex", "minimax", "glm", "kimi", "iflow", "newapi"] {
            assert!(registry.get(id).is_some(), "missing strategy {id}");
        }
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn codex_body_flattens_tool_traffic() {
        let mut req = GatewayRequest {
            model: "combo:x".to_string(),
            ..Default::default()
        };
        req.messages.push(Message::text(Role::System, "sys"));
        let mut assistant = Message::new(Role::Assistant);
        assistant.parts.push(Part::ToolCall {
            call_id: "c1".to_string(),
            name: "f".to_string(),
            arguments: "{\"a\":1}".to_string(),
        });
        req.messages.push(assistant);
        let mut tool = Message::new(Role::Tool);
        tool.parts.push(Part::ToolResult {
            call_id: "c1".to_string(),
            is_error: false,
            content: "42".to_string(),
        });
        req.messages.push(tool);

        let body = codex_request_body(&req, "gpt-5");
        assert_eq!(body["instructions"], "sys");
        assert_eq!(body["store"], false);
        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0]["content"], "[Tool Call: f({\"a\":1})]");
        assert_eq!(input[1]["content"], "[Tool Result (c1)]: 42");
    }
}
