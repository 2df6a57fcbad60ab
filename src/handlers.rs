use crate::accounting::{self, UsageRecorder};
use crate::app::AppState;
use crate::auth;
use crate::backend_state::QUARANTINE_TTL;
use crate::backends::Backend;
use crate::error::{
    AppError, anthropic_error_body, extract_upstream_error_message, openai_error_body,
};
use crate::operators::{self, ExecuteOptions, OperatorStrategy};
use crate::router;
use crate::sse;
use crate::streams;
use crate::upstream::{self, UpstreamCallError};
use crate::users::User;
use crate::wire::{self, GatewayRequest};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The three client-facing wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Anthropic,
    Chat,
    Responses,
}

impl Protocol {
    pub fn interface(&self) -> &'static str {
        match self {
            Protocol::Anthropic => "anthropic",
            Protocol::Chat => "openai",
            Protocol::Responses => "openai_responses",
        }
    }

    fn from_interface(raw: &str) -> Option<Protocol> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("anthropic") {
            Some(Protocol::Anthropic)
        } else if raw.eq_ignore_ascii_case("openai") || raw.eq_ignore_ascii_case("openai_compatible")
        {
            Some(Protocol::Chat)
        } else if raw.eq_ignore_ascii_case("openai_responses")
            || raw.eq_ignore_ascii_case("openai_response")
        {
            Some(Protocol::Responses)
        } else {
            None
        }
    }

    fn error_body(&self, status: StatusCode, message: &str) -> Value {
        match self {
            Protocol::Anthropic => anthropic_error_body(status, message),
            _ => openai_error_body(status, message),
        }
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Response {
        (status, axum::Json(self.error_body(status, message))).into_response()
    }

    fn app_error_response(&self, err: &AppError) -> Response {
        self.error_response(err.status, &err.message)
    }
}

pub async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_completion(state, headers, body, Protocol::Anthropic).await
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_completion(state, headers, body, Protocol::Chat).await
}

pub async fn create_responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_completion(state, headers, body, Protocol::Responses).await
}

/// Token counting happens upstream; this endpoint only keeps Anthropic SDKs
/// happy.
pub async fn count_tokens() -> Response {
    axum::Json(json!({ "input_tokens": 0 })).into_response()
}

pub async fn options_no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn healthz() -> Response {
    axum::Json(json!({ "status": "ok" })).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

enum Dispatched {
    Buffered(Value),
    Streaming(reqwest::Response),
}

async fn handle_completion(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
    protocol: Protocol,
) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return protocol.error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    let user = match auth::authenticate(&headers, &state.config.auth.api_key, &state.users).await {
        Ok(user) => user,
        Err(err) => return protocol.app_error_response(&err),
    };

    let mut req = match decode_request(protocol, &value) {
        Ok(req) => req,
        Err(message) => return protocol.error_response(StatusCode::BAD_REQUEST, &message),
    };

    let stream = req.stream.unwrap_or(false);
    let requested_id = req.model.clone();
    let conversation_id = router::metadata_user_id(&value);
    let input_text = match protocol {
        Protocol::Responses => router::responses_input_text(&value),
        _ => router::messages_input_text(&value),
    };

    let allow_fallback = protocol == Protocol::Responses;
    let route = match protocol {
        Protocol::Responses => {
            router::resolve_target(
                &state.backends,
                &state.backend_state,
                &requested_id,
                &conversation_id,
                &input_text,
                responses_candidate,
                allow_fallback,
            )
            .await
        }
        _ => {
            router::resolve_target(
                &state.backends,
                &state.backend_state,
                &requested_id,
                &conversation_id,
                &input_text,
                |_| true,
                allow_fallback,
            )
            .await
        }
    };
    let route = match route {
        Ok(route) => route,
        Err(err) => return protocol.app_error_response(&err),
    };
    let backend = route.backend;
    tracing::info!(
        backend = %backend.id,
        requested = %requested_id,
        used_cache = route.used_cache,
        stream,
        "request routed"
    );

    // operator strategy, when the backend is bound to one
    let mut strategy: Option<Arc<dyn OperatorStrategy>> = None;
    let mut operator_cfg = None;
    let operator_id = backend.operator_id.trim();
    if !operator_id.is_empty() {
        let Some(cfg) = state.config.operator(operator_id) else {
            return protocol.error_response(
                StatusCode::BAD_REQUEST,
                &format!("Operator not found: {operator_id}"),
            );
        };
        if !cfg.enabled {
            return protocol.error_response(
                StatusCode::BAD_REQUEST,
                &format!("Operator disabled: {operator_id}"),
            );
        }
        let Some(s) = state.operators.get(operator_id) else {
            return protocol.error_response(
                StatusCode::BAD_REQUEST,
                &format!("Operator strategy not registered: {operator_id}"),
            );
        };
        strategy = Some(s);
        operator_cfg = Some(cfg);
    }
    let (interface, base_url, api_key) = operators::resolve_endpoint(&backend, operator_cfg);

    // extended fields are forwarded only when the backend opts in
    if !backend.forward_metadata {
        req.metadata = None;
    }
    if !backend.forward_thinking {
        req.thinking = None;
        if protocol == Protocol::Anthropic {
            req.reasoning_effort = None;
        }
    }

    state.qps.wait(&backend.id, backend.max_qps).await;

    let upstream_model = backend.upstream_model().to_string();
    let (upstream_interface, dispatched) = match &strategy {
        Some(strategy) => {
            let opts = ExecuteOptions {
                upstream_model: upstream_model.clone(),
                api_key,
                base_url,
                stream,
            };
            let reply_interface = strategy.reply_interface();
            match strategy.execute(&state.http, &req, &opts).await {
                Ok(reply) => {
                    let dispatched = match (reply.body, reply.stream) {
                        (_, Some(resp)) => Dispatched::Streaming(resp),
                        (Some(body), None) => Dispatched::Buffered(body),
                        (None, None) => {
                            return failure_response(
                                &state,
                                protocol,
                                &backend,
                                user.as_ref(),
                                &conversation_id,
                                UpstreamCallError::network("operator returned no reply"),
                            )
                            .await;
                        }
                    };
                    (reply_interface, dispatched)
                }
                Err(err) => {
                    return failure_response(
                        &state,
                        protocol,
                        &backend,
                        user.as_ref(),
                        &conversation_id,
                        err,
                    )
                    .await;
                }
            }
        }
        None => {
            let iface = normalize_interface(&interface, &backend);
            let body = encode_for_interface(iface, &req, &upstream_model, stream);
            if stream {
                match upstream::call(&state.http, iface, &base_url, &api_key, true, &body).await {
                    Ok(resp) => (iface, Dispatched::Streaming(resp)),
                    Err(err) => {
                        return failure_response(
                            &state,
                            protocol,
                            &backend,
                            user.as_ref(),
                            &conversation_id,
                            err,
                        )
                        .await;
                    }
                }
            } else {
                match upstream::call_json(&state.http, iface, &base_url, &api_key, &body).await {
                    Ok(value) => (iface, Dispatched::Buffered(value)),
                    Err(err) => {
                        return failure_response(
                            &state,
                            protocol,
                            &backend,
                            user.as_ref(),
                            &conversation_id,
                            err,
                        )
                        .await;
                    }
                }
            }
        }
    };

    // client-visible reply format: the backend may override the entry format
    let reply_protocol = Protocol::from_interface(&backend.response_format).unwrap_or(protocol);

    match dispatched {
        Dispatched::Streaming(resp) => relay_stream(
            state,
            backend,
            user,
            upstream_interface,
            reply_protocol,
            requested_id,
            resp,
        ),
        Dispatched::Buffered(raw) => {
            let usage = accounting::extract_usage(&raw);
            accounting::settle(&state.users, user.as_ref(), &backend, usage.as_ref()).await;
            if upstream_interface == reply_protocol.interface() {
                return axum::Json(raw).into_response();
            }
            let decoded = match decode_response_from(upstream_interface, &raw) {
                Ok(resp) => resp,
                Err(message) => {
                    tracing::warn!(backend = %backend.id, "reply translation failed: {message}");
                    spawn_error_log(
                        &state,
                        &backend.id,
                        user.as_ref(),
                        502,
                        format!("reply translation failed: {message}"),
                    );
                    return protocol
                        .error_response(StatusCode::BAD_GATEWAY, "Failed to convert response");
                }
            };
            let body_out = encode_response_for(reply_protocol, &decoded, &requested_id);
            axum::Json(body_out).into_response()
        }
    }
}

/// Hand the upstream stream to the matching converter task and return the
/// client SSE response. Accounting settles exactly once when the relay task
/// finishes, whether the stream completed or the client went away.
fn relay_stream(
    state: AppState,
    backend: Backend,
    user: Option<User>,
    upstream_interface: &'static str,
    reply_protocol: Protocol,
    requested_id: String,
    resp: reqwest::Response,
) -> Response {
    let (tx, rx) = mpsc::channel(sse::CHANNEL_CAPACITY);
    let recorder = UsageRecorder::new();
    let recorder_task = recorder.clone();
    let state_task = state.clone();
    tokio::spawn(async move {
        let result = match (upstream_interface, reply_protocol) {
            ("openai", Protocol::Anthropic) => {
                streams::stream_chat_as_anthropic(&requested_id, resp, tx, recorder_task.clone())
                    .await
            }
            ("openai_responses", Protocol::Anthropic) => {
                streams::stream_responses_as_anthropic(
                    &requested_id,
                    resp,
                    tx,
                    recorder_task.clone(),
                )
                .await
            }
            ("anthropic", Protocol::Chat) => {
                streams::stream_anthropic_as_chat(&requested_id, resp, tx, recorder_task.clone())
                    .await
            }
            ("openai_responses", Protocol::Chat) => {
                streams::stream_responses_as_chat(&requested_id, resp, tx, recorder_task.clone())
                    .await
            }
            ("anthropic", Protocol::Responses) => {
                streams::stream_anthropic_as_responses(
                    &requested_id,
                    resp,
                    tx,
                    recorder_task.clone(),
                )
                .await
            }
            ("openai", Protocol::Responses) => {
                streams::stream_chat_as_responses(&requested_id, resp, tx, recorder_task.clone())
                    .await
            }
            _ => {
                crate::sse::proxy_sse(resp, tx, Some(recorder_task.clone())).await;
                Ok(())
            }
        };
        let usage = recorder_task.take().await;
        accounting::settle(&state_task.users, user.as_ref(), &backend, usage.as_ref()).await;
        if let Err(err) = result {
            tracing::warn!(backend = %backend.id, "stream relay failed: {}", err.message);
            spawn_error_log(
                &state_task,
                &backend.id,
                user.as_ref(),
                err.status.as_u16() as i64,
                err.message,
            );
        }
    });
    sse::sse_response(rx)
}

/// Failure policy for upstream errors: unpin the conversation, quarantine the
/// backend when the failure is transient, log it, and mirror the upstream
/// status in the client's envelope.
async fn failure_response(
    state: &AppState,
    protocol: Protocol,
    backend: &Backend,
    user: Option<&User>,
    conversation_id: &str,
    err: UpstreamCallError,
) -> Response {
    if !conversation_id.is_empty() {
        state.backend_state.unpin_conversation(conversation_id).await;
    }
    if err.is_transient() {
        state
            .backend_state
            .quarantine(&backend.id, QUARANTINE_TTL)
            .await;
    }
    let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
    let message = if err.body.is_empty() {
        err.message.clone()
    } else {
        extract_upstream_error_message(&err.body)
    };
    tracing::warn!(
        backend = %backend.id,
        status = status.as_u16(),
        "upstream failure: {message}"
    );
    spawn_error_log(state, &backend.id, user, status.as_u16() as i64, message.clone());
    protocol.error_response(status, &message)
}

fn spawn_error_log(
    state: &AppState,
    backend_id: &str,
    user: Option<&User>,
    status: i64,
    message: String,
) {
    let users = state.users.clone();
    let backend_id = backend_id.to_string();
    let username = user.map(|u| u.username.clone()).unwrap_or_default();
    tokio::spawn(async move {
        if let Err(err) = users
            .record_error_log(&backend_id, &username, status, &message)
            .await
        {
            tracing::warn!("error log insert failed: {err}");
        }
    });
}

fn decode_request(protocol: Protocol, value: &Value) -> Result<GatewayRequest, String> {
    match protocol {
        Protocol::Anthropic => wire::decode::anthropic::decode_request(value),
        Protocol::Chat => wire::decode::openai_chat::decode_request(value),
        Protocol::Responses => wire::decode::openai_responses::decode_request(value),
    }
}

fn decode_response_from(
    interface: &str,
    value: &Value,
) -> Result<wire::GatewayResponse, String> {
    match interface {
        "anthropic" => wire::decode::anthropic::decode_response(value),
        "openai_responses" => wire::decode::openai_responses::decode_response(value),
        _ => wire::decode::openai_chat::decode_response(value),
    }
}

fn encode_response_for(
    protocol: Protocol,
    resp: &wire::GatewayResponse,
    logical_model: &str,
) -> Value {
    match protocol {
        Protocol::Anthropic => wire::encode::anthropic::encode_response(resp, logical_model),
        Protocol::Chat => wire::encode::openai_chat::encode_response(resp, logical_model),
        Protocol::Responses => {
            wire::encode::openai_responses::encode_response(resp, logical_model)
        }
    }
}

fn encode_for_interface(
    interface: &str,
    req: &GatewayRequest,
    upstream_model: &str,
    stream: bool,
) -> Value {
    match interface {
        "anthropic" => wire::encode::anthropic::encode_request(req, upstream_model, stream),
        "openai_responses" => {
            wire::encode::openai_responses::encode_request(req, upstream_model, stream)
        }
        _ => wire::encode::openai_chat::encode_request(req, upstream_model, stream),
    }
}

fn normalize_interface(interface: &str, backend: &Backend) -> &'static str {
    match Protocol::from_interface(interface) {
        Some(p) => p.interface(),
        None => backend.normalized_interface(),
    }
}

/// Which backends the Responses surface may serve: native Responses
/// upstreams, the codex operator, and anything the translators can bridge.
fn responses_candidate(backend: &Backend) -> bool {
    if backend.operator_id.trim().eq_ignore_ascii_case("codex") {
        return true;
    }
    matches!(
        backend.normalized_interface(),
        "openai_responses" | "openai" | "anthropic"
    )
}
