use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::response::Sse;
use axum::response::sse::Event;
use http_body_util::BodyExt;
use polyroute::backends::{Backend, Combo, ComboItem};
use polyroute::config::Config;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const ADMIN_KEY: &str = "admin-key";

struct TestContext {
    router: Router,
    state: polyroute::app::AppState,
    upstream_addr: SocketAddr,
    _temp_dir: TempDir,
}

async fn start_upstream() -> SocketAddr {
    async fn chat_completions(Json(body): Json<Value>) -> axum::response::Response {
        let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("mock");
        if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
            let chunks = vec![
                json!({
                    "id": "chatcmpl-up",
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{"index": 0, "delta": {"role": "assistant", "content": "hel"},
                                 "finish_reason": null}]
                }),
                json!({
                    "id": "chatcmpl-up",
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": null}]
                }),
                json!({
                    "id": "chatcmpl-up",
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 100, "completion_tokens": 40}
                }),
            ];
            let mut events: Vec<Result<Event, Infallible>> = chunks
                .into_iter()
                .map(|c| Ok(Event::default().data(c.to_string())))
                .collect();
            events.push(Ok(Event::default().data("[DONE]")));
            return Sse::new(futures_util::stream::iter(events)).into_response();
        }
        Json(json!({
            "id": "chatcmpl-up",
            "object": "chat.completion",
            "model": model,
            "choices": [{"index": 0,
                         "message": {"role": "assistant", "content": "hello"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1}
        }))
        .into_response()
    }

    async fn responses(Json(body): Json<Value>) -> axum::response::Response {
        let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("mock");
        if model == "boom" {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"message": "upstream exploded"}})),
            )
                .into_response();
        }
        if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
            let events_json = vec![
                (
                    "response.created",
                    json!({"type": "response.created",
                           "response": {"id": "resp_up", "model": model, "status": "in_progress"}}),
                ),
                (
                    "response.output_item.added",
                    json!({"type": "response.output_item.added", "output_index": 0,
                           "item": {"type": "function_call", "call_id": "c1",
                                    "name": "get_weather", "arguments": ""}}),
                ),
                (
                    "response.function_call_arguments.delta",
                    json!({"type": "response.function_call_arguments.delta",
                           "output_index": 0, "delta": "{\"city"}),
                ),
                (
                    "response.function_call_arguments.delta",
                    json!({"type": "response.function_call_arguments.delta",
                           "output_index": 0, "delta": "\":\"SF\"}"}),
                ),
                (
                    "response.output_item.done",
                    json!({"type": "response.output_item.done", "output_index": 0,
                           "item": {"type": "function_call", "call_id": "c1",
                                    "name": "get_weather",
                                    "arguments": "{\"city\":\"SF\"}"}}),
                ),
                (
                    "response.completed",
                    json!({"type": "response.completed",
                           "response": {"id": "resp_up", "status": "completed",
                                        "usage": {"input_tokens": 9, "output_tokens": 6}}}),
                ),
            ];
            let events: Vec<Result<Event, Infallible>> = events_json
                .into_iter()
                .map(|(name, data)| Ok(Event::default().event(name).data(data.to_string())))
                .collect();
            return Sse::new(futures_util::stream::iter(events)).into_response();
        }
        Json(json!({
            "id": "resp_up",
            "object": "response",
            "model": model,
            "status": "completed",
            "output": [{"type": "message", "role": "assistant",
                        "content": [{"type": "output_text", "text": "hello"}]}],
            "usage": {"input_tokens": 7, "output_tokens": 2}
        }))
        .into_response()
    }

    let app = Router::new()
        .route("/v1/chat/completions", axum::routing::post(chat_completions))
        .route("/v1/responses", axum::routing::post(responses));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

fn test_backend(id: &str, interface: &str, upstream_id: &str, addr: SocketAddr) -> Backend {
    Backend {
        id: id.to_string(),
        name: id.to_string(),
        provider: "test".to_string(),
        interface: interface.to_string(),
        upstream_id: upstream_id.to_string(),
        api_key: "sk-upstream".to_string(),
        base_url: format!("http://{addr}"),
        description: String::new(),
        enabled: true,
        forward_metadata: false,
        forward_thinking: false,
        max_qps: 0.0,
        operator_id: String::new(),
        response_format: String::new(),
        input_price: 2.0,
        output_price: 10.0,
    }
}

async fn setup() -> TestContext {
    let temp_dir = TempDir::new().expect("tempdir");
    let dsn = format!(
        "sqlite://{}",
        temp_dir.path().join("polyroute.db").to_string_lossy()
    );
    let mut config = Config::default();
    config.auth.api_key = ADMIN_KEY.to_string();
    config.database.dsn = dsn;

    let upstream_addr = start_upstream().await;
    let state = polyroute::app::load_state(config).await.expect("state");

    state
        .backends
        .upsert(&test_backend("b-chat", "openai", "gpt-4o-mini", upstream_addr))
        .await
        .expect("seed b-chat");
    state
        .backends
        .upsert(&test_backend(
            "b-resp",
            "openai_responses",
            "gpt-5",
            upstream_addr,
        ))
        .await
        .expect("seed b-resp");

    state
        .users
        .create("alice", "sk-alice", -1.0, None, false)
        .await
        .expect("seed alice");
    state
        .users
        .create(
            "expired",
            "sk-expired",
            -1.0,
            Some(chrono::Utc::now() - chrono::Duration::hours(1)),
            false,
        )
        .await
        .expect("seed expired");
    state
        .users
        .create("broke", "sk-broke", 0.05, None, false)
        .await
        .expect("seed broke");

    let router = polyroute::app::build_app(state.clone());
    TestContext {
        router,
        state,
        upstream_addr,
        _temp_dir: temp_dir,
    }
}

async fn post_json(ctx: &TestContext, path: &str, api_key: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {api_key}"))
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = ctx.router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn post_sse(ctx: &TestContext, path: &str, api_key: &str, body: Value) -> (StatusCode, String) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {api_key}"))
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = ctx.router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

fn sse_data_payloads(raw: &str) -> Vec<Value> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| data.trim() != "[DONE]")
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}

#[tokio::test]
async fn healthz_and_count_tokens_stub() {
    let ctx = setup().await;
    let (status, body) = post_json(
        &ctx,
        "/v1/messages/count_tokens",
        "sk-alice",
        json!({"model": "b-chat", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["input_tokens"], 0);

    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = ctx.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_rejections() {
    let ctx = setup().await;

    let (status, _) = post_json(
        &ctx,
        "/v1/chat/completions",
        "sk-unknown",
        json!({"model": "b-chat", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(
        &ctx,
        "/v1/chat/completions",
        "sk-expired",
        json!({"model": "b-chat", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = post_json(
        &ctx,
        "/v1/chat/completions",
        "sk-broke",
        json!({"model": "b-chat", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn anthropic_to_openai_text_round_trip() {
    let ctx = setup().await;
    let (status, body) = post_json(
        &ctx,
        "/v1/messages",
        "sk-alice",
        json!({
            "model": "b-chat",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "hello");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 5);
    assert_eq!(body["usage"]["output_tokens"], 1);

    // the accountant debited (5, 1)
    let alice = ctx
        .state
        .users
        .get("alice")
        .await
        .expect("query")
        .expect("alice");
    assert_eq!(alice.input_tokens, 5);
    assert_eq!(alice.output_tokens, 1);
    assert_eq!(alice.total_tokens, 6);
    assert_eq!(alice.quota, -1.0);
}

#[tokio::test]
async fn invalid_json_uses_protocol_envelope() {
    let ctx = setup().await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {ADMIN_KEY}"))
        .body(Body::from("{not json"))
        .expect("request");
    let response = ctx.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn combo_keyword_routing() {
    let ctx = setup().await;
    let addr = ctx.upstream_addr;
    ctx.state
        .backends
        .upsert(&test_backend("cheap", "openai", "cheap-up", addr))
        .await
        .expect("seed cheap");
    ctx.state
        .backends
        .upsert(&test_backend("smart", "openai", "smart-up", addr))
        .await
        .expect("seed smart");
    ctx.state
        .backends
        .upsert_combo(&Combo {
            id: "combo:main".to_string(),
            name: "main".to_string(),
            description: String::new(),
            enabled: true,
            items: vec![
                ComboItem {
                    backend_id: "cheap".to_string(),
                    weight: 1.0,
                    keywords: vec![],
                },
                ComboItem {
                    backend_id: "smart".to_string(),
                    weight: 0.5,
                    keywords: vec!["!think".to_string()],
                },
            ],
        })
        .await
        .expect("seed combo");

    // keyword hit wins regardless of weight; the chat identity path returns
    // the upstream body untouched, so the chosen upstream id is visible
    let (status, body) = post_json(
        &ctx,
        "/v1/chat/completions",
        "sk-alice",
        json!({
            "model": "combo:main",
            "messages": [{"role": "user", "content": "please !think about it"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["model"], "smart-up");

    let (status, body) = post_json(
        &ctx,
        "/v1/chat/completions",
        "sk-alice",
        json!({
            "model": "combo:main",
            "messages": [{"role": "user", "content": "just do it"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "cheap-up");
}

#[tokio::test]
async fn conversation_stickiness_pins_combo_choice() {
    let ctx = setup().await;
    let addr = ctx.upstream_addr;
    ctx.state
        .backends
        .upsert(&test_backend("cheap", "openai", "cheap-up", addr))
        .await
        .expect("seed cheap");
    ctx.state
        .backends
        .upsert(&test_backend("smart", "openai", "smart-up", addr))
        .await
        .expect("seed smart");
    ctx.state
        .backends
        .upsert_combo(&Combo {
            id: "combo:sticky".to_string(),
            name: "sticky".to_string(),
            description: String::new(),
            enabled: true,
            items: vec![
                ComboItem {
                    backend_id: "cheap".to_string(),
                    weight: 1.0,
                    keywords: vec![],
                },
                ComboItem {
                    backend_id: "smart".to_string(),
                    weight: 0.5,
                    keywords: vec!["!think".to_string()],
                },
            ],
        })
        .await
        .expect("seed combo");

    let (status, body) = post_json(
        &ctx,
        "/v1/chat/completions",
        "sk-alice",
        json!({
            "model": "combo:sticky",
            "metadata": {"user_id": "conv-42"},
            "messages": [{"role": "user", "content": "!think hard"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "smart-up");

    // same conversation, no keyword: the pin wins over the weight order
    let (status, body) = post_json(
        &ctx,
        "/v1/chat/completions",
        "sk-alice",
        json!({
            "model": "combo:sticky",
            "metadata": {"user_id": "conv-42"},
            "messages": [{"role": "user", "content": "continue"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "smart-up");
}

#[tokio::test]
async fn quarantine_then_fallback_on_responses_endpoint() {
    let ctx = setup().await;
    let addr = ctx.upstream_addr;
    // leave only the two backends this scenario is about
    ctx.state.backends.delete("b-chat").await.expect("drop b-chat");
    ctx.state.backends.delete("b-resp").await.expect("drop b-resp");
    // "boom" upstream id makes the mock return 500
    ctx.state
        .backends
        .upsert(&test_backend("r-a", "openai_responses", "boom", addr))
        .await
        .expect("seed r-a");
    ctx.state
        .backends
        .upsert(&test_backend("r-b", "openai_responses", "gpt-5b", addr))
        .await
        .expect("seed r-b");

    let (status, body) = post_json(
        &ctx,
        "/v1/responses",
        "sk-alice",
        json!({"model": "r-a", "input": "hi"}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["type"], "api_error");
    assert_eq!(body["error"]["message"], "upstream exploded");
    assert!(ctx.state.backend_state.is_quarantined("r-a").await);

    // next request for the same id falls back to the surviving backend
    let (status, body) = post_json(
        &ctx,
        "/v1/responses",
        "sk-alice",
        json!({"model": "r-a", "input": "hi"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["model"], "gpt-5b");

    // the failure left an error log behind (written on a spawned task)
    let mut logged = false;
    for _ in 0..50 {
        let logs = ctx
            .state
            .users
            .recent_error_logs(10)
            .await
            .expect("error logs");
        if logs.iter().any(|l| l.backend_id == "r-a" && l.status == 500) {
            logged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(logged, "expected an error log row for r-a");
}

#[tokio::test]
async fn chat_stream_usage_is_accounted() {
    let ctx = setup().await;
    let (status, raw) = post_sse(
        &ctx,
        "/v1/chat/completions",
        "sk-alice",
        json!({
            "model": "b-chat",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(raw.contains("[DONE]"));

    // settle runs on the relay task after the stream closes
    let mut settled = None;
    for _ in 0..50 {
        let user = ctx.state.users.get("alice").await.expect("query").expect("alice");
        let (logs, total) = ctx
            .state
            .users
            .usage_logs_for("alice", 1, 10)
            .await
            .expect("logs");
        if user.total_tokens > 0 && total == 1 {
            settled = Some((user, logs));
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let (alice, logs) = settled.expect("usage settled");
    assert_eq!(alice.input_tokens, 100);
    assert_eq!(alice.output_tokens, 40);
    assert_eq!(alice.total_tokens, 140);
    assert_eq!(logs[0].backend_id, "b-chat");
    assert_eq!(logs[0].input_tokens, 100);
    // (100/1000)*2.0 + (40/1000)*10.0
    assert!((logs[0].total_cost - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn finite_quota_is_debited_and_floored() {
    let ctx = setup().await;
    ctx.state
        .users
        .create("carol", "sk-carol", 1.0, None, false)
        .await
        .expect("seed carol");

    let (status, _) = post_json(
        &ctx,
        "/v1/messages",
        "sk-carol",
        json!({
            "model": "b-chat",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let carol = ctx.state.users.get("carol").await.expect("query").expect("carol");
    // (5/1000)*2.0 + (1/1000)*10.0 = 0.02
    assert!((carol.quota - 0.98).abs() < 1e-9, "quota {}", carol.quota);
}

#[tokio::test]
async fn chat_stream_through_responses_backend_translates_tool_calls() {
    let ctx = setup().await;
    let (status, raw) = post_sse(
        &ctx,
        "/v1/chat/completions",
        "sk-alice",
        json!({
            "model": "b-resp",
            "stream": true,
            "messages": [{"role": "user", "content": "weather?"}],
            "tools": [{"type": "function",
                       "function": {"name": "get_weather", "parameters": {"type": "object"}}}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payloads = sse_data_payloads(&raw);
    assert!(!payloads.is_empty(), "raw: {raw}");

    let mut tool_name = String::new();
    let mut tool_id = String::new();
    let mut arguments = String::new();
    let mut finish = String::new();
    for payload in &payloads {
        let Some(choice) = payload
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
        else {
            continue;
        };
        if let Some(tool_calls) = choice
            .get("delta")
            .and_then(|d| d.get("tool_calls"))
            .and_then(|v| v.as_array())
        {
            for tc in tool_calls {
                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    if !id.is_empty() {
                        tool_id = id.to_string();
                    }
                }
                if let Some(name) = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                {
                    if !name.is_empty() {
                        tool_name = name.to_string();
                    }
                }
                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    arguments.push_str(args);
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            finish = reason.to_string();
        }
    }
    assert_eq!(tool_id, "c1");
    assert_eq!(tool_name, "get_weather");
    assert_eq!(arguments, "{\"city\":\"SF\"}");
    assert_eq!(finish, "tool_calls");
    assert!(raw.contains("[DONE]"));
}

#[tokio::test]
async fn messages_stream_from_chat_upstream_is_well_formed() {
    let ctx = setup().await;
    let (status, raw) = post_sse(
        &ctx,
        "/v1/messages",
        "sk-alice",
        json!({
            "model": "b-chat",
            "stream": true,
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payloads = sse_data_payloads(&raw);

    let types: Vec<&str> = payloads
        .iter()
        .filter_map(|p| p.get("type").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(
        types.iter().filter(|t| **t == "message_start").count(),
        1,
        "types: {types:?}"
    );
    assert_eq!(types.iter().filter(|t| **t == "message_stop").count(), 1);
    let starts = types
        .iter()
        .filter(|t| **t == "content_block_start")
        .count();
    let stops = types.iter().filter(|t| **t == "content_block_stop").count();
    assert_eq!(starts, stops);
    assert!(starts >= 1);

    // the text deltas reassemble the upstream reply
    let text: String = payloads
        .iter()
        .filter(|p| p.get("type").and_then(|v| v.as_str()) == Some("content_block_delta"))
        .filter_map(|p| {
            p.get("delta")
                .filter(|d| d.get("type").and_then(|v| v.as_str()) == Some("text_delta"))
                .and_then(|d| d.get("text"))
                .and_then(|v| v.as_str())
        })
        .collect();
    assert_eq!(text, "hello");
}

#[tokio::test]
async fn responses_entry_from_chat_upstream() {
    let ctx = setup().await;
    let (status, body) = post_json(
        &ctx,
        "/v1/responses",
        "sk-alice",
        json!({"model": "b-chat", "input": "hi"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["object"], "response");
    assert_eq!(body["status"], "completed");
    let output = body["output"].as_array().expect("output");
    let message = output
        .iter()
        .find(|item| item["type"] == "message")
        .expect("message item");
    assert_eq!(message["content"][0]["type"], "output_text");
    assert_eq!(message["content"][0]["text"], "hello");
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let ctx = setup().await;
    let (status, body) = post_json(
        &ctx,
        "/v1/chat/completions",
        "sk-alice",
        json!({"model": "nope", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn admin_crud_requires_admin() {
    let ctx = setup().await;

    let request = Request::builder()
        .method("GET")
        .uri("/api/models")
        .header(AUTHORIZATION, "Bearer sk-alice")
        .body(Body::empty())
        .expect("request");
    let response = ctx.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let request = Request::builder()
        .method("GET")
        .uri("/api/models")
        .header(AUTHORIZATION, format!("Bearer {ADMIN_KEY}"))
        .body(Body::empty())
        .expect("request");
    let response = ctx.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}
