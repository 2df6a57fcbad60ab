use crate::accounting::UsageRecorder;
use crate::error::{AppError, AppResult};
use crate::sse::send_event;
use crate::wire::FinishReason;
use axum::http::StatusCode;
use axum::response::sse::Event;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::mpsc;

fn anthropic_event(name: &str, payload: Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

fn chat_chunk(event_data: Value) -> Event {
    Event::default().data(event_data.to_string())
}

/// Responses events carry a monotonically increasing `sequence_number`.
fn responses_event(seq: &mut u64, name: &str, mut payload: Value) -> Event {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("type".to_string(), Value::String(name.to_string()));
        obj.insert("sequence_number".to_string(), Value::from(*seq));
    }
    *seq += 1;
    Event::default().event(name).data(payload.to_string())
}

fn parse_data(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

async fn emit_empty_anthropic_message(tx: &mpsc::Sender<Event>, model: &str) {
    let _ = send_event(
        tx,
        anthropic_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", uuid::Uuid::new_v4()),
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ),
    )
    .await;
    let _ = send_event(
        tx,
        anthropic_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""}
            }),
        ),
    )
    .await;
    let _ = send_event(
        tx,
        anthropic_event(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": 0}),
        ),
    )
    .await;
    let _ = send_event(
        tx,
        anthropic_event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"input_tokens": 0, "output_tokens": 0}
            }),
        ),
    )
    .await;
    let _ = send_event(
        tx,
        anthropic_event("message_stop", json!({"type": "message_stop"})),
    )
    .await;
}

/// OpenAI Chat SSE -> Anthropic Messages SSE.
///
/// The text block opens lazily on the first text delta; every distinct
/// tool-call index gets its own block. Tool-call arguments arrive as growing
/// accumulations on some gateways, so only the suffix beyond what was already
/// relayed is emitted as `input_json_delta`.
pub async fn stream_chat_as_anthropic(
    model: &str,
    upstream: reqwest::Response,
    tx: mpsc::Sender<Event>,
    recorder: UsageRecorder,
) -> AppResult<()> {
    let mut first = true;
    let mut text_block_started = false;
    let mut encountered_tool_call = false;
    let mut closed = false;
    // openai tool index -> (anthropic block index, accumulated arguments)
    let mut tool_blocks: HashMap<i64, (i64, String)> = HashMap::new();
    let mut text_block_index: i64 = 0;
    let mut next_block_index: i64 = 0;

    let mut stream = upstream.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { break };
        let data = ev.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }
        let value = parse_data(data);
        recorder.record_value(&value).await;
        if closed {
            continue;
        }

        let choice = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(Value::Null);
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
        let finish = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        if first {
            first = false;
            let id = value
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let msg_id = if id.is_empty() {
                format!("msg_{}", uuid::Uuid::new_v4())
            } else {
                id
            };
            if !send_event(
                &tx,
                anthropic_event(
                    "message_start",
                    json!({
                        "type": "message_start",
                        "message": {
                            "id": msg_id,
                            "type": "message",
                            "role": "assistant",
                            "content": [],
                            "model": model,
                            "usage": {"input_tokens": 0, "output_tokens": 0}
                        }
                    }),
                ),
            )
            .await
            {
                return Ok(());
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            encountered_tool_call = true;
            for tc in tool_calls {
                let idx = tc.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
                if !tool_blocks.contains_key(&idx) {
                    let block_index = next_block_index;
                    next_block_index += 1;
                    tool_blocks.insert(idx, (block_index, String::new()));
                    let call_id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("");
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    if !send_event(
                        &tx,
                        anthropic_event(
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": {
                                    "type": "tool_use",
                                    "id": call_id,
                                    "name": name,
                                    "input": {}
                                }
                            }),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
                let new_args = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let entry = tool_blocks.get_mut(&idx).expect("tool block exists");
                // Differential: gateways either send increments or resend the
                // whole accumulation; either way only the new suffix goes out.
                let suffix = if new_args.len() > entry.1.len() && new_args.starts_with(&entry.1) {
                    let s = new_args[entry.1.len()..].to_string();
                    entry.1 = new_args.to_string();
                    s
                } else {
                    entry.1.push_str(new_args);
                    new_args.to_string()
                };
                if !suffix.is_empty()
                    && !send_event(
                        &tx,
                        anthropic_event(
                            "content_block_delta",
                            json!({
                                "type": "content_block_delta",
                                "index": entry.0,
                                "delta": {
                                    "type": "input_json_delta",
                                    "partial_json": suffix
                                }
                            }),
                        ),
                    )
                    .await
                {
                    return Ok(());
                }
            }
        } else if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                if !text_block_started {
                    text_block_started = true;
                    text_block_index = next_block_index;
                    next_block_index += 1;
                    if !send_event(
                        &tx,
                        anthropic_event(
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": text_block_index,
                                "content_block": {"type": "text", "text": ""}
                            }),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
                if !send_event(
                    &tx,
                    anthropic_event(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": text_block_index,
                            "delta": {"type": "text_delta", "text": text}
                        }),
                    ),
                )
                .await
                {
                    return Ok(());
                }
            }
        }

        if !finish.is_empty() {
            closed = true;
            close_anthropic_blocks(
                &tx,
                text_block_started.then_some(text_block_index),
                &tool_blocks,
                encountered_tool_call,
                &finish,
                &recorder,
            )
            .await;
        }
    }

    if first {
        // nothing at all came back; keep downstream parsers fed
        emit_empty_anthropic_message(&tx, model).await;
        return Ok(());
    }
    if !closed {
        close_anthropic_blocks(
            &tx,
            text_block_started.then_some(text_block_index),
            &tool_blocks,
            encountered_tool_call,
            "stop",
            &recorder,
        )
        .await;
    }
    Ok(())
}

async fn close_anthropic_blocks(
    tx: &mpsc::Sender<Event>,
    text_block_index: Option<i64>,
    tool_blocks: &HashMap<i64, (i64, String)>,
    encountered_tool_call: bool,
    finish: &str,
    recorder: &UsageRecorder,
) {
    let mut indexes: Vec<i64> = tool_blocks.values().map(|(idx, _)| *idx).collect();
    indexes.extend(text_block_index);
    indexes.sort_unstable();
    for index in indexes {
        let _ = send_event(
            tx,
            anthropic_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ),
        )
        .await;
    }
    let stop_reason = if encountered_tool_call {
        "tool_use".to_string()
    } else {
        FinishReason::from_chat(finish).as_anthropic().to_string()
    };
    // the terminal event always carries a usage object, zero-valued when the
    // upstream never reported one
    let usage = recorder.peek().await.unwrap_or_default();
    let _ = send_event(
        tx,
        anthropic_event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason},
                "usage": {
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens
                }
            }),
        ),
    )
    .await;
    let _ = send_event(
        tx,
        anthropic_event("message_stop", json!({"type": "message_stop"})),
    )
    .await;
}

/// OpenAI Responses SSE -> Anthropic Messages SSE.
///
/// Responses items interleave; `output_index -> block index` keeps the
/// Anthropic block order stable across them.
pub async fn stream_responses_as_anthropic(
    model: &str,
    upstream: reqwest::Response,
    tx: mpsc::Sender<Event>,
    recorder: UsageRecorder,
) -> AppResult<()> {
    let mut message_started = false;
    let mut closed = false;
    let mut next_block_index: i64 = 0;
    // output_index -> anthropic block index
    let mut block_map: HashMap<i64, i64> = HashMap::new();
    let mut open_blocks: HashMap<i64, bool> = HashMap::new();
    // output_index -> accumulated tool arguments
    let mut tool_args: HashMap<i64, String> = HashMap::new();
    let mut saw_tool_call = false;

    let mut stream = upstream.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { break };
        let data = ev.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }
        let value = parse_data(data);
        recorder.record_value(&value).await;
        if closed {
            continue;
        }
        let event_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ev.event.clone());

        match event_type.as_str() {
            "response.created" => {
                if !message_started {
                    message_started = true;
                    let response = value.get("response").cloned().unwrap_or(Value::Null);
                    let id = response
                        .get("id")
                        .or_else(|| value.get("id"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4()));
                    if !send_event(
                        &tx,
                        anthropic_event(
                            "message_start",
                            json!({
                                "type": "message_start",
                                "message": {
                                    "id": id,
                                    "type": "message",
                                    "role": "assistant",
                                    "content": [],
                                    "model": model,
                                    "usage": {"input_tokens": 0, "output_tokens": 0}
                                }
                            }),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
            }
            "response.in_progress" => {}
            "response.output_item.added" => {
                let item = value.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    let output_index =
                        value.get("output_index").and_then(|v| v.as_i64()).unwrap_or(0);
                    if !ensure_anthropic_message_started(&tx, &mut message_started, model).await {
                        return Ok(());
                    }
                    if !block_map.contains_key(&output_index) {
                        let block_index = next_block_index;
                        next_block_index += 1;
                        block_map.insert(output_index, block_index);
                        open_blocks.insert(block_index, true);
                        tool_args.insert(output_index, String::new());
                        saw_tool_call = true;
                        let call_id = item
                            .get("call_id")
                            .or_else(|| item.get("id"))
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4()));
                        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("");
                        if !send_event(
                            &tx,
                            anthropic_event(
                                "content_block_start",
                                json!({
                                    "type": "content_block_start",
                                    "index": block_index,
                                    "content_block": {
                                        "type": "tool_use",
                                        "id": call_id,
                                        "name": name,
                                        "input": {}
                                    }
                                }),
                            ),
                        )
                        .await
                        {
                            return Ok(());
                        }
                    }
                }
            }
            "response.output_text.delta" => {
                let output_index =
                    value.get("output_index").and_then(|v| v.as_i64()).unwrap_or(0);
                let delta = value.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                if !ensure_anthropic_message_started(&tx, &mut message_started, model).await {
                    return Ok(());
                }
                if !block_map.contains_key(&output_index) {
                    let block_index = next_block_index;
                    next_block_index += 1;
                    block_map.insert(output_index, block_index);
                    open_blocks.insert(block_index, true);
                    if !send_event(
                        &tx,
                        anthropic_event(
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": {"type": "text", "text": ""}
                            }),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
                if !delta.is_empty() {
                    let block_index = block_map[&output_index];
                    if !send_event(
                        &tx,
                        anthropic_event(
                            "content_block_delta",
                            json!({
                                "type": "content_block_delta",
                                "index": block_index,
                                "delta": {"type": "text_delta", "text": delta}
                            }),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                let output_index =
                    value.get("output_index").and_then(|v| v.as_i64()).unwrap_or(0);
                let delta = value.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                if !ensure_anthropic_message_started(&tx, &mut message_started, model).await {
                    return Ok(());
                }
                if !block_map.contains_key(&output_index) {
                    let block_index = next_block_index;
                    next_block_index += 1;
                    block_map.insert(output_index, block_index);
                    open_blocks.insert(block_index, true);
                    tool_args.insert(output_index, String::new());
                    saw_tool_call = true;
                    let name = value.get("name").and_then(|v| v.as_str()).unwrap_or("");
                    if !send_event(
                        &tx,
                        anthropic_event(
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": {
                                    "type": "tool_use",
                                    "id": format!("toolu_{}", uuid::Uuid::new_v4()),
                                    "name": name,
                                    "input": {}
                                }
                            }),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
                if !delta.is_empty() {
                    let block_index = block_map[&output_index];
                    tool_args.entry(output_index).or_default().push_str(delta);
                    if !send_event(
                        &tx,
                        anthropic_event(
                            "content_block_delta",
                            json!({
                                "type": "content_block_delta",
                                "index": block_index,
                                "delta": {"type": "input_json_delta", "partial_json": delta}
                            }),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
            }
            "response.function_call_arguments.done" => {
                // emit whatever tail the deltas did not cover
                let output_index =
                    value.get("output_index").and_then(|v| v.as_i64()).unwrap_or(0);
                let full = value.get("arguments").and_then(|v| v.as_str()).unwrap_or("");
                if let (Some(block_index), Some(seen)) =
                    (block_map.get(&output_index), tool_args.get_mut(&output_index))
                {
                    if full.len() > seen.len() && full.starts_with(seen.as_str()) {
                        let suffix = full[seen.len()..].to_string();
                        *seen = full.to_string();
                        if !send_event(
                            &tx,
                            anthropic_event(
                                "content_block_delta",
                                json!({
                                    "type": "content_block_delta",
                                    "index": block_index,
                                    "delta": {"type": "input_json_delta", "partial_json": suffix}
                                }),
                            ),
                        )
                        .await
                        {
                            return Ok(());
                        }
                    }
                }
            }
            "response.output_text.done" | "response.output_item.done" => {
                let output_index =
                    value.get("output_index").and_then(|v| v.as_i64()).unwrap_or(0);
                if let Some(block_index) = block_map.get(&output_index).copied() {
                    if open_blocks.get(&block_index).copied().unwrap_or(false) {
                        open_blocks.insert(block_index, false);
                        if !send_event(
                            &tx,
                            anthropic_event(
                                "content_block_stop",
                                json!({"type": "content_block_stop", "index": block_index}),
                            ),
                        )
                        .await
                        {
                            return Ok(());
                        }
                    }
                }
            }
            "response.completed" => {
                closed = true;
                let mut indexes: Vec<i64> = open_blocks
                    .iter()
                    .filter(|(_, open)| **open)
                    .map(|(idx, _)| *idx)
                    .collect();
                indexes.sort_unstable();
                for index in indexes {
                    let _ = send_event(
                        &tx,
                        anthropic_event(
                            "content_block_stop",
                            json!({"type": "content_block_stop", "index": index}),
                        ),
                    )
                    .await;
                }
                let stop_reason = if saw_tool_call { "tool_use" } else { "end_turn" };
                let usage = value
                    .get("response")
                    .and_then(|r| r.get("usage"))
                    .cloned()
                    .unwrap_or(json!({"input_tokens": 0, "output_tokens": 0}));
                let _ = send_event(
                    &tx,
                    anthropic_event(
                        "message_delta",
                        json!({
                            "type": "message_delta",
                            "delta": {"stop_reason": stop_reason},
                            "usage": usage
                        }),
                    ),
                )
                .await;
                let _ = send_event(
                    &tx,
                    anthropic_event("message_stop", json!({"type": "message_stop"})),
                )
                .await;
            }
            "response.failed" | "error" => {
                let _ = send_event(
                    &tx,
                    anthropic_event(
                        "error",
                        json!({
                            "type": "error",
                            "error": {"type": "api_error", "message": data}
                        }),
                    ),
                )
                .await;
                return Err(AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "api_error",
                    format!("upstream stream error event: {event_type}"),
                ));
            }
            _ => {}
        }
    }

    if !message_started {
        emit_empty_anthropic_message(&tx, model).await;
    }
    Ok(())
}

async fn ensure_anthropic_message_started(
    tx: &mpsc::Sender<Event>,
    message_started: &mut bool,
    model: &str,
) -> bool {
    if *message_started {
        return true;
    }
    *message_started = true;
    send_event(
        tx,
        anthropic_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", uuid::Uuid::new_v4()),
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ),
    )
    .await
}

/// Anthropic Messages SSE -> OpenAI Chat SSE.
pub async fn stream_anthropic_as_chat(
    model: &str,
    upstream: reqwest::Response,
    tx: mpsc::Sender<Event>,
    recorder: UsageRecorder,
) -> AppResult<()> {
    let chat_id = format!("chatcmpl_{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();
    let base = |delta: Value, finish: Value| {
        json!({
            "id": chat_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
        })
    };

    let mut sent_role = false;
    // anthropic block index -> chat tool index
    let mut block_tools: HashMap<i64, i64> = HashMap::new();
    let mut next_tool_index: i64 = 0;
    let mut saw_tool_call = false;
    let mut finished = false;

    let mut stream = upstream.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { break };
        let data = ev.data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let value = parse_data(data);
        recorder.record_value(&value).await;
        let event_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ev.event.clone());

        match event_type.as_str() {
            "message_start" => {
                sent_role = true;
                if !send_event(
                    &tx,
                    chat_chunk(base(json!({"role": "assistant", "content": ""}), Value::Null)),
                )
                .await
                {
                    return Ok(());
                }
            }
            "content_block_start" => {
                let index = value.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
                let block = value.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    saw_tool_call = true;
                    let tool_index = next_tool_index;
                    next_tool_index += 1;
                    block_tools.insert(index, tool_index);
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                            "type": "function",
                            "function": {
                                "name": block.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                                "arguments": ""
                            }
                        }]
                    });
                    if !send_event(&tx, chat_chunk(base(delta, Value::Null))).await {
                        return Ok(());
                    }
                }
            }
            "content_block_delta" => {
                let index = value.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
                let delta = value.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty()
                                && !send_event(
                                    &tx,
                                    chat_chunk(base(json!({"content": text}), Value::Null)),
                                )
                                .await
                            {
                                return Ok(());
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if !text.is_empty()
                                && !send_event(
                                    &tx,
                                    chat_chunk(base(
                                        json!({"reasoning_content": text}),
                                        Value::Null,
                                    )),
                                )
                                .await
                            {
                                return Ok(());
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let (Some(partial), Some(tool_index)) = (
                            delta.get("partial_json").and_then(|v| v.as_str()),
                            block_tools.get(&index),
                        ) {
                            if !partial.is_empty() {
                                let chunk = json!({
                                    "tool_calls": [{
                                        "index": tool_index,
                                        "function": {"arguments": partial}
                                    }]
                                });
                                if !send_event(&tx, chat_chunk(base(chunk, Value::Null))).await {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {}
            "message_delta" => {
                finished = true;
                let stop_reason = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("end_turn");
                let finish = if saw_tool_call {
                    "tool_calls".to_string()
                } else {
                    FinishReason::from_anthropic(stop_reason).as_chat().to_string()
                };
                let usage = match crate::accounting::extract_usage(&value) {
                    Some(u) => u,
                    None => recorder.peek().await.unwrap_or_default(),
                };
                let mut chunk = base(json!({}), Value::String(finish));
                chunk["usage"] = json!({
                    "prompt_tokens": usage.input_tokens,
                    "completion_tokens": usage.output_tokens,
                    "total_tokens": usage.input_tokens + usage.output_tokens
                });
                if !send_event(&tx, chat_chunk(chunk)).await {
                    return Ok(());
                }
            }
            "message_stop" => break,
            "error" => {
                let _ = send_event(&tx, chat_chunk(value.clone())).await;
                let _ = send_event(&tx, Event::default().data("[DONE]")).await;
                return Err(AppError::bad_gateway("upstream stream error event"));
            }
            _ => {}
        }
    }

    if !sent_role {
        let _ = send_event(
            &tx,
            chat_chunk(base(json!({"role": "assistant", "content": ""}), Value::Null)),
        )
        .await;
    }
    if !finished {
        let _ = send_event(&tx, chat_chunk(base(json!({}), Value::String("stop".into())))).await;
    }
    let _ = send_event(&tx, Event::default().data("[DONE]")).await;
    Ok(())
}

/// OpenAI Responses SSE -> OpenAI Chat SSE.
pub async fn stream_responses_as_chat(
    model: &str,
    upstream: reqwest::Response,
    tx: mpsc::Sender<Event>,
    recorder: UsageRecorder,
) -> AppResult<()> {
    let chat_id = format!("chatcmpl_{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();
    let base = |delta: Value, finish: Value| {
        json!({
            "id": chat_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
        })
    };

    let mut sent_role = false;
    let mut finished = false;
    // output_index -> chat tool index
    let mut tool_indexes: HashMap<i64, i64> = HashMap::new();
    let mut next_tool_index: i64 = 0;
    let mut saw_tool_call = false;

    let mut stream = upstream.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { break };
        let data = ev.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }
        let value = parse_data(data);
        recorder.record_value(&value).await;
        let event_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ev.event.clone());

        match event_type.as_str() {
            "response.created" => {
                if !sent_role {
                    sent_role = true;
                    if !send_event(
                        &tx,
                        chat_chunk(base(
                            json!({"role": "assistant", "content": ""}),
                            Value::Null,
                        )),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
            }
            "response.output_item.added" => {
                let item = value.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    saw_tool_call = true;
                    let output_index =
                        value.get("output_index").and_then(|v| v.as_i64()).unwrap_or(0);
                    let tool_index = *tool_indexes.entry(output_index).or_insert_with(|| {
                        let idx = next_tool_index;
                        next_tool_index += 1;
                        idx
                    });
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "id": item.get("call_id").or_else(|| item.get("id"))
                                .and_then(|v| v.as_str()).unwrap_or(""),
                            "type": "function",
                            "function": {
                                "name": item.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                                "arguments": ""
                            }
                        }]
                    });
                    if !send_event(&tx, chat_chunk(base(delta, Value::Null))).await {
                        return Ok(());
                    }
                }
            }
            "response.output_text.delta" => {
                if let Some(text) = value.get("delta").and_then(|v| v.as_str()) {
                    if !text.is_empty()
                        && !send_event(&tx, chat_chunk(base(json!({"content": text}), Value::Null)))
                            .await
                    {
                        return Ok(());
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                let output_index =
                    value.get("output_index").and_then(|v| v.as_i64()).unwrap_or(0);
                let tool_index = *tool_indexes.entry(output_index).or_insert_with(|| {
                    let idx = next_tool_index;
                    next_tool_index += 1;
                    idx
                });
                if let Some(delta) = value.get("delta").and_then(|v| v.as_str()) {
                    if !delta.is_empty() {
                        let chunk = json!({
                            "tool_calls": [{
                                "index": tool_index,
                                "function": {"arguments": delta}
                            }]
                        });
                        if !send_event(&tx, chat_chunk(base(chunk, Value::Null))).await {
                            return Ok(());
                        }
                    }
                }
            }
            "response.completed" => {
                finished = true;
                let finish = if saw_tool_call { "tool_calls" } else { "stop" };
                let usage = match crate::accounting::extract_usage(&value) {
                    Some(u) => u,
                    None => recorder.peek().await.unwrap_or_default(),
                };
                let mut chunk = base(json!({}), Value::String(finish.to_string()));
                chunk["usage"] = json!({
                    "prompt_tokens": usage.input_tokens,
                    "completion_tokens": usage.output_tokens,
                    "total_tokens": usage.input_tokens + usage.output_tokens
                });
                if !send_event(&tx, chat_chunk(chunk)).await {
                    return Ok(());
                }
            }
            "response.failed" | "error" => {
                let _ = send_event(&tx, chat_chunk(value.clone())).await;
                let _ = send_event(&tx, Event::default().data("[DONE]")).await;
                return Err(AppError::bad_gateway(format!(
                    "upstream stream error event: {event_type}"
                )));
            }
            _ => {}
        }
    }

    if !finished {
        let _ = send_event(&tx, chat_chunk(base(json!({}), Value::String("stop".into())))).await;
    }
    let _ = send_event(&tx, Event::default().data("[DONE]")).await;
    Ok(())
}

/// Anthropic Messages SSE -> OpenAI Responses SSE.
pub async fn stream_anthropic_as_responses(
    model: &str,
    upstream: reqwest::Response,
    tx: mpsc::Sender<Event>,
    recorder: UsageRecorder,
) -> AppResult<()> {
    let mut seq: u64 = 1;
    let response_id = format!("resp_{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();
    let base_response = json!({
        "id": response_id,
        "object": "response",
        "created_at": created,
        "model": model,
        "status": "in_progress",
        "output": []
    });

    let mut started = false;
    let mut output_index: i64 = 0;
    // anthropic block index -> (output index, item id, kind)
    let mut blocks: HashMap<i64, (i64, String, &'static str)> = HashMap::new();
    let mut output_text = String::new();
    let mut calls: Vec<(String, String, String)> = Vec::new(); // (call_id, name, args)
    let mut usage = json!({"input_tokens": 0, "output_tokens": 0, "total_tokens": 0});

    let mut stream = upstream.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { break };
        let data = ev.data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let value = parse_data(data);
        recorder.record_value(&value).await;
        let event_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ev.event.clone());

        match event_type.as_str() {
            "message_start" => {
                if !started {
                    started = true;
                    let ok = send_event(
                        &tx,
                        responses_event(
                            &mut seq,
                            "response.created",
                            json!({"response": base_response.clone()}),
                        ),
                    )
                    .await
                        && send_event(
                            &tx,
                            responses_event(
                                &mut seq,
                                "response.in_progress",
                                json!({"response": base_response.clone()}),
                            ),
                        )
                        .await;
                    if !ok {
                        return Ok(());
                    }
                }
            }
            "content_block_start" => {
                let index = value.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
                let block = value.get("content_block").cloned().unwrap_or(Value::Null);
                let this_output = output_index;
                output_index += 1;
                match block.get("type").and_then(|v| v.as_str()).unwrap_or("text") {
                    "tool_use" => {
                        let call_id = block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4()));
                        let name = block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        let item_id = format!("fc_{call_id}");
                        blocks.insert(index, (this_output, item_id.clone(), "function_call"));
                        calls.push((call_id.clone(), name.clone(), String::new()));
                        let item = json!({
                            "id": item_id,
                            "type": "function_call",
                            "call_id": call_id,
                            "name": name,
                            "arguments": ""
                        });
                        if !send_event(
                            &tx,
                            responses_event(
                                &mut seq,
                                "response.output_item.added",
                                json!({"output_index": this_output, "item": item}),
                            ),
                        )
                        .await
                        {
                            return Ok(());
                        }
                    }
                    "thinking" => {
                        let item_id = format!("rs_{response_id}_{this_output}");
                        blocks.insert(index, (this_output, item_id.clone(), "reasoning"));
                        let item = json!({"id": item_id, "type": "reasoning", "summary": []});
                        if !send_event(
                            &tx,
                            responses_event(
                                &mut seq,
                                "response.output_item.added",
                                json!({"output_index": this_output, "item": item}),
                            ),
                        )
                        .await
                        {
                            return Ok(());
                        }
                    }
                    _ => {
                        let item_id = format!("msg_{response_id}_{this_output}");
                        blocks.insert(index, (this_output, item_id.clone(), "message"));
                        let item = json!({
                            "id": item_id,
                            "type": "message",
                            "role": "assistant",
                            "content": []
                        });
                        if !send_event(
                            &tx,
                            responses_event(
                                &mut seq,
                                "response.output_item.added",
                                json!({"output_index": this_output, "item": item}),
                            ),
                        )
                        .await
                        {
                            return Ok(());
                        }
                    }
                }
            }
            "content_block_delta" => {
                let index = value.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
                let delta = value.get("delta").cloned().unwrap_or(Value::Null);
                let Some((this_output, item_id, kind)) = blocks.get(&index).cloned() else {
                    continue;
                };
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            output_text.push_str(text);
                            if !send_event(
                                &tx,
                                responses_event(
                                    &mut seq,
                                    "response.output_text.delta",
                                    json!({
                                        "item_id": item_id,
                                        "output_index": this_output,
                                        "delta": text
                                    }),
                                ),
                            )
                            .await
                            {
                                return Ok(());
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if !send_event(
                                &tx,
                                responses_event(
                                    &mut seq,
                                    "response.reasoning_text.delta",
                                    json!({
                                        "item_id": item_id,
                                        "output_index": this_output,
                                        "delta": text
                                    }),
                                ),
                            )
                            .await
                            {
                                return Ok(());
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if kind == "function_call" {
                                if let Some(call) = calls
                                    .iter_mut()
                                    .find(|(cid, _, _)| format!("fc_{cid}") == item_id)
                                {
                                    call.2.push_str(partial);
                                }
                                if !send_event(
                                    &tx,
                                    responses_event(
                                        &mut seq,
                                        "response.function_call_arguments.delta",
                                        json!({
                                            "item_id": item_id,
                                            "output_index": this_output,
                                            "delta": partial
                                        }),
                                    ),
                                )
                                .await
                                {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = value.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
                let Some((this_output, item_id, kind)) = blocks.get(&index).cloned() else {
                    continue;
                };
                let item = match kind {
                    "function_call" => {
                        let (call_id, name, args) = calls
                            .iter()
                            .find(|(cid, _, _)| format!("fc_{cid}") == item_id)
                            .cloned()
                            .unwrap_or_default();
                        if !send_event(
                            &tx,
                            responses_event(
                                &mut seq,
                                "response.function_call_arguments.done",
                                json!({
                                    "item_id": item_id,
                                    "output_index": this_output,
                                    "arguments": args
                                }),
                            ),
                        )
                        .await
                        {
                            return Ok(());
                        }
                        json!({
                            "id": item_id,
                            "type": "function_call",
                            "call_id": call_id,
                            "name": name,
                            "arguments": args
                        })
                    }
                    "reasoning" => json!({"id": item_id, "type": "reasoning", "summary": []}),
                    _ => {
                        if !send_event(
                            &tx,
                            responses_event(
                                &mut seq,
                                "response.output_text.done",
                                json!({
                                    "item_id": item_id,
                                    "output_index": this_output,
                                    "text": output_text
                                }),
                            ),
                        )
                        .await
                        {
                            return Ok(());
                        }
                        json!({
                            "id": item_id,
                            "type": "message",
                            "role": "assistant",
                            "content": [{"type": "output_text", "text": output_text, "annotations": []}]
                        })
                    }
                };
                if !send_event(
                    &tx,
                    responses_event(
                        &mut seq,
                        "response.output_item.done",
                        json!({"output_index": this_output, "item": item}),
                    ),
                )
                .await
                {
                    return Ok(());
                }
            }
            "message_delta" => {
                if let Some(u) = crate::accounting::extract_usage(&value) {
                    usage = json!({
                        "input_tokens": u.input_tokens,
                        "output_tokens": u.output_tokens,
                        "total_tokens": u.input_tokens + u.output_tokens
                    });
                }
            }
            "message_stop" => {
                let mut output: Vec<Value> = Vec::new();
                for (call_id, name, args) in &calls {
                    output.push(json!({
                        "id": format!("fc_{call_id}"),
                        "type": "function_call",
                        "call_id": call_id,
                        "name": name,
                        "arguments": args
                    }));
                }
                output.push(json!({
                    "type": "message",
                    "role": "assistant",
                    "content": [{"type": "output_text", "text": output_text, "annotations": []}]
                }));
                let final_response = json!({
                    "id": response_id,
                    "object": "response",
                    "created_at": created,
                    "model": model,
                    "status": "completed",
                    "output": output,
                    "usage": usage
                });
                let _ = send_event(
                    &tx,
                    responses_event(
                        &mut seq,
                        "response.completed",
                        json!({"response": final_response}),
                    ),
                )
                .await;
                return Ok(());
            }
            "error" => {
                let _ = send_event(
                    &tx,
                    responses_event(&mut seq, "error", json!({"message": data})),
                )
                .await;
                return Err(AppError::bad_gateway("upstream stream error event"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// OpenAI Chat SSE -> OpenAI Responses SSE.
pub async fn stream_chat_as_responses(
    model: &str,
    upstream: reqwest::Response,
    tx: mpsc::Sender<Event>,
    recorder: UsageRecorder,
) -> AppResult<()> {
    let mut seq: u64 = 1;
    let response_id = format!("resp_{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();
    let base_response = json!({
        "id": response_id,
        "object": "response",
        "created_at": created,
        "model": model,
        "status": "in_progress",
        "output": []
    });

    let ok = send_event(
        &tx,
        responses_event(
            &mut seq,
            "response.created",
            json!({"response": base_response.clone()}),
        ),
    )
    .await
        && send_event(
            &tx,
            responses_event(
                &mut seq,
                "response.in_progress",
                json!({"response": base_response.clone()}),
            ),
        )
        .await;
    if !ok {
        return Ok(());
    }

    let message_item_id = format!("msg_{response_id}_0");
    let mut message_item_added = false;
    let mut output_text = String::new();
    let mut next_output_index: i64 = 1;
    // chat tool index -> (output index, call id, name, accumulated args)
    let mut calls: HashMap<i64, (i64, String, String, String)> = HashMap::new();
    let mut call_order: Vec<i64> = Vec::new();
    let mut usage = json!({"input_tokens": 0, "output_tokens": 0, "total_tokens": 0});

    let mut stream = upstream.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { break };
        let data = ev.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }
        let value = parse_data(data);
        recorder.record_value(&value).await;
        if let Some(u) = crate::accounting::extract_usage(&value) {
            usage = json!({
                "input_tokens": u.input_tokens,
                "output_tokens": u.output_tokens,
                "total_tokens": u.input_tokens + u.output_tokens
            });
        }

        let choice = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(Value::Null);
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                if !message_item_added {
                    message_item_added = true;
                    let item = json!({
                        "id": message_item_id,
                        "type": "message",
                        "role": "assistant",
                        "content": []
                    });
                    if !send_event(
                        &tx,
                        responses_event(
                            &mut seq,
                            "response.output_item.added",
                            json!({"output_index": 0, "item": item}),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
                output_text.push_str(text);
                if !send_event(
                    &tx,
                    responses_event(
                        &mut seq,
                        "response.output_text.delta",
                        json!({
                            "item_id": message_item_id,
                            "output_index": 0,
                            "delta": text
                        }),
                    ),
                )
                .await
                {
                    return Ok(());
                }
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tool_calls {
                let idx = tc.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
                if !calls.contains_key(&idx) {
                    let output_index = next_output_index;
                    next_output_index += 1;
                    let call_id = tc
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4()));
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    call_order.push(idx);
                    calls.insert(idx, (output_index, call_id.clone(), name.clone(), String::new()));
                    let item = json!({
                        "id": format!("fc_{call_id}"),
                        "type": "function_call",
                        "call_id": call_id,
                        "name": name,
                        "arguments": ""
                    });
                    if !send_event(
                        &tx,
                        responses_event(
                            &mut seq,
                            "response.output_item.added",
                            json!({"output_index": output_index, "item": item}),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
                let entry = calls.get_mut(&idx).expect("call entry exists");
                if let Some(name) = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                {
                    if entry.2.is_empty() {
                        entry.2 = name.to_string();
                    }
                }
                let new_args = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let suffix = if new_args.len() > entry.3.len() && new_args.starts_with(&entry.3) {
                    let s = new_args[entry.3.len()..].to_string();
                    entry.3 = new_args.to_string();
                    s
                } else {
                    entry.3.push_str(new_args);
                    new_args.to_string()
                };
                if !suffix.is_empty() {
                    let (output_index, call_id, _, _) = calls.get(&idx).cloned().expect("entry");
                    if !send_event(
                        &tx,
                        responses_event(
                            &mut seq,
                            "response.function_call_arguments.delta",
                            json!({
                                "item_id": format!("fc_{call_id}"),
                                "output_index": output_index,
                                "delta": suffix
                            }),
                        ),
                    )
                    .await
                    {
                        return Ok(());
                    }
                }
            }
        }
    }

    // finalize: close tool calls, close message item, complete the response
    let mut output: Vec<Value> = Vec::new();
    if message_item_added || !output_text.is_empty() || call_order.is_empty() {
        let item = json!({
            "id": message_item_id,
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": output_text, "annotations": []}]
        });
        let _ = send_event(
            &tx,
            responses_event(
                &mut seq,
                "response.output_text.done",
                json!({"item_id": message_item_id, "output_index": 0, "text": output_text}),
            ),
        )
        .await;
        let _ = send_event(
            &tx,
            responses_event(
                &mut seq,
                "response.output_item.done",
                json!({"output_index": 0, "item": item.clone()}),
            ),
        )
        .await;
        output.push(item);
    }
    for idx in &call_order {
        let Some((output_index, call_id, name, args)) = calls.get(idx).cloned() else {
            continue;
        };
        let item = json!({
            "id": format!("fc_{call_id}"),
            "type": "function_call",
            "call_id": call_id,
            "name": name,
            "arguments": args
        });
        let _ = send_event(
            &tx,
            responses_event(
                &mut seq,
                "response.function_call_arguments.done",
                json!({
                    "item_id": format!("fc_{call_id}"),
                    "output_index": output_index,
                    "arguments": args
                }),
            ),
        )
        .await;
        let _ = send_event(
            &tx,
            responses_event(
                &mut seq,
                "response.output_item.done",
                json!({"output_index": output_index, "item": item.clone()}),
            ),
        )
        .await;
        output.push(item);
    }
    let final_response = json!({
        "id": response_id,
        "object": "response",
        "created_at": created,
        "model": model,
        "status": "completed",
        "output": output,
        "usage": usage
    });
    let _ = send_event(
        &tx,
        responses_event(
            &mut seq,
            "response.completed",
            json!({"response": final_response}),
        ),
    )
    .await;
    Ok(())
}
