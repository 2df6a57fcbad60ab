use crate::accounting::UsageRecorder;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// A client that stops reading for this long gets disconnected, so a dead
/// consumer can never pin an active upstream.
pub const SSE_WRITE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub const CHANNEL_CAPACITY: usize = 64;

/// Send one event to the client channel under the write deadline. Returns
/// false when the client is gone or wedged; callers stop relaying then.
pub async fn send_event(tx: &mpsc::Sender<Event>, event: Event) -> bool {
    match tokio::time::timeout(SSE_WRITE_TIMEOUT, tx.send(event)).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            tracing::warn!("sse write deadline hit, dropping client");
            false
        }
    }
}

/// Wrap the receiving half into the client-facing SSE response
/// (`text/event-stream`, keep-alive pings, no caching).
pub fn sse_response(rx: mpsc::Receiver<Event>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    response.headers_mut().insert(
        axum::http::header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-cache"),
    );
    response
}

/// Relay an upstream SSE body to the client untouched (identity-format
/// streams), recording any usage seen in `data:` payloads on the way.
/// The upstream response is dropped (closing the connection) as soon as the
/// client goes away or the write deadline fires.
pub async fn proxy_sse(
    upstream: reqwest::Response,
    tx: mpsc::Sender<Event>,
    recorder: Option<UsageRecorder>,
) {
    let mut stream = upstream.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(err) => {
                tracing::debug!("upstream sse read ended: {err}");
                break;
            }
        };
        if let Some(recorder) = &recorder {
            if ev.data.trim() != "[DONE]" {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&ev.data) {
                    recorder.record_value(&value).await;
                }
            }
        }
        let mut out = Event::default().data(ev.data);
        if !ev.event.is_empty() && ev.event != "message" {
            out = out.event(ev.event);
        }
        if !send_event(&tx, out).await {
            break;
        }
    }
}
