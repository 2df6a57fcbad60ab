use crate::backends::Backend;
use crate::users::{User, UserStore};
use crate::wire::Usage;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Extract token usage from a response body or stream event. The usage object
/// may sit at the top level, under `response` (Responses API events) or under
/// `message` (Anthropic message_start). Claude-shaped fields win over
/// OpenAI-shaped ones, which win over Gemini-shaped counts.
pub fn extract_usage(value: &Value) -> Option<Usage> {
    let usage = value
        .get("usage")
        .or_else(|| value.get("response").and_then(|r| r.get("usage")))
        .or_else(|| value.get("message").and_then(|m| m.get("usage")))?;
    let obj = usage.as_object()?;
    if obj.is_empty() {
        return None;
    }

    let get = |key: &str| obj.get(key).and_then(|v| v.as_u64());

    let mut input_tokens = get("input_tokens")
        .or_else(|| get("prompt_tokens"))
        .unwrap_or(0);
    if input_tokens == 0 {
        if let Some(prompt_count) = get("promptTokenCount") {
            let cached = get("cachedContentTokenCount").unwrap_or(0);
            input_tokens = prompt_count.saturating_sub(cached);
        }
    }

    let output_tokens = get("output_tokens")
        .or_else(|| get("completion_tokens"))
        .or_else(|| get("candidatesTokenCount"))
        .unwrap_or(0);

    let cache_read_input_tokens = get("cache_read_input_tokens")
        .or_else(|| {
            obj.get("input_tokens_details")
                .or_else(|| obj.get("prompt_tokens_details"))
                .and_then(|d| d.get("cached_tokens"))
                .and_then(|v| v.as_u64())
        })
        .or_else(|| get("cachedContentTokenCount"))
        .unwrap_or(0);

    let mut cache_creation_input_tokens = get("cache_creation_input_tokens").unwrap_or(0);
    let mut cache_ttl = None;
    if let Some(creation) = obj.get("cache_creation").and_then(|v| v.as_object()) {
        let five_min = creation
            .get("ephemeral_5m_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let one_hour = creation
            .get("ephemeral_1h_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if cache_creation_input_tokens == 0 {
            cache_creation_input_tokens = five_min + one_hour;
        }
        cache_ttl = match (five_min > 0, one_hour > 0) {
            (true, true) => Some("mixed".to_string()),
            (true, false) => Some("5m".to_string()),
            (false, true) => Some("1h".to_string()),
            (false, false) => None,
        };
    }

    let reasoning_tokens = get("reasoning_tokens")
        .or_else(|| {
            obj.get("output_tokens_details")
                .or_else(|| obj.get("completion_tokens_details"))
                .and_then(|d| d.get("reasoning_tokens"))
                .and_then(|v| v.as_u64())
        })
        .unwrap_or(0);

    Some(Usage {
        input_tokens,
        output_tokens,
        cache_read_input_tokens,
        cache_creation_input_tokens,
        cache_ttl,
        reasoning_tokens,
    })
}

/// Last-writer-wins accumulator for usage seen while a stream is relayed.
/// A later sighting only replaces the held one when its total is at least as
/// large, so partial interim counts never shadow the terminal event.
#[derive(Clone, Default)]
pub struct UsageRecorder {
    inner: Arc<Mutex<Option<Usage>>>,
}

impl UsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, usage: Option<Usage>) {
        let Some(usage) = usage else { return };
        let mut guard = self.inner.lock().await;
        let replace = match guard.as_ref() {
            Some(existing) => {
                usage.input_tokens + usage.output_tokens
                    >= existing.input_tokens + existing.output_tokens
            }
            None => true,
        };
        if replace {
            *guard = Some(usage);
        }
    }

    pub async fn record_value(&self, value: &Value) {
        self.record(extract_usage(value)).await;
    }

    pub async fn peek(&self) -> Option<Usage> {
        self.inner.lock().await.clone()
    }

    pub async fn take(&self) -> Option<Usage> {
        self.inner.lock().await.take()
    }
}

/// Debit the caller once and append the usage log. Missing usage debits zero
/// tokens; the log row is still written so request rates stay auditable.
pub async fn settle(
    users: &UserStore,
    user: Option<&User>,
    backend: &Backend,
    usage: Option<&Usage>,
) {
    let Some(user) = user else { return };
    let (input_tokens, output_tokens) = match usage {
        Some(u) => (u.input_tokens as i64, u.output_tokens as i64),
        None => (0, 0),
    };
    if let Err(err) = users
        .add_usage(
            &user.username,
            input_tokens,
            output_tokens,
            backend.input_price,
            backend.output_price,
        )
        .await
    {
        tracing::warn!(user = %user.username, "usage debit failed: {err}");
    }
    if let Err(err) = users
        .record_usage_log(
            &user.username,
            &backend.id,
            &backend.provider,
            input_tokens,
            output_tokens,
            backend.input_price,
            backend.output_price,
        )
        .await
    {
        tracing::warn!(user = %user.username, "usage log failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_fields_take_precedence() {
        let usage = extract_usage(&json!({
            "usage": {
                "input_tokens": 10,
                "output_tokens": 5,
                "prompt_tokens": 99,
                "completion_tokens": 99
            }
        }))
        .expect("usage");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn openai_and_gemini_aliases() {
        let usage = extract_usage(&json!({
            "usage": {"prompt_tokens": 100, "completion_tokens": 40}
        }))
        .expect("usage");
        assert_eq!((usage.input_tokens, usage.output_tokens), (100, 40));

        let usage = extract_usage(&json!({
            "usage": {
                "promptTokenCount": 50,
                "cachedContentTokenCount": 20,
                "candidatesTokenCount": 7
            }
        }))
        .expect("usage");
        assert_eq!(usage.input_tokens, 30);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.cache_read_input_tokens, 20);
    }

    #[test]
    fn cache_creation_breakdown_sets_ttl() {
        let usage = extract_usage(&json!({
            "usage": {
                "input_tokens": 1,
                "output_tokens": 1,
                "cache_creation": {
                    "ephemeral_5m_input_tokens": 3,
                    "ephemeral_1h_input_tokens": 4
                }
            }
        }))
        .expect("usage");
        assert_eq!(usage.cache_creation_input_tokens, 7);
        assert_eq!(usage.cache_ttl.as_deref(), Some("mixed"));

        let usage = extract_usage(&json!({
            "usage": {
                "input_tokens": 1,
                "output_tokens": 1,
                "cache_creation": {"ephemeral_1h_input_tokens": 4}
            }
        }))
        .expect("usage");
        assert_eq!(usage.cache_ttl.as_deref(), Some("1h"));
    }

    #[test]
    fn nested_usage_locations() {
        assert!(extract_usage(&json!({
            "response": {"usage": {"input_tokens": 2, "output_tokens": 1}}
        }))
        .is_some());
        assert!(extract_usage(&json!({
            "message": {"usage": {"input_tokens": 2, "output_tokens": 1}}
        }))
        .is_some());
        assert!(extract_usage(&json!({"data": 1})).is_none());
    }

    #[tokio::test]
    async fn recorder_keeps_largest_total() {
        let recorder = UsageRecorder::new();
        recorder
            .record_value(&json!({"usage": {"input_tokens": 10, "output_tokens": 0}}))
            .await;
        recorder
            .record_value(&json!({"usage": {"input_tokens": 1, "output_tokens": 1}}))
            .await;
        let usage = recorder.take().await.expect("usage");
        assert_eq!((usage.input_tokens, usage.output_tokens), (10, 0));
    }
}
