use crate::backend_state::BackendState;
use crate::backends::{Backend, BackendStore, ComboItem};
use crate::error::{AppError, AppResult};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub backend: Backend,
    pub used_cache: bool,
}

/// Returns true when any keyword appears as a bang token in `text`: the
/// literal `!<kw>` followed by end-of-string, whitespace, or Unicode
/// punctuation/symbol. Matching is case-sensitive; keywords that do not start
/// with `!` are ignored.
pub fn has_bang_keyword(text: &str, keywords: &[String]) -> bool {
    for kw in keywords {
        let kw = kw.trim();
        if kw.is_empty() || !kw.starts_with('!') {
            continue;
        }
        let base = &kw[1..];
        let pattern = if base.is_empty() {
            r"!($|[\s\p{P}\p{S}])".to_string()
        } else {
            format!(r"!{}($|[\s\p{{P}}\p{{S}}])", regex::escape(base))
        };
        let Ok(re) = regex::Regex::new(&pattern) else {
            continue;
        };
        if re.is_match(text) {
            return true;
        }
    }
    false
}

/// Pick one member from the eligible combo items: keyword hits win among the
/// heaviest items, otherwise the highest weight wins. Sorts a local copy; the
/// caller's slice is never reordered.
pub fn choose_combo_backend(items: &[ComboItem], input_text: &str) -> Option<String> {
    let mut sorted: Vec<&ComboItem> = items
        .iter()
        .filter(|it| !it.backend_id.trim().is_empty())
        .collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));

    let text = input_text.trim();
    for item in &sorted {
        if item.keywords.is_empty() {
            continue;
        }
        if has_bang_keyword(text, &item.keywords) {
            return Some(item.backend_id.trim().to_string());
        }
    }
    Some(sorted[0].backend_id.trim().to_string())
}

/// Resolve the target backend for a request.
///
/// Order: conversation cache, combo selection, direct id; the Responses
/// surface additionally falls back over the whole registry when a direct id
/// misses. `format_filter` restricts which interfaces the calling endpoint
/// can serve.
pub async fn resolve_target<F>(
    backends: &BackendStore,
    state: &BackendState,
    requested_id: &str,
    conversation_id: &str,
    first_user_text: &str,
    format_filter: F,
    allow_fallback: bool,
) -> AppResult<RouteOutcome>
where
    F: Fn(&Backend) -> bool,
{
    let requested_id = requested_id.trim();

    // 1) conversation cache
    if !conversation_id.is_empty() {
        if let Some(cached_id) = state.lookup_conversation(conversation_id).await {
            if let Ok(Some(backend)) = backends.get(&cached_id).await {
                if backend.enabled
                    && !state.is_quarantined(&backend.id).await
                    && format_filter(&backend)
                {
                    tracing::debug!(
                        conversation = conversation_id,
                        backend = %backend.id,
                        "using pinned backend"
                    );
                    return Ok(RouteOutcome {
                        backend,
                        used_cache: true,
                    });
                }
            }
            state.unpin_conversation(conversation_id).await;
        }
    }

    // 2) combo resolution
    let is_combo = backends
        .is_combo(requested_id)
        .await
        .map_err(|err| AppError::bad_gateway(err))?;
    if is_combo {
        let combo = backends
            .get_combo(requested_id)
            .await
            .map_err(|err| AppError::bad_gateway(err))?
            .ok_or_else(|| AppError::not_found(format!("Unknown model: {requested_id}")))?;
        if !combo.enabled {
            return Err(AppError::invalid_request(format!(
                "Model disabled: {requested_id}"
            )));
        }
        let mut eligible = Vec::new();
        for item in &combo.items {
            let backend_id = item.backend_id.trim();
            if backend_id.is_empty() {
                continue;
            }
            let Ok(Some(backend)) = backends.get(backend_id).await else {
                continue;
            };
            if !backend.enabled
                || state.is_quarantined(&backend.id).await
                || !format_filter(&backend)
            {
                continue;
            }
            eligible.push(item.clone());
        }
        if eligible.is_empty() {
            return Err(AppError::invalid_request("combo has no available backends"));
        }
        let chosen_id = choose_combo_backend(&eligible, first_user_text)
            .ok_or_else(|| AppError::invalid_request("combo has no selectable items"))?;
        let backend = backends
            .get(&chosen_id)
            .await
            .map_err(|err| AppError::bad_gateway(err))?
            .ok_or_else(|| {
                AppError::invalid_request(format!("combo item backend not found: {chosen_id}"))
            })?;
        if !conversation_id.is_empty() {
            state.pin_conversation(conversation_id, &backend.id).await;
        }
        tracing::debug!(combo = requested_id, backend = %backend.id, "combo selected");
        return Ok(RouteOutcome {
            backend,
            used_cache: false,
        });
    }

    // 3) direct backend
    match backends.get(requested_id).await.map_err(|err| AppError::bad_gateway(err))? {
        Some(backend) => {
            if backend.enabled
                && !state.is_quarantined(&backend.id).await
                && format_filter(&backend)
            {
                return Ok(RouteOutcome {
                    backend,
                    used_cache: false,
                });
            }
            if allow_fallback {
                if let Some(fallback) =
                    pick_fallback(backends, state, requested_id, &format_filter).await?
                {
                    return Ok(RouteOutcome {
                        backend: fallback,
                        used_cache: false,
                    });
                }
            }
            if !backend.enabled {
                Err(AppError::invalid_request(format!(
                    "Model disabled: {}",
                    backend.id
                )))
            } else if state.is_quarantined(&backend.id).await {
                Err(AppError::invalid_request(format!(
                    "Model temporarily disabled: {}",
                    backend.id
                )))
            } else {
                Err(AppError::invalid_request(format!(
                    "Model not served on this endpoint: {}",
                    backend.id
                )))
            }
        }
        None => {
            if allow_fallback {
                if let Some(fallback) =
                    pick_fallback(backends, state, requested_id, &format_filter).await?
                {
                    return Ok(RouteOutcome {
                        backend: fallback,
                        used_cache: false,
                    });
                }
            }
            Err(AppError::not_found(format!("Unknown model: {requested_id}")))
        }
    }
}

/// Fallback for the Responses surface: among all usable backends prefer an
/// `upstream_id` match for the requested id (case-insensitive, keeps client
/// model ids portable), then `operator_id = codex`, then lexicographic id.
async fn pick_fallback<F>(
    backends: &BackendStore,
    state: &BackendState,
    requested_id: &str,
    format_filter: &F,
) -> AppResult<Option<Backend>>
where
    F: Fn(&Backend) -> bool,
{
    let all = backends.list().await.map_err(|err| AppError::bad_gateway(err))?;
    let mut candidates = Vec::new();
    for backend in all {
        if !backend.enabled
            || state.is_quarantined(&backend.id).await
            || !format_filter(&backend)
        {
            continue;
        }
        candidates.push(backend);
    }
    if candidates.is_empty() {
        return Ok(None);
    }
    if let Some(hit) = candidates
        .iter()
        .find(|b| b.upstream_id.trim().eq_ignore_ascii_case(requested_id.trim()))
    {
        return Ok(Some(hit.clone()));
    }
    candidates.sort_by(|a, b| {
        let a_codex = a.operator_id.trim().eq_ignore_ascii_case("codex");
        let b_codex = b.operator_id.trim().eq_ignore_ascii_case("codex");
        b_codex
            .cmp(&a_codex)
            .then_with(|| a.id.trim().cmp(b.id.trim()))
    });
    Ok(candidates.into_iter().next())
}

/// Conversation identity, from `metadata.user_id` in all three formats.
pub fn metadata_user_id(payload: &Value) -> String {
    payload
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}

/// Latest user turn from an Anthropic or Chat Completions `messages` array,
/// used for keyword routing. String content is taken as-is; block arrays
/// concatenate their text blocks.
pub fn messages_input_text(payload: &Value) -> String {
    let Some(msgs) = payload.get("messages").and_then(|v| v.as_array()) else {
        return String::new();
    };
    for msg in msgs.iter().rev() {
        let Some(obj) = msg.as_object() else { continue };
        let role = obj.get("role").and_then(|v| v.as_str()).unwrap_or("");
        if !role.trim().eq_ignore_ascii_case("user") {
            continue;
        }
        match obj.get("content") {
            Some(Value::String(s)) => return s.trim().to_string(),
            Some(Value::Array(blocks)) => {
                let mut out = String::new();
                for block in blocks {
                    let Some(bobj) = block.as_object() else { continue };
                    let btype = bobj.get("type").and_then(|v| v.as_str()).unwrap_or("");
                    if !btype.is_empty() && btype != "text" {
                        continue;
                    }
                    if let Some(text) = bobj.get("text").and_then(|v| v.as_str()) {
                        let text = text.trim();
                        if text.is_empty() {
                            continue;
                        }
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                }
                return out;
            }
            _ => return String::new(),
        }
    }
    String::new()
}

/// Latest user turn from a Responses `input` (string or item list).
pub fn responses_input_text(payload: &Value) -> String {
    match payload.get("input") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => {
            for item in items.iter().rev() {
                let Some(obj) = item.as_object() else { continue };
                let role = obj.get("role").and_then(|v| v.as_str()).unwrap_or("");
                if !role.is_empty() && !role.trim().eq_ignore_ascii_case("user") {
                    continue;
                }
                let text = responses_content_text(obj.get("content"));
                if !text.is_empty() {
                    return text;
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}

fn responses_content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(blocks)) => {
            let mut out = String::new();
            for block in blocks {
                let Some(obj) = block.as_object() else { continue };
                let btype = obj.get("type").and_then(|v| v.as_str()).unwrap_or("");
                if !btype.is_empty()
                    && !btype.eq_ignore_ascii_case("input_text")
                    && !btype.eq_ignore_ascii_case("text")
                {
                    continue;
                }
                let Some(text) = obj.get("text").and_then(|v| v.as_str()) else {
                    continue;
                };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
            out
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(backend_id: &str, weight: f64, keywords: &[&str]) -> ComboItem {
        ComboItem {
            backend_id: backend_id.to_string(),
            weight,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn bang_keyword_requires_boundary() {
        let kws = vec!["!think".to_string()];
        assert!(has_bang_keyword("please !think about it", &kws));
        assert!(has_bang_keyword("!think", &kws));
        assert!(has_bang_keyword("!think.", &kws));
        assert!(!has_bang_keyword("!thinker", &kws));
        assert!(!has_bang_keyword("think about it", &kws));
        // case-sensitive
        assert!(!has_bang_keyword("!Think about it", &kws));
    }

    #[test]
    fn keywords_without_bang_prefix_are_ignored() {
        assert!(!has_bang_keyword("fast mode", &["fast".to_string()]));
    }

    #[test]
    fn combo_keyword_hit_beats_weight() {
        let items = vec![
            item("cheap", 1.0, &[]),
            item("smart", 0.5, &["!think"]),
        ];
        assert_eq!(
            choose_combo_backend(&items, "please !think about it").as_deref(),
            Some("smart")
        );
        assert_eq!(
            choose_combo_backend(&items, "just do it").as_deref(),
            Some("cheap")
        );
    }

    #[test]
    fn combo_selection_does_not_reorder_input() {
        let items = vec![item("a", 0.1, &[]), item("b", 9.0, &[])];
        let before: Vec<String> = items.iter().map(|i| i.backend_id.clone()).collect();
        assert_eq!(choose_combo_backend(&items, "").as_deref(), Some("b"));
        let after: Vec<String> = items.iter().map(|i| i.backend_id.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn input_text_takes_last_user_turn() {
        let payload = json!({
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": [
                    {"type": "text", "text": "second"},
                    {"type": "image", "source": {}}
                ]}
            ]
        });
        assert_eq!(messages_input_text(&payload), "second");
    }

    #[test]
    fn responses_input_text_handles_both_shapes() {
        assert_eq!(
            responses_input_text(&json!({"input": "  hello "})),
            "hello"
        );
        let payload = json!({
            "input": [
                {"type": "message", "role": "user", "content": [
                    {"type": "input_text", "text": "weather?"}
                ]}
            ]
        });
        assert_eq!(responses_input_text(&payload), "weather?");
    }

    #[test]
    fn metadata_user_id_is_trimmed() {
        let payload = json!({"metadata": {"user_id": " conv-1 "}});
        assert_eq!(metadata_user_id(&payload), "conv-1");
        assert_eq!(metadata_user_id(&json!({})), "");
    }
}
