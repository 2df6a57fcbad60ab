use axum::http::StatusCode;
use serde_json::Value;
use std::time::Duration;

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_RESPONSES_BASE_URL: &str = "https://chatgpt.com/backend-api";

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// DNS, TLS, connect/reset, timeout — the request never completed.
    Network,
    /// The upstream answered with a non-2xx status.
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
    /// Raw error body, passed through untouched for the caller to re-wrap.
    pub body: Vec<u8>,
}

impl UpstreamCallError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Network,
            status: None,
            message: message.into(),
            body: Vec::new(),
        }
    }

    pub fn http(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            kind: UpstreamErrorKind::Http,
            status: Some(status),
            message: format!("upstream status {status}"),
            body,
        }
    }

    /// Transient failures quarantine the backend: timeouts, network errors,
    /// 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            UpstreamErrorKind::Network => true,
            UpstreamErrorKind::Http => match self.status {
                Some(status) => status.as_u16() == 429 || status.as_u16() >= 500,
                None => false,
            },
        }
    }
}

pub fn network_error_from_reqwest(err: &reqwest::Error) -> UpstreamCallError {
    if err.is_timeout() {
        UpstreamCallError::network(format!("upstream timeout: {err}"))
    } else {
        UpstreamCallError::network(format!("upstream request: {err}"))
    }
}

fn trim_base(base_url: &str) -> String {
    let mut base = base_url.trim().to_string();
    if base.ends_with('#') {
        base.pop();
    }
    base.trim_end_matches('/').to_string()
}

/// `<base>/v1/messages`, tolerating bases that already carry the suffix.
pub fn anthropic_messages_url(base_url: &str) -> String {
    let base = trim_base(base_url);
    let base = if base.is_empty() {
        DEFAULT_ANTHROPIC_BASE_URL.to_string()
    } else {
        base
    };
    let lower = base.to_ascii_lowercase();
    if lower.ends_with("/messages") {
        base
    } else if lower.ends_with("/v1") {
        format!("{base}/messages")
    } else {
        format!("{base}/v1/messages")
    }
}

/// `<base>/v1/chat/completions`, same suffix tolerance.
pub fn chat_completions_url(base_url: &str) -> String {
    let base = trim_base(base_url);
    let base = if base.is_empty() {
        DEFAULT_OPENAI_BASE_URL.to_string()
    } else {
        base
    };
    let lower = base.to_ascii_lowercase();
    if lower.ends_with("/chat/completions") {
        base
    } else if lower.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// Candidate URLs for the Responses API, tried in order; the caller advances
/// to the next candidate only on HTTP 404. Gateways disagree on whether the
/// path is rooted at `/v1`, so both spellings are offered.
pub fn responses_candidate_urls(base_url: &str) -> Vec<String> {
    let base = trim_base(base_url);
    let base = if base.is_empty() {
        DEFAULT_RESPONSES_BASE_URL.to_string()
    } else {
        base
    };

    let mut urls: Vec<String> = Vec::new();
    let mut push = |u: String| {
        if !urls.contains(&u) {
            urls.push(u);
        }
    };

    let lower = base.to_ascii_lowercase();
    let version_suffix = regex::Regex::new(r"/v\d+[a-z]*$").expect("version suffix pattern");
    if lower.ends_with("/responses") {
        push(base.clone());
    } else if lower.ends_with("/v1") {
        push(format!("{base}/responses"));
        let stripped = base.trim_end_matches("/v1").trim_end_matches('/');
        push(format!("{stripped}/v1/responses"));
        push(format!("{stripped}/responses"));
    } else if version_suffix.is_match(&lower) {
        push(format!("{base}/responses"));
        if let Some(idx) = base.rfind('/') {
            push(format!("{}/v1/responses", &base[..idx]));
        }
    } else {
        push(format!("{base}/v1/responses"));
        push(format!("{base}/responses"));
    }
    urls
}

fn build_request(
    client: &reqwest::Client,
    url: &str,
    interface: &str,
    api_key: &str,
    stream: bool,
    body: &Value,
) -> reqwest::RequestBuilder {
    let mut req = client
        .post(url)
        .timeout(UPSTREAM_TIMEOUT)
        .header("Content-Type", "application/json")
        .header(
            "Accept",
            if stream {
                "text/event-stream"
            } else {
                "application/json"
            },
        )
        .json(body);
    let api_key = api_key.trim();
    if interface == "anthropic" {
        req = req.header("anthropic-version", ANTHROPIC_VERSION);
        if !api_key.is_empty() {
            req = req.header("x-api-key", api_key);
        }
    } else if !api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {api_key}"));
    }
    req
}

/// POST the body to the interface's endpoint and hand back the raw response.
/// 2xx responses are returned as-is (the caller decides buffered vs
/// streaming); everything else becomes an `UpstreamCallError`.
pub async fn call(
    client: &reqwest::Client,
    interface: &str,
    base_url: &str,
    api_key: &str,
    stream: bool,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    let urls = match interface {
        "anthropic" => vec![anthropic_messages_url(base_url)],
        "openai_responses" => responses_candidate_urls(base_url),
        _ => vec![chat_completions_url(base_url)],
    };

    let mut last_not_found: Option<UpstreamCallError> = None;
    let total = urls.len();
    for (i, url) in urls.iter().enumerate() {
        tracing::debug!(url = %url, attempt = i + 1, total, stream, "upstream call");
        let resp = build_request(client, url, interface, api_key, stream, body)
            .send()
            .await
            .map_err(|err| network_error_from_reqwest(&err))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let status_code =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let body_bytes = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        let err = UpstreamCallError::http(status_code, body_bytes);
        if status.as_u16() == 404 && i + 1 < total {
            last_not_found = Some(err);
            continue;
        }
        return Err(err);
    }
    Err(last_not_found
        .unwrap_or_else(|| UpstreamCallError::network("no upstream url candidates")))
}

/// Buffered variant: 2xx body parsed as JSON.
pub async fn call_json(
    client: &reqwest::Client,
    interface: &str,
    base_url: &str,
    api_key: &str,
    body: &Value,
) -> Result<Value, UpstreamCallError> {
    let resp = call(client, interface, base_url, api_key, false, body).await?;
    let status = resp.status();
    let text = resp
        .bytes()
        .await
        .map_err(|err| network_error_from_reqwest(&err))?;
    serde_json::from_slice(&text).map_err(|err| {
        let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        UpstreamCallError {
            kind: UpstreamErrorKind::Http,
            status: Some(status),
            message: format!("invalid upstream json: {err}"),
            body: text.to_vec(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_url_suffixes() {
        assert_eq!(
            anthropic_messages_url("https://a.com"),
            "https://a.com/v1/messages"
        );
        assert_eq!(
            anthropic_messages_url("https://a.com/v1"),
            "https://a.com/v1/messages"
        );
        assert_eq!(
            anthropic_messages_url("https://a.com/v1/messages/"),
            "https://a.com/v1/messages"
        );
        assert_eq!(
            anthropic_messages_url("https://a.com/api/messages"),
            "https://a.com/api/messages"
        );
    }

    #[test]
    fn chat_url_suffixes() {
        assert_eq!(
            chat_completions_url("https://o.com"),
            "https://o.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("https://o.com/v1"),
            "https://o.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("https://o.com/v1/chat/completions"),
            "https://o.com/v1/chat/completions"
        );
    }

    #[test]
    fn responses_candidates_prefer_base_shape() {
        assert_eq!(
            responses_candidate_urls("https://r.com/v1"),
            vec![
                "https://r.com/v1/responses".to_string(),
                "https://r.com/responses".to_string(),
            ]
        );
        assert_eq!(
            responses_candidate_urls("https://r.com"),
            vec![
                "https://r.com/v1/responses".to_string(),
                "https://r.com/responses".to_string(),
            ]
        );
        assert_eq!(
            responses_candidate_urls("https://r.com/v1/responses"),
            vec!["https://r.com/v1/responses".to_string()]
        );
        // trailing # and / are stripped
        assert_eq!(
            responses_candidate_urls("https://r.com/backend-api/#"),
            vec![
                "https://r.com/backend-api/v1/responses".to_string(),
                "https://r.com/backend-api/responses".to_string(),
            ]
        );
    }

    #[test]
    fn transient_classification() {
        assert!(UpstreamCallError::network("reset").is_transient());
        assert!(UpstreamCallError::http(StatusCode::TOO_MANY_REQUESTS, vec![]).is_transient());
        assert!(UpstreamCallError::http(StatusCode::BAD_GATEWAY, vec![]).is_transient());
        assert!(!UpstreamCallError::http(StatusCode::BAD_REQUEST, vec![]).is_transient());
        assert!(!UpstreamCallError::http(StatusCode::NOT_FOUND, vec![]).is_transient());
    }
}
