use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found_error", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "api_error", message)
    }
}

/// Error kind for the canonical envelopes, derived from the HTTP status.
pub fn error_kind_for_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        404 => "not_found_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "api_error",
    }
}

/// OpenAI-style envelope: `{"error":{"type":...,"message":...}}`.
pub fn openai_error_body(status: StatusCode, message: &str) -> Value {
    json!({
        "error": {
            "type": error_kind_for_status(status),
            "message": message,
        }
    })
}

/// Anthropic-style envelope: `{"type":"error","error":{"type":...,"message":...}}`.
pub fn anthropic_error_body(status: StatusCode, message: &str) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": error_kind_for_status(status),
            "message": message,
        }
    })
}

/// Pull a human-readable message out of an upstream error body. Falls back to
/// the raw body for small non-JSON payloads.
pub fn extract_upstream_error_message(body: &[u8]) -> String {
    let fallback = "Upstream request failed".to_string();
    if body.is_empty() {
        return fallback;
    }
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            return msg.to_string();
        }
        if let Some(msg) = value
            .get("errors")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            return msg.to_string();
        }
        if let Some(msg) = value
            .get("message")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            return msg.to_string();
        }
        if let Some(msg) = value
            .get("error")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            return msg.to_string();
        }
        return fallback;
    }
    if body.len() <= 500 {
        if let Ok(text) = std::str::from_utf8(body) {
            return text.to_string();
        }
    }
    fallback
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "type": self.code,
                "message": self.message,
            }
        });
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_follows_status() {
        assert_eq!(
            error_kind_for_status(StatusCode::NOT_FOUND),
            "not_found_error"
        );
        assert_eq!(
            error_kind_for_status(StatusCode::TOO_MANY_REQUESTS),
            "rate_limit_error"
        );
        assert_eq!(
            error_kind_for_status(StatusCode::UNPROCESSABLE_ENTITY),
            "invalid_request_error"
        );
        assert_eq!(error_kind_for_status(StatusCode::BAD_GATEWAY), "api_error");
    }

    #[test]
    fn upstream_message_extraction_prefers_error_object() {
        let body = br#"{"error":{"message":"model overloaded"}}"#;
        assert_eq!(extract_upstream_error_message(body), "model overloaded");

        let body = br#"{"message":"plain"}"#;
        assert_eq!(extract_upstream_error_message(body), "plain");

        let body = b"service unavailable";
        assert_eq!(extract_upstream_error_message(body), "service unavailable");
    }
}
