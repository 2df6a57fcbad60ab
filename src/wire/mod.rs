use serde_json::Value;
use std::collections::HashMap;

pub mod decode;
pub mod encode;

/// Internal request form shared by all three wire formats. Each entry format
/// decodes into this, each upstream format encodes out of it.
#[derive(Debug, Clone, Default)]
pub struct GatewayRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: Option<bool>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_output_tokens: Option<u64>,
    pub reasoning_effort: Option<String>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub tool_choice: Option<ToolChoice>,
    /// Raw `metadata` object; forwarded only when the backend opts in.
    pub metadata: Option<Value>,
    /// Raw Anthropic `thinking` config; forwarded only when the backend opts in.
    pub thinking: Option<Value>,
    /// Unrecognized top-level fields, merged back on encode.
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            parts: Vec::new(),
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        let mut msg = Self::new(role);
        msg.parts.push(Part::Text { text: text.into() });
        msg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            "developer" => Role::Developer,
            "tool" => Role::Tool,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Part {
    Text {
        text: String,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
    Image {
        url: String,
        detail: Option<String>,
    },
    /// `arguments` is always the serialized JSON string.
    ToolCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        call_id: String,
        is_error: bool,
        content: String,
    },
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// "auto" | "none" | "required"
    Mode(String),
    /// Force one named function.
    Function(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Other(String),
}

impl FinishReason {
    pub fn from_chat(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn from_anthropic(raw: &str) -> Self {
        match raw {
            "end_turn" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "tool_use" => FinishReason::ToolCalls,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn as_anthropic(&self) -> &str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ToolCalls => "tool_use",
            FinishReason::Other(s) => s,
        }
    }

    pub fn as_chat(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Other(s) => s,
        }
    }
}

/// Token usage of one request, normalized across the wire formats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    /// "5m" | "1h" | "mixed" when the cache-creation breakdown is known.
    pub cache_ttl: Option<String>,
    pub reasoning_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub id: String,
    pub model: String,
    pub message: Message,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

/// Map a client-side reasoning effort onto the Responses scale.
pub fn map_reasoning_effort(effort: &str) -> &'static str {
    match effort.trim().to_ascii_lowercase().as_str() {
        "minimal" => "low",
        "low" => "low",
        "medium" => "medium",
        "high" | "xhigh" => "high",
        "none" => "none",
        _ => "auto",
    }
}

/// Concatenated text parts of a message.
pub fn text_of(parts: &[Part]) -> String {
    let mut out = String::new();
    for part in parts {
        if let Part::Text { text } = part {
            out.push_str(text);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_round_trips() {
        assert_eq!(FinishReason::from_chat("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_chat("stop").as_anthropic(), "end_turn");
        assert_eq!(FinishReason::from_chat("length").as_anthropic(), "max_tokens");
        assert_eq!(
            FinishReason::from_chat("tool_calls").as_anthropic(),
            "tool_use"
        );
        assert_eq!(
            FinishReason::from_anthropic("tool_use").as_chat(),
            "tool_calls"
        );
        // unknown reasons pass through untouched
        assert_eq!(
            FinishReason::from_chat("content_filter").as_anthropic(),
            "content_filter"
        );
    }

    #[test]
    fn effort_mapping() {
        assert_eq!(map_reasoning_effort("minimal"), "low");
        assert_eq!(map_reasoning_effort("xhigh"), "high");
        assert_eq!(map_reasoning_effort("medium"), "medium");
        assert_eq!(map_reasoning_effort("whatever"), "auto");
    }
}
