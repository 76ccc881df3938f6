use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conversation::ResourceUsage;
use crate::error::{ChatError, Result};

/// Literal prefix of every frame line in the response body
pub const FRAME_PREFIX: &str = "data: ";

/// Payload that ends the stream before the connection closes
pub const DONE_SENTINEL: &str = "[DONE]";

/// Tool result name that signals the backend installed a new tool server
pub const ADD_TOOL_SERVER: &str = "add_mcp_server";

/// Outer JSON object of a `data: ` line.
///
/// `message` is itself a JSON document (a string holding a [`StreamEvent`]).
#[derive(Debug, Deserialize)]
struct FrameEnvelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    /// Backend-level failure carried in the outer envelope; ends the stream
    Error(String),
}

impl Frame {
    /// Decode the payload that follows the `data: ` prefix.
    pub fn parse(payload: &str) -> Result<Frame> {
        let envelope: FrameEnvelope = serde_json::from_str(payload)?;
        if let Some(error) = envelope.error.filter(|e| !e.is_empty()) {
            return Ok(Frame::Error(error));
        }
        let message = envelope
            .message
            .ok_or_else(|| ChatError::Stream("frame carries neither message nor error".into()))?;
        let event: StreamEvent = serde_json::from_str(&message)?;
        Ok(Frame::Event(event))
    }
}

/// Typed inner event, `{type, content}` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum StreamEvent {
    Text(String),
    ToolCalls(Vec<ToolCallContent>),
    ToolCallProgress(Value),
    ToolResult(ToolResultContent),
    ChatInfo(ChatInfoContent),
    MessageInfo(MessageInfoContent),
    Interactive(InteractiveContent),
    TokenUsage(TokenUsageContent),
    Error(ErrorContent),
    AgentToolCall(AgentToolCallContent),
    AgentToolResult(AgentToolResultContent),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Text(_) => "text",
            StreamEvent::ToolCalls(_) => "tool_calls",
            StreamEvent::ToolCallProgress(_) => "tool_call_progress",
            StreamEvent::ToolResult(_) => "tool_result",
            StreamEvent::ChatInfo(_) => "chat_info",
            StreamEvent::MessageInfo(_) => "message_info",
            StreamEvent::Interactive(_) => "interactive",
            StreamEvent::TokenUsage(_) => "token_usage",
            StreamEvent::Error(_) => "error",
            StreamEvent::AgentToolCall(_) => "agent_tool_call",
            StreamEvent::AgentToolResult(_) => "agent_tool_result",
        }
    }
}

/// One call inside a `tool_calls` event. Anonymous calls carry an empty name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolCallContent {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultContent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInfoContent {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfoContent {
    #[serde(rename = "userMessageId", default)]
    pub user_message_id: Option<String>,
    #[serde(rename = "assistantMessageId", default)]
    pub assistant_message_id: Option<String>,
}

/// `interactive` sub-protocol payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum InteractiveContent {
    AuthenticationRequired(AuthenticationRequired),
    ElicitationRequest(ElicitationRequestContent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationRequired {
    pub server_name: String,
    pub auth_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationRequestContent {
    pub request_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub requested_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageContent {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub user_token: u64,
    #[serde(default)]
    pub custom_prompt_token: u64,
    #[serde(default)]
    pub system_prompt_token: u64,
    #[serde(default)]
    pub time_to_first_token: f64,
    #[serde(default)]
    pub tokens_per_second: f64,
}

impl From<&TokenUsageContent> for ResourceUsage {
    fn from(usage: &TokenUsageContent) -> Self {
        Self {
            model: usage.model_name.clone(),
            total_input_tokens: usage.input_tokens,
            total_output_tokens: usage.output_tokens,
            user_token: usage.user_token,
            custom_prompt_token: usage.custom_prompt_token,
            system_prompt_token: usage.system_prompt_token,
            time_to_first_token: usage.time_to_first_token,
            tokens_per_second: usage.tokens_per_second,
            total_run_time: 0.0,
            ..ResourceUsage::default()
        }
    }
}

/// Backend-declared error; `kind` is the sub-kind such as `rate_limit_exceeded`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContent {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Error sub-kind that gets a dedicated marker in the message text
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentToolCallContent {
    #[serde(rename = "toolCallId", default)]
    pub tool_call_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentToolResultContent {
    #[serde(rename = "toolCallId", default)]
    pub tool_call_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub result: Value,
}

// ==============================================================================
// Request bodies
// ==============================================================================

#[derive(Debug, Serialize)]
pub struct RetryRequest {
    #[serde(rename = "chatId")]
    pub chat_id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

/// User decision on an elicitation form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Serialize)]
pub struct ElicitationRespondRequest {
    pub request_id: String,
    pub action: ElicitationAction,
    pub content: Option<Value>,
}

// ==============================================================================
// Persisted conversation (offline path)
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawRole {
    User,
    Assistant,
    ToolCall,
    ToolResult,
}

/// One persisted row as returned by `GET /chat/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "messageId", default)]
    pub message_id: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub content: String,
    pub role: RawRole,
    /// Tool name on `tool_result` rows, when the backend stores it
    #[serde(default)]
    pub name: String,
    #[serde(rename = "toolCalls", default)]
    pub tool_calls: Option<Value>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl RawRow {
    /// An assistant row is a tool-call carrier when `toolCalls` is a non-empty array or object
    pub fn has_tool_calls(&self) -> bool {
        match &self.tool_calls {
            Some(Value::Array(calls)) => !calls.is_empty(),
            Some(Value::Object(calls)) => !calls.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatDetail {
    pub chat: ChatSummary,
    #[serde(default)]
    pub messages: Vec<RawRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatDetailResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<ChatDetail>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event: Value) -> String {
        json!({ "message": event.to_string() }).to_string()
    }

    #[test]
    fn test_parse_text_frame() {
        let frame = Frame::parse(&envelope(json!({"type": "text", "content": "Hi"}))).unwrap();
        assert_eq!(frame, Frame::Event(StreamEvent::Text("Hi".to_string())));
    }

    #[test]
    fn test_parse_outer_error() {
        let frame = Frame::parse(r#"{"error": "model unavailable"}"#).unwrap();
        assert_eq!(frame, Frame::Error("model unavailable".to_string()));
    }

    #[test]
    fn test_parse_tool_calls_keeps_anonymous_calls() {
        let payload = envelope(json!({
            "type": "tool_calls",
            "content": [
                {"name": "search", "arguments": {"q": "rust"}},
                {"name": "", "arguments": {}}
            ]
        }));
        match Frame::parse(&payload).unwrap() {
            Frame::Event(StreamEvent::ToolCalls(calls)) => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].name, "search");
                assert!(calls[1].name.is_empty());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_encoding_omits_absent_fields() {
        let call: ToolCallContent = serde_json::from_value(json!({"id": "c1"})).unwrap();
        assert_eq!(serde_json::to_value(&call).unwrap(), json!({"id": "c1"}));

        let named = ToolCallContent::new("search", json!({"q": 1}));
        assert_eq!(
            serde_json::to_value(&named).unwrap(),
            json!({"name": "search", "arguments": {"q": 1}})
        );
    }

    #[test]
    fn test_parse_interactive_elicitation() {
        let payload = envelope(json!({
            "type": "interactive",
            "content": {
                "type": "elicitation_request",
                "content": {
                    "request_id": "r1",
                    "message": "Pick one",
                    "requested_schema": {"type": "object"}
                }
            }
        }));
        match Frame::parse(&payload).unwrap() {
            Frame::Event(StreamEvent::Interactive(InteractiveContent::ElicitationRequest(req))) => {
                assert_eq!(req.request_id, "r1");
                assert_eq!(req.message, "Pick one");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_token_usage_camel_case() {
        let payload = envelope(json!({
            "type": "token_usage",
            "content": {"modelName": "gpt", "inputTokens": 10, "outputTokens": 4}
        }));
        match Frame::parse(&payload).unwrap() {
            Frame::Event(StreamEvent::TokenUsage(usage)) => {
                let snapshot = ResourceUsage::from(&usage);
                assert_eq!(snapshot.model, "gpt");
                assert_eq!(snapshot.total_input_tokens, 10);
                assert_eq!(snapshot.total_output_tokens, 4);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type_is_an_error() {
        let payload = envelope(json!({"type": "telemetry", "content": {}}));
        assert!(Frame::parse(&payload).is_err());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(Frame::parse("{not json").is_err());
        assert!(Frame::parse(r#"{"message": "{broken"}"#).is_err());
    }

    #[test]
    fn test_elicitation_respond_body_serializes_null_content() {
        let body = ElicitationRespondRequest {
            request_id: "r1".to_string(),
            action: ElicitationAction::Decline,
            content: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            json!({"request_id": "r1", "action": "decline", "content": null})
        );
    }
}
