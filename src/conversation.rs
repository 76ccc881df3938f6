use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Marker appended to a rate-limited error message; the renderer swaps it for a dedicated widget
pub const RATE_LIMIT_MARKER: &str = "\n\n<rate-limit-exceeded></rate-limit-exceeded>";

const TITLE_LIMIT: usize = 40;

/// Conversation title as shown in the window, cut to 40 characters
pub fn display_title(title: &str) -> String {
    if title.chars().count() <= TITLE_LIMIT {
        return title.to_string();
    }
    let cut: String = title.chars().take(TITLE_LIMIT).collect();
    format!("{}...", cut)
}

/// Resource usage snapshot attached to assistant messages
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    #[serde(default)]
    pub total_run_time: f64,
    #[serde(default)]
    pub time_to_first_token: f64,
    #[serde(default)]
    pub tokens_per_second: f64,
    #[serde(default)]
    pub user_token: u64,
    #[serde(default)]
    pub custom_prompt_token: u64,
    #[serde(default)]
    pub system_prompt_token: u64,
    #[serde(default)]
    pub langchain_token: u64,
    #[serde(default)]
    pub mcp_tool_prompt_token: u64,
}

/// File attached to a user message
#[derive(Clone, Debug, PartialEq)]
pub enum Attachment {
    /// Local path or URL; resolved to bytes through the file reader before upload
    Reference(String),
    /// Payload already in memory
    Inline { name: String, data: Bytes },
}

impl Attachment {
    pub fn name(&self) -> &str {
        match self {
            Attachment::Reference(path) => path
                .rsplit(&['/', '\\'][..])
                .next()
                .filter(|name| !name.is_empty())
                .unwrap_or("file"),
            Attachment::Inline { name, .. } => name,
        }
    }
}

/// A display-ready chat message
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub is_sent: bool,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub files: Vec<Attachment>,
    pub resource_usage: Option<ResourceUsage>,
    pub is_error: bool,
    pub is_rate_limit_exceeded: bool,
}

impl Message {
    pub fn user(id: String, text: impl Into<String>, files: Vec<Attachment>) -> Self {
        Self {
            id,
            text: text.into(),
            is_sent: true,
            timestamp: Utc::now().timestamp_millis(),
            files,
            resource_usage: None,
            is_error: false,
            is_rate_limit_exceeded: false,
        }
    }

    /// Empty assistant placeholder that the stream fills in
    pub fn assistant(id: String) -> Self {
        Self {
            is_sent: false,
            ..Self::user(id, "", Vec::new())
        }
    }

    pub fn error(id: String, text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::assistant(id).with_text(text)
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

/// Message-list operations used by the dispatcher and the engine
pub trait MessageList {
    /// Mirror the accumulator onto the last message
    fn set_last_text(&mut self, text: String);

    /// Write server-issued ids onto the latest user (second-to-last) and assistant (last) messages
    fn backfill_ids(&mut self, user_id: Option<&str>, assistant_id: Option<&str>);

    /// Drop the message with `id` and everything after it, returning the dropped message
    fn truncate_from(&mut self, id: &str) -> Option<Message>;

    /// Replace the text of message `id` and drop everything after it
    fn edit_and_truncate(&mut self, id: &str, text: &str) -> Option<Message>;
}

impl MessageList for Vec<Message> {
    fn set_last_text(&mut self, text: String) {
        if let Some(last) = self.last_mut() {
            last.text = text;
        }
    }

    fn backfill_ids(&mut self, user_id: Option<&str>, assistant_id: Option<&str>) {
        let len = self.len();
        if let Some(id) = user_id {
            if len >= 2 {
                self[len - 2].id = id.to_string();
            }
        }
        if let Some(id) = assistant_id {
            if let Some(last) = self.last_mut() {
                last.id = id.to_string();
            }
        }
    }

    fn truncate_from(&mut self, id: &str) -> Option<Message> {
        let index = self.iter().position(|m| m.id == id)?;
        self.drain(index..).next()
    }

    fn edit_and_truncate(&mut self, id: &str, text: &str) -> Option<Message> {
        let index = self.iter().position(|m| m.id == id)?;
        self.truncate(index + 1);
        let edited = &mut self[index];
        edited.text = text.to_string();
        Some(edited.clone())
    }
}
