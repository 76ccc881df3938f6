//! Rebuild display messages from persisted rows.
//!
//! Tool calls and results are paired with the same tagged-block renderer the
//! live dispatcher uses, so a conversation looks the same whether it was
//! streamed or loaded.

use chrono::Utc;
use serde_json::Value;

use crate::conversation::{Attachment, Message};
use crate::protocol::{RawRole, RawRow};
use crate::tool_block::{BlockName, ToolBlock};

#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub messages: Vec<Message>,
    /// First tool key not used by a rebuilt block
    pub next_tool_key: u64,
}

#[derive(Default)]
struct Replay {
    messages: Vec<Message>,
    calls: Vec<Value>,
    results: Vec<(Value, String)>,
    next_tool_key: u64,
    fallback_id: u64,
}

impl Replay {
    fn message_from(&mut self, row: &RawRow, text: &str) -> Message {
        let id = if !row.message_id.is_empty() {
            row.message_id.clone()
        } else if !row.id.is_empty() {
            row.id.clone()
        } else {
            self.fallback_id += 1;
            self.fallback_id.to_string()
        };
        let timestamp = row
            .created_at
            .map(|at| at.timestamp_millis())
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        Message {
            id,
            text: text.to_string(),
            is_sent: row.role == RawRole::User,
            timestamp,
            files: row.files.iter().cloned().map(Attachment::Reference).collect(),
            resource_usage: row.resource_usage.clone(),
            is_error: false,
            is_rate_limit_exceeded: false,
        }
    }

    fn last_is_sent(&self) -> bool {
        self.messages.last().map(|m| m.is_sent).unwrap_or(true)
    }

    fn fold_block(&mut self) {
        let mut names = Vec::new();
        for call in &self.calls {
            collect_names(call, &mut names);
        }
        let name = BlockName::summarize(names.iter().map(String::as_str));

        let mut block = ToolBlock::new();
        block.open(self.next_tool_key, name);
        self.next_tool_key += 1;
        for call in &self.calls {
            block.push_calls(call);
        }
        for (result, name) in &self.results {
            block.push_result(result, name);
        }
        // anonymous calls take the name of the result that completes the block
        let resolved = self.results.last().map(|(_, name)| name.as_str()).unwrap_or("");
        let text = block.close(resolved);
        if let Some(last) = self.messages.last_mut() {
            last.text.push_str(&text);
        }
        self.calls.clear();
        self.results.clear();
    }

    fn apply(&mut self, row: &RawRow, next: Option<&RawRow>) {
        if row.role == RawRole::User {
            let message = self.message_from(row, &row.content);
            self.messages.push(message);
            return;
        }

        let last_sent = self.last_is_sent();
        if !last_sent {
            if let Some(last) = self.messages.last_mut() {
                last.files
                    .extend(row.files.iter().cloned().map(Attachment::Reference));
            }
        }

        match row.role {
            RawRole::User => {}
            RawRole::ToolCall => {
                self.calls.push(parse_payload(&row.content));
                if last_sent {
                    let message = self.message_from(row, "");
                    self.messages.push(message);
                }
            }
            RawRole::ToolResult => {
                self.results.push((parse_payload(&row.content), row.name.clone()));
                if next.map(|n| n.role) == Some(RawRole::ToolResult) {
                    return;
                }
                if last_sent {
                    let message = self.message_from(row, "");
                    self.messages.push(message);
                }
                self.fold_block();
            }
            RawRole::Assistant if row.has_tool_calls() => {
                if last_sent {
                    let message = self.message_from(row, &row.content);
                    self.messages.push(message);
                } else if !row.content.is_empty() && self.calls.is_empty() {
                    self.append_to_last(row);
                }
                if let Some(calls) = &row.tool_calls {
                    self.calls.push(calls.clone());
                }
            }
            RawRole::Assistant => {
                if last_sent {
                    let message = self.message_from(row, &row.content);
                    self.messages.push(message);
                } else {
                    self.append_to_last(row);
                }
            }
        }
    }

    fn append_to_last(&mut self, row: &RawRow) {
        if let Some(last) = self.messages.last_mut() {
            last.text.push_str(&row.content);
            last.resource_usage = row.resource_usage.clone();
        }
    }
}

/// Persisted payloads are JSON text; anything else is kept as a plain string
fn parse_payload(content: &str) -> Value {
    serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()))
}

/// Call names in a stored payload: an array of calls, a single call, or a map of call arrays
fn collect_names(payload: &Value, names: &mut Vec<String>) {
    match payload {
        Value::Array(calls) => {
            for call in calls {
                collect_names(call, names);
            }
        }
        Value::Object(map) => match map.get("name") {
            Some(Value::String(name)) => names.push(name.clone()),
            Some(_) => {}
            None => {
                for value in map.values().filter(|v| v.is_array()) {
                    collect_names(value, names);
                }
            }
        },
        _ => {}
    }
}

/// Replay persisted rows into display messages.
pub fn reconstruct(rows: &[RawRow]) -> Reconstruction {
    let mut replay = Replay::default();
    for (index, row) in rows.iter().enumerate() {
        replay.apply(row, rows.get(index + 1));
    }
    Reconstruction {
        messages: replay.messages,
        next_tool_key: replay.next_tool_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ResourceUsage;
    use crate::tool_block::{encode_payload, CLOSE_TAG, TOOL_RESULT_MARKER};
    use serde_json::json;

    fn row(id: &str, role: RawRole, content: &str) -> RawRow {
        RawRow {
            id: id.to_string(),
            message_id: String::new(),
            created_at: None,
            content: content.to_string(),
            role,
            name: String::new(),
            tool_calls: None,
            resource_usage: None,
            files: Vec::new(),
        }
    }

    #[test]
    fn test_plain_conversation() {
        let rows = vec![
            row("u1", RawRole::User, "hello"),
            row("a1", RawRole::Assistant, "Hi there"),
        ];
        let rebuilt = reconstruct(&rows);
        assert_eq!(rebuilt.messages.len(), 2);
        assert!(rebuilt.messages[0].is_sent);
        assert_eq!(rebuilt.messages[1].text, "Hi there");
        assert!(!rebuilt.messages[1].is_sent);
        assert_eq!(rebuilt.next_tool_key, 0);
    }

    #[test]
    fn test_message_id_preferred_over_row_id() {
        let mut user = row("row-1", RawRole::User, "hello");
        user.message_id = "msg-1".into();
        let rebuilt = reconstruct(&[user]);
        assert_eq!(rebuilt.messages[0].id, "msg-1");
    }

    #[test]
    fn test_tool_rows_fold_into_one_block() {
        let rows = vec![
            row("u1", RawRole::User, "find it"),
            row("c1", RawRole::ToolCall, r#"[{"name":"search","arguments":{"q":"x"}}]"#),
            row("r1", RawRole::ToolResult, r#""first""#),
            row("r2", RawRole::ToolResult, r#""second""#),
            row("a1", RawRole::Assistant, "Found."),
        ];
        let rebuilt = reconstruct(&rows);
        assert_eq!(rebuilt.messages.len(), 2);
        let text = &rebuilt.messages[1].text;
        assert!(text.starts_with("\n<tool-call toolkey=0 name=\"search\">"));
        assert_eq!(text.matches(TOOL_RESULT_MARKER).count(), 2);
        assert!(text.contains(&encode_payload(&json!("second"))));
        assert!(text.ends_with(&format!("{}Found.", CLOSE_TAG)));
        assert_eq!(rebuilt.next_tool_key, 1);
    }

    #[test]
    fn test_assistant_tool_call_carrier_keeps_text() {
        let mut carrier = row("a1", RawRole::Assistant, "Let me check.");
        carrier.tool_calls = Some(json!([{"name": "fetch", "arguments": {}}]));
        carrier.resource_usage = Some(ResourceUsage {
            model: "m".into(),
            ..ResourceUsage::default()
        });
        let rows = vec![
            row("u1", RawRole::User, "go"),
            carrier,
            row("r1", RawRole::ToolResult, "not json"),
        ];
        let rebuilt = reconstruct(&rows);
        assert_eq!(rebuilt.messages.len(), 2);
        let text = &rebuilt.messages[1].text;
        assert!(text.starts_with("Let me check.\n<tool-call toolkey=0 name=\"fetch\">"));
        assert!(text.contains(&encode_payload(&json!("not json"))));
        assert_eq!(rebuilt.messages[1].resource_usage.as_ref().unwrap().model, "m");
    }

    #[test]
    fn test_files_merge_into_assistant_message() {
        let mut answer = row("a1", RawRole::Assistant, "done");
        answer.files = vec!["/tmp/out.png".into()];
        let mut first = row("a0", RawRole::Assistant, "working ");
        first.files = vec!["/tmp/log.txt".into()];
        let rebuilt = reconstruct(&[row("u1", RawRole::User, "go"), first, answer]);
        assert_eq!(rebuilt.messages.len(), 2);
        assert_eq!(rebuilt.messages[1].text, "working done");
        // the row that opens a message keeps its own files, later rows merge theirs
        assert_eq!(rebuilt.messages[1].files.len(), 2);
    }

    #[test]
    fn test_map_shaped_tool_calls_collect_names() {
        let mut names = Vec::new();
        collect_names(
            &json!({"agent": [{"name": "a"}, {"name": "b"}], "other": "x"}),
            &mut names,
        );
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_anonymous_calls_take_result_row_name() {
        let mut result = row("r1", RawRole::ToolResult, r#""ok""#);
        result.name = "lookup".into();
        let rows = vec![
            row("u1", RawRole::User, "go"),
            row("c1", RawRole::ToolCall, r#"[{"name":"","arguments":{}}]"#),
            result,
        ];
        let rebuilt = reconstruct(&rows);
        assert!(rebuilt.messages[1]
            .text
            .starts_with("\n<tool-call toolkey=0 name=\"lookup\">"));

        let unnamed = reconstruct(&[
            row("u1", RawRole::User, "go"),
            row("c1", RawRole::ToolCall, r#"[{"name":""}]"#),
            row("r1", RawRole::ToolResult, r#""ok""#),
        ]);
        assert!(unnamed.messages[1].text.contains("name=\"\""));
    }
}
