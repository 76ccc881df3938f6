//! Tagged tool blocks
//!
//! A tool block is the inline representation of one or more tool calls and
//! their results inside message text:
//!
//! ```text
//! \n<tool-call toolkey=3 name="search">##Tool Calls:<b64>##Tool Result:<b64></tool-call>\n
//! ```
//!
//! Payloads are the base64 of the compact JSON serialization. The renderer is
//! shared by the live dispatcher and by offline reconstruction, so a block
//! streamed live and the same block rebuilt from persisted rows are
//! byte-identical.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;

pub const TOOL_CALLS_MARKER: &str = "##Tool Calls:";
pub const TOOL_RESULT_MARKER: &str = "##Tool Result:";
pub const CLOSE_TAG: &str = "</tool-call>\n";

/// Name summary shown on the opening tag
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockName {
    Known(String),
    /// Every call was anonymous; resolved from the result that closes the block
    Unresolved,
}

impl BlockName {
    /// Distinct non-empty names, in first-seen order, joined with `", "`.
    pub fn summarize<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut seen: Vec<&str> = Vec::new();
        for name in names {
            if !name.is_empty() && !seen.contains(&name) {
                seen.push(name);
            }
        }
        if seen.is_empty() {
            BlockName::Unresolved
        } else {
            BlockName::Known(seen.join(", "))
        }
    }
}

/// Encode a JSON payload the way the renderer expects it
pub fn encode_payload(value: &Value) -> String {
    BASE64.encode(value.to_string())
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Opening {
        key: u64,
        name: BlockName,
        calls: Vec<String>,
    },
    Result(String),
}

/// A pending tool block: opening tags and results, rendered in arrival order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolBlock {
    segments: Vec<Segment>,
    /// Name of the latest result, used to display unresolved openings before the fold
    hint: Option<String>,
}

impl ToolBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new opening tag
    pub fn open(&mut self, key: u64, name: BlockName) {
        self.segments.push(Segment::Opening {
            key,
            name,
            calls: Vec::new(),
        });
    }

    /// Append a call payload to the latest opening
    pub fn push_calls(&mut self, calls: &Value) {
        let latest = self
            .segments
            .iter_mut()
            .rev()
            .find_map(|segment| match segment {
                Segment::Opening { calls, .. } => Some(calls),
                Segment::Result(_) => None,
            });
        if let Some(latest) = latest {
            latest.push(encode_payload(calls));
        }
    }

    /// Results are kept even when no opening precedes them
    pub fn push_result(&mut self, result: &Value, name: &str) {
        self.segments.push(Segment::Result(encode_payload(result)));
        if !name.is_empty() {
            self.hint = Some(name.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn render_body(&self, resolved: Option<&str>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Opening { key, name, calls } => {
                    let name = match name {
                        BlockName::Known(name) => name.as_str(),
                        BlockName::Unresolved => resolved.unwrap_or(""),
                    };
                    out.push_str(&format!("\n<tool-call toolkey={} name=\"{}\">", key, name));
                    for call in calls {
                        out.push_str(TOOL_CALLS_MARKER);
                        out.push_str(call);
                    }
                }
                Segment::Result(result) => {
                    out.push_str(TOOL_RESULT_MARKER);
                    out.push_str(result);
                }
            }
        }
        out
    }

    /// Text of a block still waiting for results. The opening tag is left unterminated.
    pub fn render_open(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        self.render_body(self.hint.as_deref())
    }

    /// Final text of a complete block; unresolved names take `resolved_name`
    pub fn close(&self, resolved_name: &str) -> String {
        let mut out = self.render_body(Some(resolved_name));
        out.push_str(CLOSE_TAG);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summarize_dedupes_and_skips_anonymous() {
        let name = BlockName::summarize(["search", "", "fetch", "search"]);
        assert_eq!(name, BlockName::Known("search, fetch".to_string()));
        assert_eq!(BlockName::summarize(["", ""]), BlockName::Unresolved);
    }

    #[test]
    fn test_encode_payload_is_base64_of_compact_json() {
        let encoded = encode_payload(&json!("42"));
        assert_eq!(BASE64.decode(encoded).unwrap(), b"\"42\"");
    }

    #[test]
    fn test_render_open_is_unterminated() {
        let mut block = ToolBlock::new();
        block.open(0, BlockName::Known("search".into()));
        block.push_calls(&json!([{"name": "search"}]));
        let text = block.render_open();
        assert!(text.starts_with("\n<tool-call toolkey=0 name=\"search\">##Tool Calls:"));
        assert!(!text.contains("</tool-call>"));
    }

    #[test]
    fn test_close_resolves_unresolved_name() {
        let mut block = ToolBlock::new();
        block.open(7, BlockName::Unresolved);
        block.push_calls(&json!([{"name": ""}]));
        block.push_result(&json!("ok"), "lookup");
        let text = block.close("lookup");
        assert!(text.contains("toolkey=7 name=\"lookup\""));
        assert!(text.ends_with("</tool-call>\n"));
        assert_eq!(text.matches(TOOL_RESULT_MARKER).count(), 1);
    }

    #[test]
    fn test_known_name_is_not_overwritten_by_result_name() {
        let mut block = ToolBlock::new();
        block.open(1, BlockName::Known("%name%".into()));
        let text = block.close("other");
        assert!(text.contains("name=\"%name%\""));
    }

    #[test]
    fn test_result_without_opening_is_rendered_in_order() {
        let mut block = ToolBlock::new();
        block.push_result(&json!("late"), "");
        assert!(!block.is_empty());
        block.open(2, BlockName::Known("next".into()));
        block.push_calls(&json!([{"name": "next"}]));
        let text = block.render_open();
        let expected = format!(
            "{}{}\n<tool-call toolkey=2 name=\"next\">{}{}",
            TOOL_RESULT_MARKER,
            encode_payload(&json!("late")),
            TOOL_CALLS_MARKER,
            encode_payload(&json!([{"name": "next"}]))
        );
        assert_eq!(text, expected);
    }
}
