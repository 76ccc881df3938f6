use serde_json::Value;

use crate::tool_block::{BlockName, ToolBlock};

/// Pending tool block plus its result counters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolScope {
    block: ToolBlock,
    pub result_count: usize,
    pub result_total: usize,
}

impl ToolScope {
    pub fn is_open(&self) -> bool {
        !self.block.is_empty()
    }

    /// Text of the open block, empty when nothing is pending
    pub fn block_text(&self) -> String {
        self.block.render_open()
    }

    /// Record a result. Returns the folded block text once the count reaches the total.
    fn record_result(&mut self, result: &Value, name: &str) -> Option<String> {
        self.block.push_result(result, name);
        self.result_count += 1;
        if self.result_count != self.result_total {
            return None;
        }
        let folded = self.block.close(name);
        *self = ToolScope::default();
        Some(folded)
    }
}

/// In-progress buffers backing a streaming session
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Accumulator {
    pub current_text: String,
    /// Primary turn tool calls
    pub tools: ToolScope,
    /// Nested sub-agent tool calls
    pub agent: ToolScope,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, text: &str) {
        self.current_text.push_str(text);
    }

    /// Open a primary block for one `tool_calls` event; the total becomes the call count of this turn
    pub fn open_tool_calls(&mut self, key: u64, name: BlockName, calls: &Value, call_count: usize) {
        self.tools.block.open(key, name);
        self.tools.block.push_calls(calls);
        self.tools.result_total = call_count;
    }

    /// Returns true when the result completed the block and it was folded into `current_text`
    pub fn push_tool_result(&mut self, result: &Value, name: &str) -> bool {
        match self.tools.record_result(result, name) {
            Some(folded) => {
                self.current_text.push_str(&folded);
                true
            }
            None => false,
        }
    }

    /// Each sub-agent call opens its own tag and raises the agent total by one
    pub fn open_agent_call(&mut self, key: u64, name: &str, args: &Value) {
        self.agent.block.open(key, BlockName::summarize([name]));
        self.agent.block.push_calls(args);
        self.agent.result_total += 1;
    }

    pub fn push_agent_result(&mut self, result: &Value, name: &str) -> bool {
        match self.agent.record_result(result, name) {
            Some(folded) => {
                self.current_text.push_str(&folded);
                true
            }
            None => false,
        }
    }

    /// What the last message should show: folded text followed by any open blocks
    pub fn display_text(&self) -> String {
        let mut text = self.current_text.clone();
        text.push_str(&self.tools.block_text());
        text.push_str(&self.agent.block_text());
        text
    }
}
