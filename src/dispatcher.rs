//! Event dispatcher.
//!
//! Folds decoded frames into the owning session. The fold itself is pure: it
//! only touches the session passed in and returns the side effects the engine
//! must run afterwards (tool reload, identity binding, interactive prompts).

use serde_json::Value;
use tracing::{debug, warn};

use crate::accumulator::Accumulator;
use crate::conversation::{Message, MessageList, ResourceUsage, RATE_LIMIT_MARKER};
use crate::protocol::{
    ChatInfoContent, ErrorContent, Frame, InteractiveContent, StreamEvent, ToolCallContent,
    ADD_TOOL_SERVER, RATE_LIMIT_EXCEEDED,
};
use crate::session::Session;
use crate::tool_block::BlockName;

/// Work the engine performs after a frame has been folded
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// A tool server was added; refresh the external tool registry
    ReloadTools,
    /// Server-assigned identity and title
    ChatInfo(ChatInfoContent),
    Interactive(InteractiveContent),
    /// The backend failed the whole request; stop reading
    EndStream,
}

/// Fold one frame into `session`.
pub fn dispatch(session: &mut Session, frame: &Frame) -> Vec<Effect> {
    match frame {
        Frame::Error(message) => {
            let id = session.next_message_id();
            session.messages.pop();
            session
                .messages
                .push(Message::error(id, format!("Error: {}", message)));
            vec![Effect::EndStream]
        }
        Frame::Event(event) => dispatch_event(session, event),
    }
}

fn dispatch_event(session: &mut Session, event: &StreamEvent) -> Vec<Effect> {
    let mut effects = Vec::new();
    match event {
        StreamEvent::Text(text) => {
            accumulator(session).push_text(text);
            flush(session);
        }
        StreamEvent::ToolCalls(calls) => open_tool_calls(session, calls),
        StreamEvent::ToolCallProgress(_) => {}
        StreamEvent::ToolResult(result) => {
            if result.name == ADD_TOOL_SERVER {
                effects.push(Effect::ReloadTools);
            }
            let acc = accumulator(session);
            if !acc.tools.is_open() {
                debug!(tool = %result.name, "tool result without pending calls");
            }
            acc.push_tool_result(&result.result, &result.name);
            flush(session);
        }
        StreamEvent::ChatInfo(info) => effects.push(Effect::ChatInfo(info.clone())),
        StreamEvent::MessageInfo(info) => {
            session.messages.backfill_ids(
                info.user_message_id.as_deref(),
                info.assistant_message_id.as_deref(),
            );
        }
        StreamEvent::Interactive(content) => effects.push(Effect::Interactive(content.clone())),
        StreamEvent::TokenUsage(usage) => {
            if let Some(last) = session.messages.last_mut() {
                last.resource_usage = Some(ResourceUsage::from(usage));
            }
        }
        StreamEvent::Error(error) => apply_error(session, error),
        StreamEvent::AgentToolCall(call) => {
            let key = session.next_tool_key();
            accumulator(session).open_agent_call(key, &call.name, &call.args);
            flush(session);
        }
        StreamEvent::AgentToolResult(result) => {
            let acc = accumulator(session);
            if !acc.agent.is_open() {
                debug!(tool = %result.name, "agent result without pending call");
            }
            acc.push_agent_result(&result.result, &result.name);
            flush(session);
        }
    }
    effects
}

fn accumulator(session: &mut Session) -> &mut Accumulator {
    session.accumulator.get_or_insert_with(Accumulator::new)
}

/// Mirror the accumulator onto the last message
fn flush(session: &mut Session) {
    let text = session
        .accumulator
        .as_ref()
        .map(Accumulator::display_text)
        .unwrap_or_default();
    session.messages.set_last_text(text);
}

fn open_tool_calls(session: &mut Session, calls: &[ToolCallContent]) {
    if calls.is_empty() {
        debug!("empty tool_calls event");
        return;
    }
    let name = BlockName::summarize(calls.iter().map(|call| call.name.as_str()));
    let payload = match serde_json::to_value(calls) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to encode tool calls");
            Value::Array(Vec::new())
        }
    };
    let key = session.next_tool_key();
    accumulator(session).open_tool_calls(key, name, &payload, calls.len());
    flush(session);
}

fn apply_error(session: &mut Session, error: &ErrorContent) {
    let rate_limited = error.kind == RATE_LIMIT_EXCEEDED;
    let acc = accumulator(session);
    acc.push_text(&format!("\n\n{}", error.message));
    if rate_limited {
        acc.push_text(RATE_LIMIT_MARKER);
    }
    flush(session);
    if let Some(last) = session.messages.last_mut() {
        last.is_error = true;
        last.is_rate_limit_exceeded |= rate_limited;
    }
}
