//! Classified protocol events.

use serde_json::Value;
use tether_api::TokenUsage;

/// What a content block holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    /// A block type this adapter does not render.
    Other(String),
}

/// Incremental payload of a `content_block_delta`.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text(String),
    PartialJson(String),
    Thinking(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Success,
    Error,
}

/// One block of a complete assistant message.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotBlock {
    Text(String),
    Thinking(String),
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    SessionInit {
        resume_id: String,
        model: Option<String>,
        tools: Vec<String>,
    },
    MessageStart {
        message_id: Option<String>,
        initial_usage: TokenUsage,
    },
    ContentBlockStart {
        index: usize,
        kind: BlockKind,
        tool_id: Option<String>,
        tool_name: Option<String>,
        initial_input: Option<Value>,
        initial_text: Option<String>,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        usage_delta: TokenUsage,
    },
    MessageStop {
        final_usage: Option<TokenUsage>,
    },
    ToolResult {
        tool_id: String,
        /// Display text extracted from the result content.
        content: String,
        /// The result content exactly as received.
        raw: Value,
        is_error: bool,
    },
    TurnResult {
        status: TurnStatus,
        cost_usd: Option<f64>,
        error_text: Option<String>,
        /// Session id reported alongside the result.
        resume_id: Option<String>,
    },
    ErrorEvent {
        kind: String,
        message: String,
    },
    /// A complete assistant message, sent by agents that do not stream.
    AssistantSnapshot {
        message_id: Option<String>,
        blocks: Vec<SnapshotBlock>,
        usage: Option<TokenUsage>,
    },
    /// The agent repeating the user's prompt back.
    UserEcho {
        text: String,
    },
    /// Anything else; carried so it can be logged.
    Other {
        kind: String,
    },
}

impl ProtocolEvent {
    /// Short name for logs.
    pub fn name(&self) -> &str {
        match self {
            ProtocolEvent::SessionInit { .. } => "session_init",
            ProtocolEvent::MessageStart { .. } => "message_start",
            ProtocolEvent::ContentBlockStart { .. } => "content_block_start",
            ProtocolEvent::ContentBlockDelta { .. } => "content_block_delta",
            ProtocolEvent::ContentBlockStop { .. } => "content_block_stop",
            ProtocolEvent::MessageDelta { .. } => "message_delta",
            ProtocolEvent::MessageStop { .. } => "message_stop",
            ProtocolEvent::ToolResult { .. } => "tool_result",
            ProtocolEvent::TurnResult { .. } => "result",
            ProtocolEvent::ErrorEvent { .. } => "error",
            ProtocolEvent::AssistantSnapshot { .. } => "assistant",
            ProtocolEvent::UserEcho { .. } => "user",
            ProtocolEvent::Other { kind } => kind,
        }
    }
}
