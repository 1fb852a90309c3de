//! Per-process transcript state machine.
//!
//! The [`Reconciler`] consumes classified events for one subprocess and turns
//! them into transcript entries. Streaming assistant text is exposed as a
//! cumulative rendering under a stable id, so observers replace by id instead
//! of appending diffs.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{Map, Value};
use tether_api::{Role, TokenUsage, ToolInput, TranscriptEntry};
use tracing::{debug, warn};

use crate::protocol::{BlockKind, Delta, ProtocolEvent, SnapshotBlock, TurnStatus};

/// Display limit for tool result content, in characters.
pub const TOOL_RESULT_DISPLAY_LIMIT: usize = 2000;

/// What to do with a user message the agent echoes back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EchoPolicy {
    /// The caller already rendered the prompt; drop the echo.
    #[default]
    Suppress,
    /// The echo is the only record of the prompt; emit it as a user entry.
    Render,
}

/// Output of the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Entry(TranscriptEntry),
    /// The agent announced (or re-announced) the id that resumes this conversation.
    SessionCaptured {
        resume_id: String,
        model: Option<String>,
    },
}

impl Emission {
    pub fn entry(&self) -> Option<&TranscriptEntry> {
        match self {
            Emission::Entry(entry) => Some(entry),
            Emission::SessionCaptured { .. } => None,
        }
    }
}

#[derive(Debug)]
enum BlockState {
    Text(String),
    Thinking(String),
    Tool {
        id: Option<String>,
        name: Option<String>,
        fragments: Vec<String>,
        initial_input: Option<Value>,
    },
}

#[derive(Debug, Default)]
pub struct Reconciler {
    echo: EchoPolicy,

    // Current message
    blocks: BTreeMap<usize, BlockState>,
    usage: TokenUsage,
    message_id: Option<String>,
    emitted_partial: bool,

    // Process lifetime
    session_seen: bool,
    resume_id: Option<String>,
    turn_finished: bool,
    /// Message ids rendered from stream events.
    streamed: HashSet<String>,
    /// Cumulative (text, thinking) of messages rendered from snapshots.
    snapshots: HashMap<String, (String, String)>,
    tool_names: HashMap<String, String>,
}

impl Reconciler {
    pub fn new(echo: EchoPolicy) -> Self {
        Self {
            echo,
            ..Default::default()
        }
    }

    /// Apply one event, returning the entries it produced in order.
    pub fn apply(&mut self, event: ProtocolEvent) -> Vec<Emission> {
        match event {
            ProtocolEvent::SessionInit {
                resume_id,
                model,
                tools,
            } => {
                if self.session_seen {
                    warn!(resume_id = %resume_id, "Ignoring duplicate session init");
                    return Vec::new();
                }
                self.session_seen = true;

                let mut summary = String::from("Session started");
                if let Some(model) = &model {
                    summary.push_str(&format!(" with {model}"));
                }
                if !tools.is_empty() {
                    summary.push_str(&format!(" ({} tools)", tools.len()));
                }

                let mut out: Vec<Emission> = self.capture(resume_id, model).into_iter().collect();
                out.push(Emission::Entry(TranscriptEntry::system(summary)));
                out
            }

            ProtocolEvent::MessageStart {
                message_id,
                initial_usage,
            } => {
                // A message that never saw its stop still gets a final entry.
                let out = self.finish_message();
                self.message_id = Some(message_id.unwrap_or_else(new_id));
                self.usage.merge(&initial_usage);
                out
            }

            ProtocolEvent::ContentBlockStart {
                index,
                kind,
                tool_id,
                tool_name,
                initial_input,
                initial_text,
            } => {
                let state = match kind {
                    BlockKind::Text => BlockState::Text(initial_text.unwrap_or_default()),
                    BlockKind::Thinking => BlockState::Thinking(initial_text.unwrap_or_default()),
                    BlockKind::ToolUse => BlockState::Tool {
                        id: tool_id,
                        name: tool_name,
                        fragments: Vec::new(),
                        initial_input,
                    },
                    BlockKind::Other(kind) => {
                        debug!(index, kind = %kind, "Ignoring content block");
                        return Vec::new();
                    }
                };
                self.blocks.insert(index, state);
                Vec::new()
            }

            ProtocolEvent::ContentBlockDelta { index, delta } => self.apply_delta(index, delta),

            ProtocolEvent::ContentBlockStop { index } => {
                if !matches!(self.blocks.get(&index), Some(BlockState::Tool { .. })) {
                    return Vec::new();
                }
                match self.blocks.remove(&index) {
                    Some(BlockState::Tool {
                        id,
                        name,
                        fragments,
                        initial_input,
                    }) => {
                        let input = resolve_tool_input(&fragments.concat(), initial_input);
                        vec![Emission::Entry(self.tool_entry(id, name, input))]
                    }
                    _ => Vec::new(),
                }
            }

            ProtocolEvent::MessageDelta { usage_delta } => {
                self.usage.merge(&usage_delta);
                Vec::new()
            }

            ProtocolEvent::MessageStop { final_usage } => {
                if let Some(usage) = final_usage {
                    self.usage.merge_max(&usage);
                }
                self.finish_message()
            }

            ProtocolEvent::ToolResult {
                tool_id,
                content,
                raw,
                is_error,
            } => {
                let mut entry = TranscriptEntry::new(
                    format!("result-{tool_id}"),
                    Role::Tool,
                    truncate_for_display(&content, TOOL_RESULT_DISPLAY_LIMIT),
                )
                .with_tool_result(raw)
                .with_error(is_error);
                entry.tool_name = self.tool_names.get(&tool_id).cloned();
                vec![Emission::Entry(entry)]
            }

            ProtocolEvent::TurnResult {
                status,
                cost_usd,
                error_text,
                resume_id,
            } => {
                let mut out = self.finish_message();
                if let Some(resume_id) = resume_id {
                    out.extend(self.capture(resume_id, None));
                }
                self.turn_finished = true;

                let entry = match status {
                    TurnStatus::Success => {
                        let summary = match cost_usd {
                            Some(cost) => format!("Turn completed (${cost:.4})"),
                            None => "Turn completed".to_string(),
                        };
                        TranscriptEntry::system(summary)
                    }
                    TurnStatus::Error => TranscriptEntry::system_error(
                        error_text.unwrap_or_else(|| "Turn failed".to_string()),
                    ),
                };
                out.push(Emission::Entry(entry.with_cost(cost_usd)));
                out
            }

            ProtocolEvent::ErrorEvent { kind, message } => {
                let text = if message.is_empty() {
                    kind
                } else {
                    format!("{kind}: {message}")
                };
                vec![Emission::Entry(TranscriptEntry::system_error(text))]
            }

            ProtocolEvent::AssistantSnapshot {
                message_id,
                blocks,
                usage,
            } => self.apply_snapshot(message_id, blocks, usage),

            ProtocolEvent::UserEcho { text } => match self.echo {
                EchoPolicy::Suppress => {
                    debug!("Suppressing user echo");
                    Vec::new()
                }
                EchoPolicy::Render => vec![Emission::Entry(TranscriptEntry::new(
                    new_id(),
                    Role::User,
                    text,
                ))],
            },

            ProtocolEvent::Other { kind } => {
                debug!(kind = %kind, "Ignoring event");
                Vec::new()
            }
        }
    }

    /// Emit whatever the current message still holds. Used when the process
    /// exits without a terminal event.
    pub fn flush(&mut self) -> Vec<Emission> {
        self.finish_message()
    }

    /// Forget everything, ready for a new process.
    pub fn reset(&mut self) {
        *self = Self::new(self.echo);
    }

    /// Whether a message is in flight.
    pub fn has_pending(&self) -> bool {
        !self.blocks.is_empty() || self.emitted_partial
    }

    /// Whether a terminal result was seen since the last reset.
    pub fn turn_finished(&self) -> bool {
        self.turn_finished
    }

    pub fn resume_id(&self) -> Option<&str> {
        self.resume_id.as_deref()
    }

    /// Usage accumulated for the current message.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn apply_delta(&mut self, index: usize, delta: Delta) -> Vec<Emission> {
        match delta {
            Delta::Text(text) => {
                match self
                    .blocks
                    .entry(index)
                    .or_insert_with(|| BlockState::Text(String::new()))
                {
                    BlockState::Text(acc) => acc.push_str(&text),
                    _ => {
                        debug!(index, "Text delta for a non-text block");
                        return Vec::new();
                    }
                }
                vec![Emission::Entry(self.render_partial())]
            }
            Delta::Thinking(text) => {
                match self
                    .blocks
                    .entry(index)
                    .or_insert_with(|| BlockState::Thinking(String::new()))
                {
                    BlockState::Thinking(acc) => acc.push_str(&text),
                    _ => {
                        debug!(index, "Thinking delta for a non-thinking block");
                        return Vec::new();
                    }
                }
                vec![Emission::Entry(self.render_partial())]
            }
            Delta::PartialJson(fragment) => {
                match self.blocks.entry(index).or_insert_with(|| BlockState::Tool {
                    id: None,
                    name: None,
                    fragments: Vec::new(),
                    initial_input: None,
                }) {
                    BlockState::Tool { fragments, .. } => fragments.push(fragment),
                    _ => debug!(index, "Input delta for a non-tool block"),
                }
                Vec::new()
            }
        }
    }

    /// Text and thinking of the current message, in block order.
    fn rendered(&self) -> (String, String) {
        let mut text = String::new();
        let mut thinking = String::new();
        for block in self.blocks.values() {
            match block {
                BlockState::Text(acc) => text.push_str(acc),
                BlockState::Thinking(acc) => thinking.push_str(acc),
                BlockState::Tool { .. } => {}
            }
        }
        (text, thinking)
    }

    fn render_partial(&mut self) -> TranscriptEntry {
        let (text, thinking) = self.rendered();
        let id = self.message_id.get_or_insert_with(new_id).clone();
        self.emitted_partial = true;
        TranscriptEntry::new(id, Role::Assistant, text)
            .with_thinking(Some(thinking))
            .partial(true)
    }

    /// Final entry for the current message, plus entries for tool blocks that
    /// never saw their stop. Clears all per-message state.
    fn finish_message(&mut self) -> Vec<Emission> {
        let (text, thinking) = self.rendered();
        let blocks = std::mem::take(&mut self.blocks);
        let usage = std::mem::take(&mut self.usage);
        let emitted_partial = std::mem::take(&mut self.emitted_partial);
        let message_id = self.message_id.take();

        let mut out = Vec::new();
        if emitted_partial || !text.is_empty() || !thinking.is_empty() {
            let id = message_id.unwrap_or_else(new_id);
            let mut entry = TranscriptEntry::new(id.clone(), Role::Assistant, text)
                .with_thinking(Some(thinking));
            if !usage.is_empty() {
                entry = entry.with_usage(usage);
            }
            self.streamed.insert(id);
            out.push(Emission::Entry(entry));
        } else if let Some(id) = message_id {
            self.streamed.insert(id);
        }

        for block in blocks.into_values() {
            if let BlockState::Tool {
                id,
                name,
                fragments,
                initial_input,
            } = block
            {
                let input = resolve_tool_input(&fragments.concat(), initial_input);
                out.push(Emission::Entry(self.tool_entry(id, name, input)));
            }
        }
        out
    }

    fn tool_entry(
        &mut self,
        id: Option<String>,
        name: Option<String>,
        input: ToolInput,
    ) -> TranscriptEntry {
        let id = id.filter(|s| !s.is_empty()).unwrap_or_else(new_id);
        let name = name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        self.tool_names.insert(id.clone(), name.clone());
        TranscriptEntry::new(id, Role::Tool, name.clone()).with_tool(name, Some(input))
    }

    fn apply_snapshot(
        &mut self,
        message_id: Option<String>,
        blocks: Vec<SnapshotBlock>,
        usage: Option<TokenUsage>,
    ) -> Vec<Emission> {
        let already_streamed = match &message_id {
            Some(id) => self.streamed.contains(id) || self.message_id.as_ref() == Some(id),
            None => self.message_id.is_some(),
        };
        if already_streamed {
            debug!(message_id = ?message_id, "Skipping snapshot of a streamed message");
            return Vec::new();
        }

        let id = message_id.unwrap_or_else(new_id);
        let mut out = Vec::new();
        let mut tools = Vec::new();
        let (text, thinking) = self.snapshots.entry(id.clone()).or_default();
        let mut grew = false;
        for block in blocks {
            match block {
                SnapshotBlock::Text(t) if !t.is_empty() => {
                    text.push_str(&t);
                    grew = true;
                }
                SnapshotBlock::Thinking(t) if !t.is_empty() => {
                    thinking.push_str(&t);
                    grew = true;
                }
                SnapshotBlock::ToolUse { id, name, input } => tools.push((id, name, input)),
                _ => {}
            }
        }

        if grew {
            let mut entry = TranscriptEntry::new(id, Role::Assistant, text.clone())
                .with_thinking(Some(thinking.clone()));
            if let Some(usage) = usage.filter(|u| !u.is_empty()) {
                entry = entry.with_usage(usage);
            }
            out.push(Emission::Entry(entry));
        }

        for (tool_id, name, input) in tools {
            let input = match input {
                Value::Object(map) => ToolInput::Parsed(map),
                other => ToolInput::Raw(other.to_string()),
            };
            out.push(Emission::Entry(self.tool_entry(Some(tool_id), Some(name), input)));
        }
        out
    }

    fn capture(&mut self, resume_id: String, model: Option<String>) -> Option<Emission> {
        if self.resume_id.as_deref() == Some(resume_id.as_str()) {
            return None;
        }
        self.resume_id = Some(resume_id.clone());
        Some(Emission::SessionCaptured { resume_id, model })
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Input of a finished tool block: the joined fragments, or the input object
/// sent with the block start when nothing was streamed.
fn resolve_tool_input(joined: &str, initial_input: Option<Value>) -> ToolInput {
    if joined.trim().is_empty() {
        return match initial_input {
            Some(Value::Object(map)) => ToolInput::Parsed(map),
            _ => ToolInput::Parsed(Map::new()),
        };
    }
    let input = ToolInput::parse(joined);
    if input.is_raw() {
        debug!(len = joined.len(), "Tool input is not a JSON object, keeping raw text");
    }
    input
}

/// Cut `text` to `limit` characters, marking the cut with an ellipsis.
pub fn truncate_for_display(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
