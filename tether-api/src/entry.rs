//! Transcript entries - the externally visible unit of a conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// Token counters for one turn.
///
/// Counters only ever grow: [`TokenUsage::merge`] sums, [`TokenUsage::merge_max`]
/// keeps the larger value per field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Add another usage report to this one.
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(other.cache_read_input_tokens);
    }

    /// Raise each counter to at least the value in `other`.
    pub fn merge_max(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .max(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .max(other.cache_read_input_tokens);
    }

    pub fn is_empty(&self) -> bool {
        *self == TokenUsage::default()
    }

    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_input_tokens)
            .saturating_add(self.cache_read_input_tokens)
    }
}

/// Input object of a tool invocation.
///
/// Serialized as `{"parsed": {...}}` or `{"raw": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolInput {
    /// The accumulated fragments formed a JSON object.
    Parsed(Map<String, Value>),
    /// The accumulated fragments did not parse; kept verbatim.
    Raw(String),
}

impl ToolInput {
    /// Interpret the joined input fragments of a tool block.
    ///
    /// Blank input is an empty object (tools without arguments stream nothing).
    pub fn parse(text: &str) -> Self {
        if text.trim().is_empty() {
            return ToolInput::Parsed(Map::new());
        }
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => ToolInput::Parsed(map),
            _ => ToolInput::Raw(text.to_string()),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, ToolInput::Raw(_))
    }

    /// The input as a plain JSON value; raw input becomes `{"raw": text}`.
    pub fn to_value(&self) -> Value {
        match self {
            ToolInput::Parsed(map) => Value::Object(map.clone()),
            ToolInput::Raw(text) => {
                let mut map = Map::new();
                map.insert("raw".to_string(), Value::String(text.clone()));
                Value::Object(map)
            }
        }
    }
}

/// One entry of a conversation transcript.
///
/// Assistant entries may be emitted several times with `is_partial = true`;
/// each emission supersedes the previous one with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<ToolInput>,
    /// Raw tool result payload, untruncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Turn cost in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Reasoning text streamed alongside an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default)]
    pub is_partial: bool,
}

impl TranscriptEntry {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
            is_error: false,
            usage: None,
            cost: None,
            thinking: None,
            is_partial: false,
        }
    }

    /// A system entry with a fresh id.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), Role::System, content)
    }

    /// A system entry flagged as an error.
    pub fn system_error(content: impl Into<String>) -> Self {
        Self::system(content).with_error(true)
    }

    pub fn partial(mut self, is_partial: bool) -> Self {
        self.is_partial = is_partial;
        self
    }

    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, input: Option<ToolInput>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_input = input;
        self
    }

    pub fn with_tool_result(mut self, result: Value) -> Self {
        self.tool_result = Some(result);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_cost(mut self, cost: Option<f64>) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_thinking(mut self, thinking: Option<String>) -> Self {
        self.thinking = thinking.filter(|t| !t.is_empty());
        self
    }

    /// Whether this emission is the last one for its id.
    pub fn is_final(&self) -> bool {
        !self.is_partial
    }
}
