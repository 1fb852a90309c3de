//! Events a conversation publishes to its observers (UI, logs).

use crate::TranscriptEntry;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-chosen identifier of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one spawned subprocess, unique within a running coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Recoverable stream problems. Processing always continues after one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// Non-protocol output exceeded the extractor ceiling and was dropped.
    BufferOverflow { discarded_bytes: usize },
    /// An extracted object could not be parsed, even after stripping ANSI codes.
    ParseFailure { raw: String, error: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::BufferOverflow { discarded_bytes } => {
                write!(f, "discarded {discarded_bytes} bytes of non-protocol output")
            }
            Diagnostic::ParseFailure { error, .. } => write!(f, "unparseable event: {error}"),
        }
    }
}

/// Everything observers of a conversation get to see, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConversationEvent {
    /// A transcript entry, partial or final. Replace by id.
    Entry {
        conversation: ConversationId,
        entry: TranscriptEntry,
    },

    /// The agent reported the id used to resume this conversation.
    ResumeCaptured {
        conversation: ConversationId,
        resume_id: String,
    },

    /// A subprocess was spawned for a turn.
    ProcessStarted {
        conversation: ConversationId,
        process: ProcessId,
    },

    /// The subprocess exited on its own.
    ProcessExited {
        conversation: ConversationId,
        process: ProcessId,
        code: Option<i32>,
    },

    /// The subprocess was killed (stop, or superseded by a new send).
    ProcessKilled {
        conversation: ConversationId,
        process: ProcessId,
    },

    Diagnostic {
        conversation: ConversationId,
        diagnostic: Diagnostic,
    },
}

impl ConversationEvent {
    pub fn conversation(&self) -> &ConversationId {
        match self {
            ConversationEvent::Entry { conversation, .. }
            | ConversationEvent::ResumeCaptured { conversation, .. }
            | ConversationEvent::ProcessStarted { conversation, .. }
            | ConversationEvent::ProcessExited { conversation, .. }
            | ConversationEvent::ProcessKilled { conversation, .. }
            | ConversationEvent::Diagnostic { conversation, .. } => conversation,
        }
    }

    /// Whether this event ends the lifetime of a process.
    pub fn is_process_end(&self) -> bool {
        matches!(
            self,
            ConversationEvent::ProcessExited { .. } | ConversationEvent::ProcessKilled { .. }
        )
    }
}
